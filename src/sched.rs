//! Threaded scheduling: per-node and per-chain fork-join over channel slices.
//!
//! Every fork is scoped. Workers borrow disjoint channel ranges of the
//! processes they run and read everything else through shared views; the
//! scope joins them all before the interpreter moves on, so a process never
//! outlives the run that split it.

#![forbid(unsafe_code)]

use crate::config::{EngineConfig, Interpreter, ThreadingMode};
use crate::datum::{DatumId, DatumList, ProcessId};
use crate::error::SimError;
use crate::interp::{run_list, CancelToken, ExecOutcome, Executor, Lane, Resume};
use crate::invariant_ppt::{assert_invariant, BARRIER_COMPLETE, SERIAL_FALLBACK, VIEW_RESTORED};
use crate::process::{LanePart, Process};
use crate::signal::{distribute_channels, ChannelSlice, Signal};
use crate::simulation::Simulation;
use std::io;
use std::thread;

/// Runs simulations according to an [`EngineConfig`].
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    config: EngineConfig,
}

impl Scheduler {
    pub fn new(config: EngineConfig) -> Result<Self, SimError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn set_num_threads(&mut self, num_threads: usize) -> Result<(), SimError> {
        if num_threads == 0 {
            return Err(SimError::config("thread count must be at least 1"));
        }
        self.config.num_threads = num_threads;
        Ok(())
    }

    pub fn set_thread_mode(&mut self, mode: ThreadingMode) {
        self.config.thread_mode = mode;
    }

    pub fn set_interpreter(&mut self, interpreter: Interpreter) {
        self.config.interpreter = interpreter;
    }

    /// Run one full pass over `sim`.
    ///
    /// Prepares every process, segments channel chains when running per
    /// chain, then walks the list. `cancel` is polled between top-level
    /// instructions; work already started always completes.
    pub fn execute(
        &self,
        sim: &mut Simulation,
        cancel: Option<&CancelToken>,
    ) -> Result<ExecOutcome, SimError> {
        sim.prepare()?;

        let threads = match self.config.interpreter {
            Interpreter::Standard => 1,
            Interpreter::Threaded => self.config.num_threads.max(1),
        };
        let mode = self.config.thread_mode;
        if threads > 1 && mode == ThreadingMode::PerChain {
            let chains = sim.determine_chains();
            log::debug!("segmented list into {} channel chains", chains.len());
        }

        let (list, processes) = sim.parts_mut();
        let mut dispatch = Dispatch {
            processes,
            threads,
            mode,
        };
        let outcome = run_list(list, list.head(), None, &mut dispatch, cancel)?;
        log::debug!(
            "pass finished after {} steps{}",
            outcome.steps,
            if outcome.cancelled { " (cancelled)" } else { "" }
        );
        Ok(outcome)
    }
}

/// Executor that decides, per instruction, how many workers to fork.
struct Dispatch<'p> {
    processes: &'p mut [Process],
    threads: usize,
    mode: ThreadingMode,
}

impl Dispatch<'_> {
    /// Slices for one node; a single full slice means run serially.
    fn node_slices(&mut self, id: ProcessId) -> Result<Vec<ChannelSlice>, SimError> {
        let threads = self.threads;
        let process = self
            .processes
            .get_mut(id.0)
            .ok_or_else(|| SimError::config(format!("no process instance {}", id.0)))?;
        let channels = process.num_channels();
        let serial = vec![ChannelSlice::full(channels)];
        if threads < 2 || !process.thread_mode().allows_node_threading() || channels < 2 {
            return Ok(serial);
        }

        let slices = distribute_channels(channels, threads);
        if let Err(e) = process.init_thread_copies(&slices) {
            log::warn!("'{}': {}; running serially", process.label(), e);
            assert_invariant(SERIAL_FALLBACK, true, "copy setup failed, node runs serially", Some(process.label()));
            return Ok(serial);
        }
        log::debug!("'{}': {} channels on {} workers", process.label(), channels, slices.len());
        Ok(slices)
    }
}

impl Executor for Dispatch<'_> {
    fn run_process(&mut self, process: ProcessId) -> Result<(), SimError> {
        let slices = self.node_slices(process)?;
        fork_join(self.processes, &[process], &slices, |lane| lane.run_process(process))
    }

    fn reset_process(&mut self, process: ProcessId) -> Result<(), SimError> {
        match self.processes.get_mut(process.0) {
            Some(p) => p.reset(),
            None => Err(SimError::config(format!("no process instance {}", process.0))),
        }
    }

    fn run_chain(&mut self, list: &DatumList, at: DatumId) -> Result<Option<Resume>, SimError> {
        if self.mode != ThreadingMode::PerChain || self.threads < 2 {
            return Ok(None);
        }
        let Some(span) = list.get(at).and_then(|d| d.chain.as_ref()) else {
            return Ok(None);
        };
        if span.members.len() < 2 || span.channels < 2 {
            return Ok(None);
        }

        let mut slices = distribute_channels(span.channels, self.threads);
        for member in &span.members {
            let Some(p) = self.processes.get_mut(member.0) else {
                return Err(SimError::config(format!("no process instance {}", member.0)));
            };
            if let Err(e) = p.init_thread_copies(&slices) {
                log::warn!("chain at {}: '{}': {}; running serially", at.0, p.label(), e);
                assert_invariant(SERIAL_FALLBACK, true, "copy setup failed, chain runs serially", Some(p.label()));
                slices = vec![ChannelSlice::full(span.channels)];
                break;
            }
        }
        if slices.len() < 2 {
            for member in &span.members {
                if let Some(p) = self.processes.get_mut(member.0) {
                    p.free_thread_copies();
                }
            }
        }
        log::debug!(
            "chain at {}: {} members on {} workers",
            at.0,
            span.members.len(),
            slices.len()
        );

        let passed = span.passed_thread_end;
        fork_join(self.processes, &span.members, &slices, |lane| {
            run_list(list, Some(at), passed, lane, None).map(|_| ())
        })?;
        Ok(Some(Resume(passed)))
    }
}

fn worker_builder(index: usize) -> io::Result<thread::Builder> {
    Ok(thread::Builder::new().name(format!("simchain-worker-{}", index)))
}

/// Fork one worker per slice over `members`, run `work` on each, join.
///
/// Worker 0 runs on the calling thread. Whatever happens, every member's
/// view bookkeeping is restored before this returns.
pub(crate) fn fork_join<F>(
    processes: &mut [Process],
    members: &[ProcessId],
    slices: &[ChannelSlice],
    work: F,
) -> Result<(), SimError>
where
    F: Fn(&mut Lane<'_>) -> Result<(), SimError> + Sync,
{
    fork_join_with(processes, members, slices, work, &worker_builder)
}

/// [`fork_join`] with the thread builder for worker `i` supplied by `builder`.
fn fork_join_with<F>(
    processes: &mut [Process],
    members: &[ProcessId],
    slices: &[ChannelSlice],
    work: F,
    builder: &dyn Fn(usize) -> io::Result<thread::Builder>,
) -> Result<(), SimError>
where
    F: Fn(&mut Lane<'_>) -> Result<(), SimError> + Sync,
{
    let result = split_and_run(processes, members, slices, &work, builder);
    for member in members {
        if let Some(p) = processes.get_mut(member.0) {
            p.restore();
        }
    }
    assert_invariant(
        VIEW_RESTORED,
        members
            .iter()
            .filter_map(|m| processes.get(m.0))
            .all(|p| p.output().is_restored() && !p.is_thread_run()),
        "primary views restored after the join",
        None,
    );
    result
}

fn split_and_run<F>(
    processes: &mut [Process],
    members: &[ProcessId],
    slices: &[ChannelSlice],
    work: &F,
    builder: &dyn Fn(usize) -> io::Result<thread::Builder>,
) -> Result<(), SimError>
where
    F: Fn(&mut Lane<'_>) -> Result<(), SimError> + Sync,
{
    let n = processes.len();
    let mut is_member = vec![false; n];
    for m in members {
        match is_member.get_mut(m.0) {
            Some(flag) => *flag = true,
            None => return Err(SimError::config(format!("no process instance {}", m.0))),
        }
    }

    let mut external: Vec<Option<&Signal>> = vec![None; n];
    let mut slots: Vec<Vec<Option<LanePart<'_>>>> = (0..slices.len())
        .map(|_| (0..n).map(|_| None).collect())
        .collect();
    for (i, process) in processes.iter_mut().enumerate() {
        if is_member[i] {
            for (lane, part) in process.split_lanes(slices)?.into_iter().enumerate() {
                slots[lane][i] = Some(part);
            }
        } else {
            let process: &Process = process;
            external[i] = Some(process.output());
        }
    }

    let external = external.as_slice();
    let mut lanes: Vec<Lane<'_>> = slots
        .into_iter()
        .enumerate()
        .map(|(index, slots)| Lane::new(index, slots, external))
        .collect();

    if lanes.len() <= 1 {
        return match lanes.first_mut() {
            Some(lane) => work(lane),
            None => Ok(()),
        };
    }

    let rest = lanes.split_off(1);
    let mut first = lanes.pop();
    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(rest.len());
        let mut spawn_error = None;
        for (offset, mut lane) in rest.into_iter().enumerate() {
            let index = offset + 1;
            let spawned = builder(index).and_then(|b| b.spawn_scoped(scope, move || work(&mut lane)));
            match spawned {
                Ok(handle) => handles.push((index, handle)),
                Err(source) => {
                    log::error!("failed to spawn worker {}: {}", index, source);
                    spawn_error = Some(SimError::ThreadCreation { index, source });
                    break;
                }
            }
        }

        let mut result = match (spawn_error, first.as_mut()) {
            (Some(e), _) => Err(e),
            (None, Some(lane)) => work(lane),
            (None, None) => Ok(()),
        };

        let spawned = handles.len();
        let mut joined = 0;
        for (index, handle) in handles {
            let outcome = handle.join().unwrap_or_else(|_| Err(SimError::WorkerPanicked(index)));
            joined += 1;
            match outcome {
                Err(e) if result.is_ok() => result = Err(e),
                Err(e) => log::error!("worker {} also failed: {}", index, e),
                Ok(()) => {}
            }
        }
        assert_invariant(BARRIER_COMPLETE, joined == spawned, "every worker joined", None);
        result
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::SimBuilder;
    use crate::harness::{Gain, Ramp};

    fn chain_sim(channels: usize) -> Simulation {
        let mut b = SimBuilder::new();
        b.process_named("src", Ramp::new(channels, 16)).unwrap();
        b.process_named("g1", Gain::new(2.0)).unwrap();
        b.process_named("g2", Gain::new(0.5)).unwrap();
        b.connect("src", "g1").unwrap();
        b.connect("g1", "g2").unwrap();
        b.build().unwrap()
    }

    #[test]
    fn zero_threads_rejected() {
        let mut s = Scheduler::default();
        assert!(matches!(s.set_num_threads(0), Err(SimError::Configuration(_))));
        assert!(Scheduler::new(EngineConfig::default().with_num_threads(0)).is_err());
    }

    #[test]
    fn per_node_threads_restore_views() {
        let mut sim = chain_sim(7);
        let s = Scheduler::new(EngineConfig::default().with_num_threads(3)).unwrap();
        s.execute(&mut sim, None).unwrap();
        for p in sim.processes() {
            assert!(p.output().is_restored());
            assert!(!p.is_thread_run());
        }
        let g1 = sim.process_by_label("g1").unwrap();
        assert_eq!(g1.thread_copies().len(), 2);
    }

    #[test]
    fn per_chain_reports_chains() {
        let mut sim = chain_sim(4);
        let s = Scheduler::new(
            EngineConfig::default()
                .with_num_threads(2)
                .with_thread_mode(ThreadingMode::PerChain),
        )
        .unwrap();
        s.execute(&mut sim, None).unwrap();
        let chains = sim.chains();
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].1.members.len(), 3);
    }

    #[test]
    fn spawn_failure_is_fatal_and_restores_views() {
        let mut sim = chain_sim(6);
        sim.prepare().unwrap();
        let g1 = ProcessId(1);
        let slices = distribute_channels(6, 3);
        let (_, processes) = sim.parts_mut();
        processes[g1.0].init_thread_copies(&slices).unwrap();

        let refuse_second = |index: usize| {
            if index == 2 {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "no more threads"))
            } else {
                worker_builder(index)
            }
        };
        let err = fork_join_with(
            processes,
            &[g1],
            &slices,
            |lane| lane.run_process(g1),
            &refuse_second,
        )
        .unwrap_err();
        assert!(matches!(err, SimError::ThreadCreation { index: 2, .. }));
        assert!(processes[g1.0].output().is_restored());
        assert!(!processes[g1.0].is_thread_run());
    }

    #[test]
    fn worker_error_is_reported_after_join() {
        let mut sim = chain_sim(4);
        sim.prepare().unwrap();
        let slices = distribute_channels(4, 2);
        let (_, processes) = sim.parts_mut();
        processes[1].init_thread_copies(&slices).unwrap();
        let err = fork_join(processes, &[ProcessId(1)], &slices, |lane| {
            lane.run_process(ProcessId(0))
        })
        .unwrap_err();
        assert!(matches!(err, SimError::Configuration(_)));
        assert!(processes.iter().all(|p| p.output().is_restored()));
    }

    #[test]
    fn standard_interpreter_ignores_thread_count() {
        let mut sim = chain_sim(4);
        let s = Scheduler::new(
            EngineConfig::default()
                .with_num_threads(4)
                .with_interpreter(Interpreter::Standard),
        )
        .unwrap();
        s.execute(&mut sim, None).unwrap();
        assert!(sim.processes().iter().all(|p| p.thread_copies().is_empty()));
    }
}

//! The standard interpreter: walks a Datum list one instruction at a time.
//!
//! The walk itself knows nothing about threads. What a Process or Reset
//! instruction does is delegated to an [`Executor`]; the threaded scheduler
//! is one executor, a [`Lane`] (a single worker's view of the processes) is
//! another.

use crate::datum::{DatumId, DatumKind, DatumList, ProcessId};
use crate::error::SimError;
use crate::invariant_ppt::{assert_invariant, CANCEL_AT_BOUNDARY, FAIL_FAST, REPEAT_COUNT_VALID};
use crate::process::LanePart;
use crate::signal::{Signal, SignalView};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag, polled between top-level instructions.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear a previous request so the token can drive another run.
    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Where a walk ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    /// The Stop instruction, the exclusive end, the instruction that was
    /// about to run when cancellation was observed, or `None` at list end.
    pub last: Option<DatumId>,
    pub cancelled: bool,
    /// Instructions completed at this walk level.
    pub steps: usize,
}

/// Resume position after an executor ran a whole chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Resume(pub Option<DatumId>);

pub(crate) trait Executor {
    fn run_process(&mut self, process: ProcessId) -> Result<(), SimError>;

    fn reset_process(&mut self, process: ProcessId) -> Result<(), SimError>;

    /// Run the channel chain starting at `at` as one unit, if applicable.
    fn run_chain(&mut self, _list: &DatumList, _at: DatumId) -> Result<Option<Resume>, SimError> {
        Ok(None)
    }
}

/// Walk `[start, passed_end)`, stopping early at a Stop instruction.
///
/// `cancel` is only consulted between instructions of this walk; nested
/// repeat bodies are always run to completion.
pub(crate) fn run_list<E: Executor + ?Sized>(
    list: &DatumList,
    start: Option<DatumId>,
    passed_end: Option<DatumId>,
    exec: &mut E,
    cancel: Option<&CancelToken>,
) -> Result<ExecOutcome, SimError> {
    let mut pc = start;
    let mut steps = 0;
    while let Some(id) = pc {
        if Some(id) == passed_end {
            break;
        }
        if cancel.is_some_and(CancelToken::is_cancelled) {
            log::info!("cancellation observed before instruction {}", id.0);
            assert_invariant(
                CANCEL_AT_BOUNDARY,
                true,
                "cancellation observed at an instruction boundary",
                None,
            );
            return Ok(ExecOutcome {
                last: Some(id),
                cancelled: true,
                steps,
            });
        }

        let datum = list
            .get(id)
            .ok_or_else(|| SimError::config(format!("dangling instruction index {}", id.0)))?;

        if let Some(Resume(next)) = exec.run_chain(list, id)? {
            pc = next;
            steps += 1;
            continue;
        }

        match &datum.kind {
            DatumKind::Process { process, on, .. } => {
                if *on {
                    if let Err(e) = exec.run_process(*process) {
                        log::error!("aborting walk at instruction {}: {}", id.0, e);
                        assert_invariant(FAIL_FAST, true, "walk aborted on failure", None);
                        return Err(e);
                    }
                }
                pc = datum.next;
            }
            DatumKind::Repeat { count, stop_pc } => {
                let label = datum.label.as_deref().unwrap_or("?");
                if *count == 0 {
                    return Err(SimError::config(format!("repeat '{}' has a zero count", label)));
                }
                let stop = stop_pc.ok_or_else(|| {
                    SimError::config(format!("repeat '{}' has no stop marker", label))
                })?;
                assert_invariant(
                    REPEAT_COUNT_VALID,
                    *count > 0,
                    "repeat count checked before the body runs",
                    Some(label),
                );
                for _ in 0..*count {
                    run_list(list, datum.next, Some(stop), exec, None)?;
                }
                pc = list.get(stop).and_then(|d| d.next);
            }
            DatumKind::Reset { target, resolved } => {
                let target_id = resolved
                    .ok_or_else(|| SimError::config(format!("reset target '{}' unresolved", target)))?;
                if let Some(DatumKind::Process { process, on: true, .. }) =
                    list.get(target_id).map(|d| &d.kind)
                {
                    exec.reset_process(*process)?;
                }
                pc = datum.next;
            }
            DatumKind::Stop => {
                return Ok(ExecOutcome {
                    last: Some(id),
                    cancelled: false,
                    steps,
                });
            }
        }
        steps += 1;
    }

    Ok(ExecOutcome {
        last: pc,
        cancelled: false,
        steps,
    })
}

/// One worker's share of the processes it may run.
///
/// `slots[i]` holds process `i` when this worker owns a channel range of it;
/// every other process is reachable read-only through `external`.
pub(crate) struct Lane<'a> {
    thread_index: usize,
    slots: Vec<Option<LanePart<'a>>>,
    external: &'a [Option<&'a Signal>],
}

impl<'a> Lane<'a> {
    pub(crate) fn new(
        thread_index: usize,
        slots: Vec<Option<LanePart<'a>>>,
        external: &'a [Option<&'a Signal>],
    ) -> Self {
        Self {
            thread_index,
            slots,
            external,
        }
    }

    fn input_view(&self, id: ProcessId) -> Result<SignalView<'_>, SimError> {
        if let Some(signal) = self.external.get(id.0).copied().flatten() {
            return Ok(signal.view());
        }
        match self.slots.get(id.0) {
            Some(Some(part)) => Ok(part.output.as_view()),
            _ => Err(SimError::config(format!(
                "input process {} is not visible to worker {}",
                id.0, self.thread_index
            ))),
        }
    }

    fn take_part(&mut self, id: ProcessId) -> Result<LanePart<'a>, SimError> {
        self.slots
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or_else(|| {
                SimError::config(format!(
                    "process {} is not scheduled on worker {}",
                    id.0, self.thread_index
                ))
            })
    }

    fn run_part(&self, part: &mut LanePart<'a>) -> Result<(), SimError> {
        let inputs = part
            .inputs
            .iter()
            .map(|&i| self.input_view(i))
            .collect::<Result<Vec<_>, _>>()?;
        part.module
            .run_dyn(
                &inputs,
                &mut part.output,
                &mut *part.states,
                &mut *part.rng,
                self.thread_index,
            )
            .map_err(|source| SimError::ProcessRun {
                label: part.label.to_string(),
                source,
            })
    }
}

impl Executor for Lane<'_> {
    fn run_process(&mut self, process: ProcessId) -> Result<(), SimError> {
        let mut part = self.take_part(process)?;
        let result = self.run_part(&mut part);
        self.slots[process.0] = Some(part);
        result
    }

    fn reset_process(&mut self, process: ProcessId) -> Result<(), SimError> {
        let mut part = self.take_part(process)?;
        let result = part
            .module
            .reset_dyn(&mut *part.states)
            .map_err(|source| SimError::ProcessRun {
                label: part.label.to_string(),
                source,
            });
        self.slots[process.0] = Some(part);
        result
    }
}

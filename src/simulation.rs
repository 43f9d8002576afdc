//! A built simulation: the instruction list plus the processes it drives.

#![forbid(unsafe_code)]

use crate::chain::determine_channel_chains;
use crate::datum::{ChainSpan, DatumId, DatumKind, DatumList, ProcessId};
use crate::error::{BuildError, SimError};
use crate::process::Process;
use crate::signal::SignalShape;

/// Instruction list and process instances, indexed by [`ProcessId`].
#[derive(Debug)]
pub struct Simulation {
    list: DatumList,
    processes: Vec<Process>,
}

impl Simulation {
    pub(crate) fn new(list: DatumList, processes: Vec<Process>) -> Self {
        Self { list, processes }
    }

    pub fn list(&self) -> &DatumList {
        &self.list
    }

    pub fn processes(&self) -> &[Process] {
        &self.processes
    }

    pub fn process(&self, id: ProcessId) -> Option<&Process> {
        self.processes.get(id.0)
    }

    pub fn process_mut(&mut self, id: ProcessId) -> Option<&mut Process> {
        self.processes.get_mut(id.0)
    }

    /// Instruction labelled `label`.
    pub fn find(&self, label: &str) -> Option<DatumId> {
        self.list.find(label)
    }

    pub fn process_by_label(&self, label: &str) -> Option<&Process> {
        let id = self.label_to_process(label)?;
        self.processes.get(id.0)
    }

    pub fn process_by_label_mut(&mut self, label: &str) -> Option<&mut Process> {
        let id = self.label_to_process(label)?;
        self.processes.get_mut(id.0)
    }

    fn label_to_process(&self, label: &str) -> Option<ProcessId> {
        self.list.get(self.list.find(label)?)?.process()
    }

    pub fn set_enabled(&mut self, label: &str, enabled: bool) -> Result<(), SimError> {
        self.list.set_enabled(label, enabled)?;
        log::debug!("'{}' {}", label, if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    /// Feed the output of `from` into `to`. Takes effect on the next run.
    pub fn connect(&mut self, from: &str, to: &str) -> Result<(), SimError> {
        let (from_id, to_id) = self.list.connect(from, to)?;
        let target = self
            .processes
            .get_mut(to_id.0)
            .ok_or_else(|| BuildError::UnknownLabel(to.to_string()))?;
        target.add_input(from_id);
        Ok(())
    }

    /// Channel chains found by the last per-chain run, in list order.
    pub fn chains(&self) -> Vec<(DatumId, &ChainSpan)> {
        self.list
            .iter()
            .filter_map(|(id, d)| d.chain.as_ref().map(|c| (id, c)))
            .collect()
    }

    /// Reset the state of every process.
    pub fn reset_all(&mut self) -> Result<(), SimError> {
        self.processes.iter_mut().try_for_each(Process::reset)
    }

    /// Prepare every process in list order.
    ///
    /// A process's inputs must already be prepared when it is reached, so a
    /// consumer listed before its producer is a configuration error.
    pub(crate) fn prepare(&mut self) -> Result<(), SimError> {
        let order: Vec<ProcessId> = self.list.process_ids().collect();
        for id in order {
            let process = self
                .processes
                .get(id.0)
                .ok_or_else(|| SimError::config(format!("no process instance {}", id.0)))?;
            let shapes = process
                .inputs()
                .iter()
                .map(|input| self.output_shape_of(*input, process.label()))
                .collect::<Result<Vec<_>, _>>()?;
            self.processes[id.0].pre_thread_init(&shapes)?;
        }
        Ok(())
    }

    fn output_shape_of(&self, input: ProcessId, consumer: &str) -> Result<SignalShape, SimError> {
        self.processes
            .get(input.0)
            .and_then(|p| p.output().shape())
            .ok_or_else(|| {
                SimError::config(format!(
                    "input {} of '{}' is not prepared before it is read",
                    input.0, consumer
                ))
            })
    }

    pub(crate) fn determine_chains(&mut self) -> Vec<(DatumId, ChainSpan)> {
        determine_channel_chains(&mut self.list, &self.processes)
    }

    pub(crate) fn parts_mut(&mut self) -> (&DatumList, &mut [Process]) {
        (&self.list, &mut self.processes)
    }

    /// Labels of the repeats whose bodies can run inside a chain.
    pub fn thread_safe_repeats(&self) -> Vec<&str> {
        self.list
            .iter()
            .filter(|(_, d)| d.thread_safe && matches!(d.kind, DatumKind::Repeat { .. }))
            .filter_map(|(_, d)| d.label.as_deref())
            .collect()
    }
}

impl Drop for Simulation {
    fn drop(&mut self) {
        for process in &mut self.processes {
            process.free();
        }
    }
}

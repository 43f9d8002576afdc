//! DSL module: builder API for simulations.
//!
//! Processes are appended in execution order. Connections name processes
//! that already exist; reset targets may be declared later and are resolved
//! in [`SimBuilder::build`].

use crate::datum::{DatumId, DatumKind, DatumList, ProcessId};
use crate::error::BuildError;
use crate::invariant_ppt::{assert_invariant, LABELS_UNIQUE, LOOP_TERMINATED};
use crate::module::{Module, ModuleDyn};
use crate::process::Process;
use crate::simulation::Simulation;
use std::collections::HashSet;
use std::sync::Arc;

/// Handle to a process in the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle(pub ProcessId);

/// The simulation builder.
#[derive(Debug, Default)]
pub struct SimBuilder {
    list: DatumList,
    processes: Vec<Process>,
    open_repeats: Vec<(DatumId, String)>,
    resets: Vec<DatumId>,
    seed: u64,
    repeat_count: usize,
    reset_count: usize,
}

impl SimBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Base seed; process `i` is seeded `seed + (i << 16)`.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Add a process labelled `p<n>`.
    pub fn process(&mut self, module: impl Module) -> Result<ProcessHandle, BuildError> {
        let label = self.fresh_label("p", self.processes.len());
        self.process_dyn(&label, Arc::new(module))
    }

    pub fn process_named(&mut self, label: &str, module: impl Module) -> Result<ProcessHandle, BuildError> {
        self.process_dyn(label, Arc::new(module))
    }

    /// Add a process around an already shared module.
    pub fn process_dyn(&mut self, label: &str, module: Arc<dyn ModuleDyn>) -> Result<ProcessHandle, BuildError> {
        let id = ProcessId(self.processes.len());
        self.list.push(
            Some(label.to_string()),
            DatumKind::Process {
                process: id,
                inputs: Vec::new(),
                outputs: Vec::new(),
                on: true,
            },
        )?;
        let seed = self.seed.wrapping_add((id.0 as u64) << 16);
        self.processes.push(Process::new(label, module, seed));
        Ok(ProcessHandle(id))
    }

    /// Feed the output of `from` into `to`.
    pub fn connect(&mut self, from: &str, to: &str) -> Result<(), BuildError> {
        let (from_id, to_id) = self.list.connect(from, to)?;
        self.processes[to_id.0].add_input(from_id);
        Ok(())
    }

    /// Open a repeat labelled `r<n>` running its body `count` times.
    pub fn repeat(&mut self, count: usize) -> Result<DatumId, BuildError> {
        let label = self.fresh_label("r", self.repeat_count);
        self.repeat_named(&label, count)
    }

    pub fn repeat_named(&mut self, label: &str, count: usize) -> Result<DatumId, BuildError> {
        let id = self
            .list
            .push(Some(label.to_string()), DatumKind::Repeat { count, stop_pc: None })?;
        self.repeat_count += 1;
        self.open_repeats.push((id, label.to_string()));
        Ok(id)
    }

    /// Close the innermost open repeat with its stop marker.
    pub fn end_repeat(&mut self) -> Result<DatumId, BuildError> {
        let (repeat, _) = self.open_repeats.pop().ok_or(BuildError::UnbalancedRepeat)?;
        let stop = self.list.push(None, DatumKind::Stop)?;
        if let Some(DatumKind::Repeat { stop_pc, .. }) = self.list.get_mut(repeat).map(|d| &mut d.kind) {
            *stop_pc = Some(stop);
        }
        Ok(stop)
    }

    /// Reset the state of `target` when reached, labelled `x<n>`.
    pub fn reset(&mut self, target: &str) -> Result<DatumId, BuildError> {
        let label = self.fresh_label("x", self.reset_count);
        let id = self.list.push(
            Some(label),
            DatumKind::Reset {
                target: target.to_string(),
                resolved: None,
            },
        )?;
        self.reset_count += 1;
        self.resets.push(id);
        Ok(id)
    }

    /// First `<prefix><n>`, counting up from `n`, that no instruction uses.
    fn fresh_label(&self, prefix: &str, mut n: usize) -> String {
        loop {
            let label = format!("{}{}", prefix, n);
            if self.list.find(&label).is_none() {
                return label;
            }
            n += 1;
        }
    }

    /// End the walk here.
    pub fn stop(&mut self) -> Result<DatumId, BuildError> {
        self.list.push(None, DatumKind::Stop)
    }

    /// Resolve reset targets and validate the list.
    pub fn build(mut self) -> Result<Simulation, BuildError> {
        if let Some((_, label)) = self.open_repeats.last() {
            return Err(BuildError::UnterminatedRepeat(label.clone()));
        }

        for id in std::mem::take(&mut self.resets) {
            let target = match self.list.get(id).map(|d| &d.kind) {
                Some(DatumKind::Reset { target, .. }) => target.clone(),
                _ => continue,
            };
            let resolved = self
                .list
                .find(&target)
                .ok_or_else(|| BuildError::UnknownLabel(target.clone()))?;
            if !matches!(self.list.get(resolved).map(|d| &d.kind), Some(DatumKind::Process { .. })) {
                return Err(BuildError::NotAProcess(target));
            }
            if let Some(DatumKind::Reset { resolved: slot, .. }) = self.list.get_mut(id).map(|d| &mut d.kind) {
                *slot = Some(resolved);
            }
        }

        let labels: Vec<&str> = self.list.iter().filter_map(|(_, d)| d.label.as_deref()).collect();
        let distinct: HashSet<&str> = labels.iter().copied().collect();
        assert_invariant(LABELS_UNIQUE, distinct.len() == labels.len(), "instruction labels are unique", None);
        assert_invariant(
            LOOP_TERMINATED,
            self.list.iter().all(|(_, d)| match d.kind {
                DatumKind::Repeat { stop_pc, .. } => stop_pc.is_some(),
                _ => true,
            }),
            "every repeat has a stop marker",
            None,
        );

        log::debug!(
            "built simulation: {} instructions, {} processes",
            self.list.len(),
            self.processes.len()
        );
        let SimBuilder { list, processes, .. } = self;
        Ok(Simulation::new(list, processes))
    }
}

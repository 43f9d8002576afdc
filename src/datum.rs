//! Datum module: the simulation instruction list.
//!
//! Instructions live in an arena and link to each other by index. Labels are
//! resolved once, when the list is built, into a label index.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use crate::error::BuildError;
use std::collections::HashMap;

/// Index of an instruction in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatumId(pub usize);

/// Index of a process instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub usize);

/// Instruction variants.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum DatumKind {
    /// Run a process.
    Process {
        /// The process instance this instruction drives.
        process: ProcessId,
        /// Labels of the processes feeding this one.
        inputs: Vec<String>,
        /// Labels of the processes this one feeds.
        outputs: Vec<String>,
        /// Disabled processes are skipped by the interpreter.
        on: bool,
    },
    /// Run the body `[next, stop_pc)` `count` times.
    Repeat {
        /// Number of iterations. Zero is rejected when executed.
        count: usize,
        /// The stop marker closing the body, resolved at build time.
        stop_pc: Option<DatumId>,
    },
    /// Reset the state of a process.
    Reset {
        /// Label of the target process.
        target: String,
        /// The target's Process instruction.
        resolved: Option<DatumId>,
    },
    /// End of a walk.
    Stop,
}

/// Channel chain recorded on the instruction that starts it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainSpan {
    /// First instruction after the chain; `None` means the end of the list.
    pub passed_thread_end: Option<DatumId>,
    /// Every process executed inside the chain, repeat bodies included.
    pub members: Vec<ProcessId>,
    /// Output channel count shared by all members.
    pub channels: usize,
}

/// One instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Datum {
    /// Unique label; `None` only for stop markers.
    pub label: Option<String>,
    /// What the instruction does.
    pub kind: DatumKind,
    /// Following instruction.
    pub next: Option<DatumId>,
    /// Preceding instruction.
    pub previous: Option<DatumId>,
    /// For repeats: the body had no chain break.
    pub thread_safe: bool,
    /// Set on the first instruction of a channel chain.
    pub chain: Option<ChainSpan>,
}

impl Datum {
    /// Process driven by this instruction, if it is a Process instruction.
    pub fn process(&self) -> Option<ProcessId> {
        match &self.kind {
            DatumKind::Process { process, .. } => Some(*process),
            _ => None,
        }
    }

    /// Whether this is an enabled Process instruction.
    pub fn is_enabled(&self) -> bool {
        matches!(self.kind, DatumKind::Process { on: true, .. })
    }
}

/// The instruction list.
#[derive(Debug, Clone, Default)]
pub struct DatumList {
    data: Vec<Datum>,
    labels: HashMap<String, DatumId>,
}

impl DatumList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// First instruction.
    pub fn head(&self) -> Option<DatumId> {
        if self.data.is_empty() {
            None
        } else {
            Some(DatumId(0))
        }
    }

    /// Number of instructions.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the list holds no instructions.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Instruction `id`.
    pub fn get(&self, id: DatumId) -> Option<&Datum> {
        self.data.get(id.0)
    }

    pub(crate) fn get_mut(&mut self, id: DatumId) -> Option<&mut Datum> {
        self.data.get_mut(id.0)
    }

    /// Instruction labelled `label`.
    pub fn find(&self, label: &str) -> Option<DatumId> {
        self.labels.get(label).copied()
    }

    /// Instructions in list order.
    pub fn iter(&self) -> impl Iterator<Item = (DatumId, &Datum)> {
        let mut pc = self.head();
        std::iter::from_fn(move || {
            let id = pc?;
            let datum = self.get(id)?;
            pc = datum.next;
            Some((id, datum))
        })
    }

    /// Process instances in list order, repeat bodies included.
    pub fn process_ids(&self) -> impl Iterator<Item = ProcessId> + '_ {
        self.iter().filter_map(|(_, d)| d.process())
    }

    /// Append an instruction, linking it after the current tail.
    pub(crate) fn push(&mut self, label: Option<String>, kind: DatumKind) -> Result<DatumId, BuildError> {
        let id = DatumId(self.data.len());
        if let Some(label) = &label {
            if self.labels.contains_key(label) {
                return Err(BuildError::DuplicateLabel(label.clone()));
            }
            self.labels.insert(label.clone(), id);
        }
        let previous = id.0.checked_sub(1).map(DatumId);
        if let Some(prev) = previous {
            self.data[prev.0].next = Some(id);
        }
        self.data.push(Datum {
            label,
            kind,
            next: None,
            previous,
            thread_safe: false,
            chain: None,
        });
        Ok(id)
    }

    /// Forget all chain segmentation results.
    pub(crate) fn clear_chains(&mut self) {
        for datum in &mut self.data {
            datum.chain = None;
            datum.thread_safe = false;
        }
    }

    /// Enable or disable the process labelled `label`.
    pub(crate) fn set_enabled(&mut self, label: &str, enabled: bool) -> Result<(), BuildError> {
        let id = self
            .find(label)
            .ok_or_else(|| BuildError::UnknownLabel(label.to_string()))?;
        match &mut self.data[id.0].kind {
            DatumKind::Process { on, .. } => {
                *on = enabled;
                Ok(())
            }
            _ => Err(BuildError::NotAProcess(label.to_string())),
        }
    }

    /// Record a connection `from -> to` on both Process instructions.
    pub(crate) fn connect(&mut self, from: &str, to: &str) -> Result<(ProcessId, ProcessId), BuildError> {
        if from == to {
            return Err(BuildError::SelfConnection(from.to_string()));
        }
        let from_id = self.process_datum(from)?;
        let to_id = self.process_datum(to)?;
        let (from_pid, to_pid) = match (&self.data[from_id.0].kind, &self.data[to_id.0].kind) {
            (DatumKind::Process { process: f, .. }, DatumKind::Process { process: t, .. }) => (*f, *t),
            _ => return Err(BuildError::NotAProcess(from.to_string())),
        };
        if let DatumKind::Process { outputs, .. } = &mut self.data[from_id.0].kind {
            outputs.push(to.to_string());
        }
        if let DatumKind::Process { inputs, .. } = &mut self.data[to_id.0].kind {
            inputs.push(from.to_string());
        }
        Ok((from_pid, to_pid))
    }

    fn process_datum(&self, label: &str) -> Result<DatumId, BuildError> {
        let id = self
            .find(label)
            .ok_or_else(|| BuildError::UnknownLabel(label.to_string()))?;
        match self.data[id.0].kind {
            DatumKind::Process { .. } => Ok(id),
            _ => Err(BuildError::NotAProcess(label.to_string())),
        }
    }
}

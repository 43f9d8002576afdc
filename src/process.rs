//! Process instances and their per-thread copies.
//!
//! A process owns one output signal, per-channel module state and an RNG.
//! When it runs on `T` threads it keeps `T - 1` [`ThreadCopy`] records; the
//! first thread works on the process itself. A copy never duplicates the
//! module: it holds only the worker's channel slice and private RNG.

#![forbid(unsafe_code)]

use crate::datum::ProcessId;
use crate::error::{SimError, SignalError};
use crate::invariant_ppt::{assert_invariant, THREAD_COPY_COUNT};
use crate::module::{ModuleDyn, ThreadMode};
use crate::signal::{ChannelSlice, Signal, SignalShape, SignalViewMut};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Execution state private to thread `index >= 1`.
#[derive(Debug)]
pub struct ThreadCopy {
    pub index: usize,
    pub slice: ChannelSlice,
    pub rng: StdRng,
}

/// One stage of the simulation.
pub struct Process {
    label: String,
    module: Arc<dyn ModuleDyn>,
    inputs: Vec<ProcessId>,
    output: Signal,
    states: Vec<Box<dyn Any + Send>>,
    base_seed: u64,
    rng: StdRng,
    thread_copies: Vec<ThreadCopy>,
    max_thread_copies: Option<usize>,
    thread_run: bool,
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("label", &self.label)
            .field("module", &self.module.name())
            .field("inputs", &self.inputs)
            .field("channels", &self.output.orig_num_channels())
            .field("thread_copies", &self.thread_copies.len())
            .finish()
    }
}

/// The pieces of a process one worker may touch.
pub(crate) struct LanePart<'a> {
    pub label: &'a str,
    pub module: &'a dyn ModuleDyn,
    pub inputs: &'a [ProcessId],
    pub output: SignalViewMut<'a>,
    pub states: &'a mut [Box<dyn Any + Send>],
    pub rng: &'a mut StdRng,
}

impl Process {
    pub fn new(label: impl Into<String>, module: Arc<dyn ModuleDyn>, base_seed: u64) -> Self {
        Self {
            label: label.into(),
            module,
            inputs: Vec::new(),
            output: Signal::default(),
            states: Vec::new(),
            base_seed,
            rng: StdRng::seed_from_u64(base_seed),
            thread_copies: Vec::new(),
            max_thread_copies: None,
            thread_run: false,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn module(&self) -> &dyn ModuleDyn {
        self.module.as_ref()
    }

    pub fn thread_mode(&self) -> ThreadMode {
        self.module.thread_mode()
    }

    pub fn inputs(&self) -> &[ProcessId] {
        &self.inputs
    }

    pub(crate) fn add_input(&mut self, input: ProcessId) {
        self.inputs.push(input);
    }

    pub fn output(&self) -> &Signal {
        &self.output
    }

    /// Direct access to the output, for drivers seeding source data.
    pub fn output_mut(&mut self) -> &mut Signal {
        &mut self.output
    }

    /// Output channel count; zero before the first preparation.
    pub fn num_channels(&self) -> usize {
        self.output.orig_num_channels()
    }

    pub fn base_seed(&self) -> u64 {
        self.base_seed
    }

    pub fn thread_copies(&self) -> &[ThreadCopy] {
        &self.thread_copies
    }

    /// True while a threaded run is using this process.
    pub fn is_thread_run(&self) -> bool {
        self.thread_run
    }

    /// Prepare the process for a run without threading.
    ///
    /// Applies the parameter hook, then (re)allocates the output signal and
    /// per-channel state if the module's output shape changed. Returns true
    /// when anything was reallocated.
    pub fn pre_thread_init(&mut self, input_shapes: &[SignalShape]) -> Result<bool, SimError> {
        let run_err = |source| SimError::ProcessRun {
            label: self.label.clone(),
            source,
        };
        self.module.apply_parameters().map_err(run_err)?;
        let shape = self.module.output_shape(input_shapes).map_err(run_err)?;
        if self.output.shape() == Some(shape) && self.states.len() == shape.channels {
            return Ok(false);
        }

        self.free_thread_copies();
        self.output = Signal::with_shape(shape)?;
        let mut states = Vec::new();
        states
            .try_reserve_exact(shape.channels)
            .map_err(|_| SignalError::Allocation {
                channels: shape.channels,
                length: shape.length,
            })?;
        states.extend((0..shape.channels).map(|ch| self.module.init_channel_state(ch)));
        self.states = states;
        log::debug!(
            "prepared '{}' ({}): {} channels x {} samples",
            self.label,
            self.module.name(),
            shape.channels,
            shape.length
        );
        Ok(true)
    }

    /// Create the copies for threads `1..slices.len()`.
    ///
    /// Copy `i` is seeded `base_seed + i`. Existing copies are kept when they
    /// already match `slices`. On failure no copies remain.
    pub fn init_thread_copies(&mut self, slices: &[ChannelSlice]) -> Result<(), SimError> {
        let wanted = slices.len().saturating_sub(1);
        let matches = self.thread_copies.len() == wanted
            && self
                .thread_copies
                .iter()
                .zip(slices.iter().skip(1))
                .all(|(copy, slice)| copy.slice == *slice);
        if matches {
            return Ok(());
        }

        self.free_thread_copies();
        if self.max_thread_copies.is_some_and(|max| wanted > max) {
            return Err(SimError::Allocation(format!(
                "'{}' is limited to {:?} thread copies, {} requested",
                self.label, self.max_thread_copies, wanted
            )));
        }
        let mut copies = Vec::new();
        if copies.try_reserve_exact(wanted).is_err() {
            return Err(SimError::Allocation(format!(
                "{} thread copies for '{}'",
                wanted, self.label
            )));
        }
        for (index, slice) in slices.iter().enumerate().skip(1) {
            copies.push(ThreadCopy {
                index,
                slice: *slice,
                rng: StdRng::seed_from_u64(self.base_seed.wrapping_add(index as u64)),
            });
        }
        assert_invariant(
            THREAD_COPY_COUNT,
            copies.len() == wanted,
            "one thread copy per worker after the first",
            Some(&self.label),
        );
        self.thread_copies = copies;
        Ok(())
    }

    /// Cap the number of thread copies; setup beyond it fails like an
    /// allocation failure and the process runs on one thread.
    pub fn set_max_thread_copies(&mut self, max: Option<usize>) {
        self.max_thread_copies = max;
    }

    pub fn max_thread_copies(&self) -> Option<usize> {
        self.max_thread_copies
    }

    /// Release all thread copies. Safe to call when there are none.
    pub fn free_thread_copies(&mut self) {
        self.thread_copies.clear();
    }

    /// Reset every channel's module state.
    pub fn reset(&mut self) -> Result<(), SimError> {
        self.module
            .reset_dyn(&mut self.states)
            .map_err(|source| SimError::ProcessRun {
                label: self.label.clone(),
                source,
            })
    }

    /// Split the process into one [`LanePart`] per slice.
    ///
    /// Lane 0 uses the process's own RNG, lane `i` the RNG of thread copy
    /// `i`; the primary output bookkeeping is narrowed to the first slice.
    pub(crate) fn split_lanes(&mut self, slices: &[ChannelSlice]) -> Result<Vec<LanePart<'_>>, SimError> {
        if slices.len() > 1 && self.thread_copies.len() + 1 != slices.len() {
            return Err(SimError::config(format!(
                "'{}' has {} thread copies for {} workers",
                self.label,
                self.thread_copies.len(),
                slices.len()
            )));
        }
        if !self.output.is_allocated() {
            return Err(SimError::config(format!("'{}' was never prepared", self.label)));
        }
        if let Some(first) = slices.first() {
            self.output.narrow(first.offset, first.count)?;
        }
        self.thread_run = slices.len() > 1;

        let Process {
            ref label,
            ref module,
            ref inputs,
            ref mut output,
            ref mut states,
            ref mut rng,
            ref mut thread_copies,
            ..
        } = *self;
        let label = label.as_str();
        let module: &dyn ModuleDyn = module.as_ref();
        let inputs = inputs.as_slice();

        let views = output.split_views_mut(slices)?;
        let state_chunks = split_states(states, slices);
        let rngs = std::iter::once(rng).chain(thread_copies.iter_mut().map(|c| &mut c.rng));

        Ok(views
            .into_iter()
            .zip(state_chunks)
            .zip(rngs)
            .map(move |((output, states), rng)| LanePart {
                label,
                module,
                inputs,
                output,
                states,
                rng,
            })
            .collect())
    }

    /// Undo the bookkeeping of [`Process::split_lanes`].
    pub(crate) fn restore(&mut self) {
        self.output.restore();
        self.thread_run = false;
    }

    pub(crate) fn free(&mut self) {
        self.free_thread_copies();
        self.module.free();
    }
}

fn split_states<'a>(
    states: &'a mut [Box<dyn Any + Send>],
    slices: &[ChannelSlice],
) -> Vec<&'a mut [Box<dyn Any + Send>]> {
    let mut chunks = Vec::with_capacity(slices.len());
    let mut rest = states;
    let mut consumed = 0;
    for s in slices {
        let tail = std::mem::take(&mut rest);
        let (_, tail) = tail.split_at_mut(s.offset - consumed);
        let (head, tail) = tail.split_at_mut(s.count);
        chunks.push(head);
        rest = tail;
        consumed = s.end();
    }
    chunks
}

//! Trait-based module definitions for the leaf DSP callables a process wraps.
//!
//! Implement [`Module`] for a processing stage. The engine stores modules as
//! `Arc<dyn ModuleDyn>`; the blanket impl bridges the typed per-channel state
//! to the type-erased storage kept by each process.

#![forbid(unsafe_code)]

use crate::error::ModuleError;
use crate::signal::{SignalShape, SignalView, SignalViewMut};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::ops::Range;

/// How a module may be parallelised across channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadMode {
    /// Never run on more than one thread.
    None,
    /// Channel-sliceable one node at a time. Reads its inputs across
    /// channels, so it may not be folded into a channel chain.
    Transfer,
    /// Each output channel depends only on the same input channel.
    Simple,
}

impl ThreadMode {
    pub fn allows_node_threading(self) -> bool {
        !matches!(self, ThreadMode::None)
    }

    pub fn allows_chain_threading(self) -> bool {
        matches!(self, ThreadMode::Simple)
    }
}

/// Mutable access to one output channel together with its state and the
/// worker's random number generator.
pub struct ChannelLane<'c, S> {
    pub samples: &'c mut [f64],
    pub state: &'c mut S,
    pub rng: &'c mut StdRng,
}

/// What a module sees while it runs on one worker.
pub struct RunContext<'a, 'i, 'o, S> {
    inputs: &'a [SignalView<'i>],
    output: &'a mut SignalViewMut<'o>,
    states: Vec<&'a mut S>,
    rng: &'a mut StdRng,
    thread_index: usize,
}

impl<'a, 'i, 'o, S> RunContext<'a, 'i, 'o, S> {
    /// Index of the worker running this call; 0 for serial execution.
    pub fn thread_index(&self) -> usize {
        self.thread_index
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn input(&self, index: usize) -> Result<SignalView<'i>, ModuleError> {
        self.inputs
            .get(index)
            .copied()
            .ok_or(ModuleError::MissingInput(index))
    }

    /// Absolute output channels this worker owns.
    pub fn channels(&self) -> Range<usize> {
        self.output.range()
    }

    pub fn output(&mut self) -> &mut SignalViewMut<'o> {
        &mut *self.output
    }

    pub fn dt(&self) -> f64 {
        self.output.dt()
    }

    pub fn length(&self) -> usize {
        self.output.length()
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut *self.rng
    }

    /// Output samples, state and RNG for absolute channel `channel`.
    pub fn lane(&mut self, channel: usize) -> Result<ChannelLane<'_, S>, ModuleError> {
        let offset = self.output.offset();
        let samples = self
            .output
            .channel_mut(channel)
            .ok_or(ModuleError::ChannelUnavailable(channel))?;
        let state = self
            .states
            .get_mut(channel - offset)
            .ok_or(ModuleError::ChannelUnavailable(channel))?;
        Ok(ChannelLane {
            samples,
            state: &mut **state,
            rng: &mut *self.rng,
        })
    }
}

/// Object-safe module definition used by the engine.
pub trait ModuleDyn: Send + Sync {
    fn name(&self) -> &str;
    fn thread_mode(&self) -> ThreadMode;
    fn apply_parameters(&self) -> Result<(), ModuleError>;
    fn output_shape(&self, inputs: &[SignalShape]) -> Result<SignalShape, ModuleError>;
    fn init_channel_state(&self, channel: usize) -> Box<dyn Any + Send>;
    fn run_dyn(
        &self,
        inputs: &[SignalView<'_>],
        output: &mut SignalViewMut<'_>,
        states: &mut [Box<dyn Any + Send>],
        rng: &mut StdRng,
        thread_index: usize,
    ) -> Result<(), ModuleError>;
    fn reset_dyn(&self, states: &mut [Box<dyn Any + Send>]) -> Result<(), ModuleError>;
    fn free(&self);
}

/// Generic module definition; implement this for your processing stages.
pub trait Module: Send + Sync + 'static {
    /// Internal state kept for every output channel.
    type ChannelState: Send + 'static;

    fn name(&self) -> &str;

    fn thread_mode(&self) -> ThreadMode {
        ThreadMode::Simple
    }

    /// Hook invoked before the process is prepared for a run.
    fn apply_parameters(&self) -> Result<(), ModuleError> {
        Ok(())
    }

    /// Output shape for the given input shapes.
    fn output_shape(&self, inputs: &[SignalShape]) -> Result<SignalShape, ModuleError>;

    fn init_channel_state(&self, channel: usize) -> Self::ChannelState;

    /// Process the channels in `ctx.channels()`.
    fn run(&self, ctx: &mut RunContext<'_, '_, '_, Self::ChannelState>) -> Result<(), ModuleError>;

    fn reset(&self, state: &mut Self::ChannelState) {
        let _ = state;
    }

    /// Called once when the owning simulation is torn down.
    fn free(&self) {}
}

impl<T: Module> ModuleDyn for T {
    fn name(&self) -> &str {
        <T as Module>::name(self)
    }

    fn thread_mode(&self) -> ThreadMode {
        <T as Module>::thread_mode(self)
    }

    fn apply_parameters(&self) -> Result<(), ModuleError> {
        <T as Module>::apply_parameters(self)
    }

    fn output_shape(&self, inputs: &[SignalShape]) -> Result<SignalShape, ModuleError> {
        <T as Module>::output_shape(self, inputs)
    }

    fn init_channel_state(&self, channel: usize) -> Box<dyn Any + Send> {
        Box::new(<T as Module>::init_channel_state(self, channel))
    }

    fn run_dyn(
        &self,
        inputs: &[SignalView<'_>],
        output: &mut SignalViewMut<'_>,
        states: &mut [Box<dyn Any + Send>],
        rng: &mut StdRng,
        thread_index: usize,
    ) -> Result<(), ModuleError> {
        let states = states
            .iter_mut()
            .map(|s| s.downcast_mut::<T::ChannelState>())
            .collect::<Option<Vec<_>>>()
            .ok_or(ModuleError::StateMismatch)?;
        let mut ctx = RunContext {
            inputs,
            output,
            states,
            rng,
            thread_index,
        };
        <T as Module>::run(self, &mut ctx)
    }

    fn reset_dyn(&self, states: &mut [Box<dyn Any + Send>]) -> Result<(), ModuleError> {
        for state in states.iter_mut() {
            let typed = state
                .downcast_mut::<T::ChannelState>()
                .ok_or(ModuleError::StateMismatch)?;
            <T as Module>::reset(self, typed);
        }
        Ok(())
    }

    fn free(&self) {
        <T as Module>::free(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{ChannelSlice, Signal};
    use rand::SeedableRng;

    struct Accumulate;

    impl Module for Accumulate {
        type ChannelState = f64;

        fn name(&self) -> &str {
            "accumulate"
        }

        fn output_shape(&self, _inputs: &[SignalShape]) -> Result<SignalShape, ModuleError> {
            Ok(SignalShape {
                channels: 4,
                length: 3,
                dt: 1e-3,
            })
        }

        fn init_channel_state(&self, channel: usize) -> f64 {
            channel as f64
        }

        fn run(&self, ctx: &mut RunContext<'_, '_, '_, f64>) -> Result<(), ModuleError> {
            for ch in ctx.channels() {
                let lane = ctx.lane(ch)?;
                *lane.state += 1.0;
                lane.samples.fill(*lane.state);
            }
            Ok(())
        }

        fn reset(&self, state: &mut f64) {
            *state = 0.0;
        }
    }

    #[test]
    fn typed_state_bridges_through_dyn() {
        let module: &dyn ModuleDyn = &Accumulate;
        let mut signal = Signal::new(4, 3, 1e-3).unwrap();
        let mut states: Vec<_> = (0..4).map(|c| module.init_channel_state(c)).collect();
        let mut rng = StdRng::seed_from_u64(1);

        let slice = [ChannelSlice { offset: 2, count: 2 }];
        let mut views = signal.split_views_mut(&slice).unwrap();
        module
            .run_dyn(&[], &mut views[0], &mut states[2..], &mut rng, 1)
            .unwrap();
        drop(views);

        assert_eq!(signal.channel(0).unwrap(), &[0.0, 0.0, 0.0]);
        assert_eq!(signal.channel(2).unwrap(), &[3.0, 3.0, 3.0]);
        assert_eq!(signal.channel(3).unwrap(), &[4.0, 4.0, 4.0]);

        module.reset_dyn(&mut states).unwrap();
        assert_eq!(*states[3].downcast_ref::<f64>().unwrap(), 0.0);
    }

    #[test]
    fn lane_outside_view_is_unavailable() {
        let module: &dyn ModuleDyn = &Accumulate;
        let mut signal = Signal::new(4, 3, 1e-3).unwrap();
        let mut states: Vec<_> = (0..1).map(|c| module.init_channel_state(c)).collect();
        let mut rng = StdRng::seed_from_u64(1);
        let slice = [ChannelSlice { offset: 0, count: 1 }];
        let mut views = signal.split_views_mut(&slice).unwrap();
        let states_ref: Vec<&mut f64> = states
            .iter_mut()
            .map(|s| s.downcast_mut::<f64>().unwrap())
            .collect();
        let mut ctx = RunContext {
            inputs: &[],
            output: &mut views[0],
            states: states_ref,
            rng: &mut rng,
            thread_index: 0,
        };
        assert!(matches!(
            ctx.lane(2),
            Err(ModuleError::ChannelUnavailable(2))
        ));
    }

    #[test]
    fn thread_mode_permissions() {
        assert!(!ThreadMode::None.allows_node_threading());
        assert!(ThreadMode::Transfer.allows_node_threading());
        assert!(!ThreadMode::Transfer.allows_chain_threading());
        assert!(ThreadMode::Simple.allows_chain_threading());
    }
}

//! Reference modules and helpers shared by tests and benchmarks.

use crate::dsl::SimBuilder;
use crate::error::{ModuleError, SimError};
use crate::interp::CancelToken;
use crate::module::{Module, RunContext, ThreadMode};
use crate::signal::{Signal, SignalShape};
use crate::simulation::Simulation;
use rand::Rng;
use std::sync::{Arc, Mutex};

const DT: f64 = 1e-3;

fn first_input_shape(inputs: &[SignalShape]) -> Result<SignalShape, ModuleError> {
    inputs
        .first()
        .copied()
        .ok_or_else(|| ModuleError::InvalidShape("expects one input".into()))
}

/// Source: channel `c`, sample `i` is `c * length + i`.
#[derive(Debug, Clone)]
pub struct Ramp {
    channels: usize,
    length: usize,
}

impl Ramp {
    pub fn new(channels: usize, length: usize) -> Self {
        Self { channels, length }
    }
}

impl Module for Ramp {
    type ChannelState = ();

    fn name(&self) -> &str {
        "ramp"
    }

    fn output_shape(&self, _inputs: &[SignalShape]) -> Result<SignalShape, ModuleError> {
        Ok(SignalShape {
            channels: self.channels,
            length: self.length,
            dt: DT,
        })
    }

    fn init_channel_state(&self, _channel: usize) {}

    fn run(&self, ctx: &mut RunContext<'_, '_, '_, ()>) -> Result<(), ModuleError> {
        let length = ctx.length();
        for ch in ctx.channels() {
            let lane = ctx.lane(ch)?;
            for (i, s) in lane.samples.iter_mut().enumerate() {
                *s = (ch * length + i) as f64;
            }
        }
        Ok(())
    }
}

/// Scales every channel of its input.
#[derive(Debug, Clone)]
pub struct Gain {
    gain: f64,
}

impl Gain {
    pub fn new(gain: f64) -> Self {
        Self { gain }
    }
}

impl Module for Gain {
    type ChannelState = ();

    fn name(&self) -> &str {
        "gain"
    }

    fn output_shape(&self, inputs: &[SignalShape]) -> Result<SignalShape, ModuleError> {
        first_input_shape(inputs)
    }

    fn init_channel_state(&self, _channel: usize) {}

    fn run(&self, ctx: &mut RunContext<'_, '_, '_, ()>) -> Result<(), ModuleError> {
        let input = ctx.input(0)?;
        for ch in ctx.channels() {
            let src = input.channel(ch).ok_or(ModuleError::ChannelUnavailable(ch))?;
            let lane = ctx.lane(ch)?;
            for (o, i) in lane.samples.iter_mut().zip(src) {
                *o = i * self.gain;
            }
        }
        Ok(())
    }
}

/// Running sum per channel, carried across runs until reset.
#[derive(Debug, Clone, Default)]
pub struct Accumulator;

impl Module for Accumulator {
    type ChannelState = f64;

    fn name(&self) -> &str {
        "accumulator"
    }

    fn output_shape(&self, inputs: &[SignalShape]) -> Result<SignalShape, ModuleError> {
        first_input_shape(inputs)
    }

    fn init_channel_state(&self, _channel: usize) -> f64 {
        0.0
    }

    fn run(&self, ctx: &mut RunContext<'_, '_, '_, f64>) -> Result<(), ModuleError> {
        let input = ctx.input(0)?;
        for ch in ctx.channels() {
            let src = input.channel(ch).ok_or(ModuleError::ChannelUnavailable(ch))?;
            let lane = ctx.lane(ch)?;
            for (o, i) in lane.samples.iter_mut().zip(src) {
                *lane.state += i;
                *o = *lane.state;
            }
        }
        Ok(())
    }

    fn reset(&self, state: &mut f64) {
        *state = 0.0;
    }
}

/// Every output channel is the sum of all input channels.
#[derive(Debug, Clone, Default)]
pub struct ChannelSum;

impl Module for ChannelSum {
    type ChannelState = ();

    fn name(&self) -> &str {
        "channel_sum"
    }

    fn thread_mode(&self) -> ThreadMode {
        ThreadMode::Transfer
    }

    fn output_shape(&self, inputs: &[SignalShape]) -> Result<SignalShape, ModuleError> {
        first_input_shape(inputs)
    }

    fn init_channel_state(&self, _channel: usize) {}

    fn run(&self, ctx: &mut RunContext<'_, '_, '_, ()>) -> Result<(), ModuleError> {
        let input = ctx.input(0)?;
        let mut sum = vec![0.0; ctx.length()];
        for (_, samples) in input.iter() {
            for (acc, s) in sum.iter_mut().zip(samples) {
                *acc += s;
            }
        }
        for ch in ctx.channels() {
            ctx.lane(ch)?.samples.copy_from_slice(&sum);
        }
        Ok(())
    }
}

/// Copies its input; refuses to be split across threads.
#[derive(Debug, Clone, Default)]
pub struct Isolated;

impl Module for Isolated {
    type ChannelState = ();

    fn name(&self) -> &str {
        "isolated"
    }

    fn thread_mode(&self) -> ThreadMode {
        ThreadMode::None
    }

    fn output_shape(&self, inputs: &[SignalShape]) -> Result<SignalShape, ModuleError> {
        first_input_shape(inputs)
    }

    fn init_channel_state(&self, _channel: usize) {}

    fn run(&self, ctx: &mut RunContext<'_, '_, '_, ()>) -> Result<(), ModuleError> {
        if ctx.thread_index() != 0 {
            return Err(ModuleError::Failed("isolated module ran on a worker".into()));
        }
        let input = ctx.input(0)?;
        for ch in ctx.channels() {
            let src = input.channel(ch).ok_or(ModuleError::ChannelUnavailable(ch))?;
            ctx.lane(ch)?.samples.copy_from_slice(src);
        }
        Ok(())
    }
}

/// Uniform noise drawn from the worker's RNG.
#[derive(Debug, Clone)]
pub struct Noise {
    channels: usize,
    length: usize,
}

impl Noise {
    pub fn new(channels: usize, length: usize) -> Self {
        Self { channels, length }
    }
}

impl Module for Noise {
    type ChannelState = ();

    fn name(&self) -> &str {
        "noise"
    }

    fn output_shape(&self, _inputs: &[SignalShape]) -> Result<SignalShape, ModuleError> {
        Ok(SignalShape {
            channels: self.channels,
            length: self.length,
            dt: DT,
        })
    }

    fn init_channel_state(&self, _channel: usize) {}

    fn run(&self, ctx: &mut RunContext<'_, '_, '_, ()>) -> Result<(), ModuleError> {
        for ch in ctx.channels() {
            let lane = ctx.lane(ch)?;
            for s in lane.samples.iter_mut() {
                *s = lane.rng.gen_range(-1.0..1.0);
            }
        }
        Ok(())
    }
}

/// Appends its tag to a shared log on every run. Single threaded.
#[derive(Debug, Clone)]
pub struct Probe {
    tag: String,
    log: Arc<Mutex<Vec<String>>>,
}

impl Probe {
    pub fn new(tag: &str, log: &Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            tag: tag.to_string(),
            log: Arc::clone(log),
        }
    }
}

impl Module for Probe {
    type ChannelState = ();

    fn name(&self) -> &str {
        "probe"
    }

    fn thread_mode(&self) -> ThreadMode {
        ThreadMode::None
    }

    fn output_shape(&self, _inputs: &[SignalShape]) -> Result<SignalShape, ModuleError> {
        Ok(SignalShape {
            channels: 1,
            length: 1,
            dt: DT,
        })
    }

    fn init_channel_state(&self, _channel: usize) {}

    fn run(&self, _ctx: &mut RunContext<'_, '_, '_, ()>) -> Result<(), ModuleError> {
        self.log
            .lock()
            .map_err(|_| ModuleError::Failed("probe log poisoned".into()))?
            .push(self.tag.clone());
        Ok(())
    }
}

/// Always fails.
#[derive(Debug, Clone, Default)]
pub struct Fail;

impl Module for Fail {
    type ChannelState = ();

    fn name(&self) -> &str {
        "fail"
    }

    fn output_shape(&self, _inputs: &[SignalShape]) -> Result<SignalShape, ModuleError> {
        Ok(SignalShape {
            channels: 1,
            length: 1,
            dt: DT,
        })
    }

    fn init_channel_state(&self, _channel: usize) {}

    fn run(&self, _ctx: &mut RunContext<'_, '_, '_, ()>) -> Result<(), ModuleError> {
        Err(ModuleError::Failed("requested failure".into()))
    }
}

/// Requests cancellation of the pass it runs in.
#[derive(Debug, Clone)]
pub struct CancelOnRun {
    token: CancelToken,
}

impl CancelOnRun {
    pub fn new(token: &CancelToken) -> Self {
        Self { token: token.clone() }
    }
}

impl Module for CancelOnRun {
    type ChannelState = ();

    fn name(&self) -> &str {
        "cancel_on_run"
    }

    fn thread_mode(&self) -> ThreadMode {
        ThreadMode::None
    }

    fn output_shape(&self, _inputs: &[SignalShape]) -> Result<SignalShape, ModuleError> {
        Ok(SignalShape {
            channels: 1,
            length: 1,
            dt: DT,
        })
    }

    fn init_channel_state(&self, _channel: usize) {}

    fn run(&self, _ctx: &mut RunContext<'_, '_, '_, ()>) -> Result<(), ModuleError> {
        self.token.cancel();
        Ok(())
    }
}

/// `ramp -> gain(2) -> accumulator -> gain(0.5) ...` with `stages` stages
/// after the source, all over `channels` channels.
pub fn gain_chain(channels: usize, length: usize, stages: usize) -> Result<Simulation, SimError> {
    let mut b = SimBuilder::new();
    b.process_named("src", Ramp::new(channels, length))?;
    let mut previous = "src".to_string();
    for i in 0..stages {
        let label = format!("s{}", i);
        match i % 3 {
            0 => b.process_named(&label, Gain::new(2.0))?,
            1 => b.process_named(&label, Accumulator)?,
            _ => b.process_named(&label, Gain::new(0.5))?,
        };
        b.connect(&previous, &label)?;
        previous = label;
    }
    Ok(b.build()?)
}

/// Copy of every process output, in process order.
pub fn snapshot(sim: &Simulation) -> Vec<Signal> {
    sim.processes().iter().map(|p| p.output().clone()).collect()
}

//! Threaded execution engine for block-based signal simulations.
//!
//! A simulation is an instruction list of [`datum::Datum`]s driving
//! [`process::Process`] nodes. The [`sched::Scheduler`] walks the list and,
//! where modules allow it, splits each process's channels across worker
//! threads, either one node at a time or once per channel chain.

mod chain;
pub mod config;
pub mod datum;
pub mod dsl;
pub mod error;
#[doc(hidden)]
pub mod harness;
pub mod interp;
#[doc(hidden)]
pub mod invariant_ppt;
pub mod module;
pub mod process;
pub mod sched;
pub mod signal;
pub mod sim_thread;
pub mod simulation;

pub use config::{load_config, save_config, EngineConfig, Interpreter, ThreadingMode};
pub use datum::{ChainSpan, Datum, DatumId, DatumKind, DatumList, ProcessId};
pub use dsl::{ProcessHandle, SimBuilder};
pub use error::{BuildError, ConfigError, ModuleError, SignalError, SimError};
pub use interp::{CancelToken, ExecOutcome};
pub use module::{ChannelLane, Module, ModuleDyn, RunContext, ThreadMode};
pub use process::{Process, ThreadCopy};
pub use sched::Scheduler;
pub use signal::{distribute_channels, ChannelSlice, Signal, SignalShape, SignalView, SignalViewMut};
pub use sim_thread::{SimState, SimThread};
pub use simulation::Simulation;

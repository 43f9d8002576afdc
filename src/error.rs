//! Error types for the simulation engine.

use thiserror::Error;

/// Errors raised by signal buffers and their channel views.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalError {
    /// A signal must hold at least one sample per channel.
    #[error("signal length must be non-zero")]
    ZeroLength,

    /// A signal must hold at least one channel.
    #[error("signal must have at least one channel")]
    ZeroChannels,

    /// The sample store could not be allocated.
    #[error("failed to allocate {channels} x {length} samples")]
    Allocation { channels: usize, length: usize },

    /// A view was requested outside `[0, orig_num_channels)`.
    #[error("channel range {offset}..{end} exceeds {orig_num_channels} channels")]
    SliceOutOfRange {
        offset: usize,
        end: usize,
        orig_num_channels: usize,
    },

    /// Mutable views must tile the signal in ascending, non-overlapping order.
    #[error("channel slices overlap or are out of order at offset {0}")]
    OverlappingSlices(usize),

    /// Writing a signal dump failed.
    #[error("signal i/o: {0}")]
    Io(String),
}

/// Errors reported by leaf modules.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModuleError {
    /// The module expected an input connection that is not there.
    #[error("missing input {0}")]
    MissingInput(usize),

    /// The module asked for a channel outside the views it was given.
    #[error("channel {0} is not available to this thread")]
    ChannelUnavailable(usize),

    /// The module cannot produce an output shape from its inputs.
    #[error("invalid input shape: {0}")]
    InvalidShape(String),

    /// Per-channel state was created by a different module type.
    #[error("channel state type mismatch")]
    StateMismatch,

    /// Module specific failure.
    #[error("{0}")]
    Failed(String),
}

/// Errors raised while assembling a Datum instruction list.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    /// Two instructions claim the same label.
    #[error("duplicate label '{0}'")]
    DuplicateLabel(String),

    /// A connection or reset refers to a label that does not exist.
    #[error("unknown label '{0}'")]
    UnknownLabel(String),

    /// The label exists but does not name a process.
    #[error("label '{0}' does not name a process")]
    NotAProcess(String),

    /// A process cannot read its own output.
    #[error("process '{0}' cannot be connected to itself")]
    SelfConnection(String),

    /// A repeat was opened but never closed with its stop marker.
    #[error("repeat '{0}' has no closing stop marker")]
    UnterminatedRepeat(String),

    /// `end_repeat` was called with no repeat open.
    #[error("end_repeat without a matching repeat")]
    UnbalancedRepeat,
}

/// Errors raised while reading, writing or validating an engine config.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config i/o on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The values parsed but are not usable.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Engine level errors.
#[derive(Debug, Error)]
pub enum SimError {
    /// Bad thread count, zero repeat count, missing loop stop marker and similar.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Thread copy or view allocation failed.
    #[error("allocation failed: {0}")]
    Allocation(String),

    /// A leaf module reported failure.
    #[error("process '{label}' failed: {source}")]
    ProcessRun {
        label: String,
        #[source]
        source: ModuleError,
    },

    /// The OS refused to start a worker thread.
    #[error("failed to spawn worker {index}: {source}")]
    ThreadCreation {
        index: usize,
        #[source]
        source: std::io::Error,
    },

    /// A worker thread panicked.
    #[error("worker {0} panicked")]
    WorkerPanicked(usize),

    /// The simulation driver thread panicked.
    #[error("simulation driver panicked")]
    DriverPanicked,

    #[error(transparent)]
    Signal(#[from] SignalError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SimError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        SimError::Configuration(msg.into())
    }
}

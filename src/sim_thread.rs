//! Runs one full simulation pass on a dedicated thread.
//!
//! The driver owns the [`Simulation`] while it runs and hands it back from
//! [`SimThread::join`]. Cancellation is cooperative: it is observed before
//! the next top-level instruction, never in the middle of one.

#![forbid(unsafe_code)]

use crate::error::SimError;
use crate::interp::{CancelToken, ExecOutcome};
use crate::sched::Scheduler;
use crate::simulation::Simulation;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Lifecycle of a driver thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SimState {
    Created = 0,
    Running = 1,
    Finished = 2,
    Cancelled = 3,
    Failed = 4,
}

impl SimState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SimState::Running,
            2 => SimState::Finished,
            3 => SimState::Cancelled,
            4 => SimState::Failed,
            _ => SimState::Created,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SimState::Finished | SimState::Cancelled | SimState::Failed)
    }
}

type PassResult = Result<(Simulation, ExecOutcome), SimError>;
type DriverOutput = (Simulation, Result<ExecOutcome, SimError>);

/// Handle to a running simulation pass.
#[derive(Debug)]
pub struct SimThread {
    handle: Option<JoinHandle<DriverOutput>>,
    cancel: CancelToken,
    state: Arc<AtomicU8>,
}

impl SimThread {
    /// Start a pass of `sim` under `scheduler`.
    pub fn spawn(sim: Simulation, scheduler: Scheduler) -> Result<Self, SimError> {
        Self::spawn_with_token(sim, scheduler, CancelToken::new())
    }

    /// Start a pass that observes an existing cancellation token.
    pub fn spawn_with_token(
        mut sim: Simulation,
        scheduler: Scheduler,
        cancel: CancelToken,
    ) -> Result<Self, SimError> {
        let state = Arc::new(AtomicU8::new(SimState::Created as u8));
        let thread_state = Arc::clone(&state);
        let thread_cancel = cancel.clone();

        let handle = thread::Builder::new()
            .name("simchain-driver".into())
            .spawn(move || {
                thread_state.store(SimState::Running as u8, Ordering::SeqCst);
                log::info!("simulation pass started");
                let result = scheduler.execute(&mut sim, Some(&thread_cancel));
                let end = match &result {
                    Ok(outcome) if outcome.cancelled => SimState::Cancelled,
                    Ok(_) => SimState::Finished,
                    Err(e) => {
                        log::error!("simulation pass failed: {}", e);
                        SimState::Failed
                    }
                };
                log::info!("simulation pass ended: {:?}", end);
                thread_state.store(end as u8, Ordering::SeqCst);
                (sim, result)
            })
            .map_err(|source| SimError::ThreadCreation { index: 0, source })?;

        Ok(Self {
            handle: Some(handle),
            cancel,
            state,
        })
    }

    /// Ask the pass to stop before its next top-level instruction.
    pub fn cancel(&self) {
        log::info!("cancellation requested");
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn state(&self) -> SimState {
        SimState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Wait for the pass and take the simulation back.
    ///
    /// A failed pass drops the simulation; use
    /// [`SimThread::join_with_simulation`] to inspect it after a failure.
    pub fn join(self) -> PassResult {
        let (sim, result) = self.join_with_simulation()?;
        result.map(|outcome| (sim, outcome))
    }

    /// Wait for the pass and return the simulation whatever the outcome.
    ///
    /// The outer error is only returned when the driver itself panicked.
    pub fn join_with_simulation(mut self) -> Result<(Simulation, Result<ExecOutcome, SimError>), SimError> {
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| {
                self.state.store(SimState::Failed as u8, Ordering::SeqCst);
                SimError::DriverPanicked
            }),
            None => Err(SimError::DriverPanicked),
        }
    }
}

impl Drop for SimThread {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.cancel.cancel();
            let _ = handle.join();
        }
    }
}

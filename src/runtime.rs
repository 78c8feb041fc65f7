//! Background emulator worker with an events channel.
//!
//! The worker owns the [`Emulator`] and runs the step loop on its own
//! thread. After every VM exit it publishes an [`Event`] by value on a
//! channel of capacity 1, so it never gets more than one exit ahead of
//! the consumer. Dropping the receiver stops the worker before the next
//! guest entry.
//!
//! # Example
//!
//! ```rust,no_run
//! use efivm::runtime::{EmulatorRuntime, Event};
//! use efivm::Emulator;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let emu = Emulator::builder().image("app.efi").build()?;
//!     let (handle, mut events) = EmulatorRuntime::new(emu).spawn();
//!
//!     while let Some(event) = events.recv().await {
//!         if let Event::Fault(fault) = event {
//!             println!("{} at {:#x}", fault.kind, fault.addr);
//!         }
//!     }
//!     println!("{:?}", handle.wait().await?);
//!     Ok(())
//! }
//! ```

use std::thread;

use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::fault::Fault;
use crate::vm::{Emulator, StepOutcome};

/// Something the worker observed.
#[derive(Debug, Clone)]
pub enum Event {
    /// A VM exit that was handled; the guest keeps running.
    Fault(Fault),
    /// The guest finished with this exit code.
    Exited(i32),
    /// The guest hit an exit that could not be serviced.
    Stopped(Fault),
}

/// How the worker finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnd {
    /// The guest exited with a code.
    Exited(i32),
    /// The events receiver went away.
    Cancelled,
}

/// Handle to a running worker.
pub struct RuntimeHandle {
    done_rx: oneshot::Receiver<Result<RunEnd>>,
    thread_handle: Option<thread::JoinHandle<()>>,
}

impl RuntimeHandle {
    /// Wait for the worker to finish.
    pub async fn wait(mut self) -> Result<RunEnd> {
        let result = (&mut self.done_rx)
            .await
            .map_err(|_| Error::VcpuError("worker exited without a result".into()))?;
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
        result
    }

    /// Check if the worker is still running.
    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

/// Runs an [`Emulator`] on a worker thread.
pub struct EmulatorRuntime {
    emulator: Emulator,
}

impl EmulatorRuntime {
    pub fn new(emulator: Emulator) -> Self {
        Self { emulator }
    }

    /// Start the worker. Returns its handle and the events receiver.
    pub fn spawn(self) -> (RuntimeHandle, mpsc::Receiver<Event>) {
        let (events_tx, events_rx) = mpsc::channel(1);
        let (done_tx, done_rx) = oneshot::channel();

        let mut emulator = self.emulator;
        let thread_handle = thread::spawn(move || {
            let result = Self::run_loop(&mut emulator, &events_tx);
            match &result {
                Ok(end) => log::debug!("worker finished: {:?}", end),
                Err(e) => log::warn!("worker failed: {}", e),
            }
            let _ = done_tx.send(result);
        });

        (
            RuntimeHandle {
                done_rx,
                thread_handle: Some(thread_handle),
            },
            events_rx,
        )
    }

    fn run_loop(emulator: &mut Emulator, events: &mpsc::Sender<Event>) -> Result<RunEnd> {
        loop {
            let (event, end) = match emulator.step()? {
                StepOutcome::Continue(fault) => (Event::Fault(fault), None),
                StepOutcome::Exited(code) => (Event::Exited(code), Some(Ok(RunEnd::Exited(code)))),
                StepOutcome::Stopped { fault, error } => {
                    let err = error.unwrap_or(Error::GuestFault {
                        kind: fault.kind,
                        addr: fault.addr,
                        pc: fault.pc_at_trap,
                    });
                    (Event::Stopped(fault), Some(Err(err)))
                }
            };
            let delivered = events.blocking_send(event).is_ok();
            if let Some(end) = end {
                return end;
            }
            if !delivered {
                log::info!("events receiver closed, stopping guest");
                return Ok(RunEnd::Cancelled);
            }
        }
    }
}

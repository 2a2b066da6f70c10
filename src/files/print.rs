// src/files/print.rs - Print job state and the print loop
use super::{CodeExecutor, CodeFile, FileError};
use crate::abort::AbortHandle;
use crate::transport::packets::{PrintPausedReason, PrintStoppedReason};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq)]
pub enum PrintState {
    Idle,
    Running,
    Paused { position: u64, reason: PrintPausedReason },
    Cancelled,
}

/// Shared control over the current print. State changes are synchronous so the
/// firmware cycle can pause a print before it resolves the file's pending codes.
#[derive(Debug, Clone)]
pub struct PrintManager {
    state: Arc<watch::Sender<PrintState>>,
    file_abort: Arc<Mutex<Option<AbortHandle>>>,
}

impl PrintManager {
    pub fn new() -> Self {
        let (state, _) = watch::channel(PrintState::Idle);
        Self {
            state: Arc::new(state),
            file_abort: Arc::new(Mutex::new(None)),
        }
    }

    pub fn state(&self) -> PrintState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PrintState> {
        self.state.subscribe()
    }

    pub fn is_printing(&self) -> bool {
        matches!(*self.state.borrow(), PrintState::Running | PrintState::Paused { .. })
    }

    pub fn is_paused(&self) -> bool {
        matches!(*self.state.borrow(), PrintState::Paused { .. })
    }

    /// Claim the print slot for a file.
    pub fn start(&self, file_abort: AbortHandle) -> Result<(), FileError> {
        let mut started = false;
        self.state.send_if_modified(|state| {
            if matches!(state, PrintState::Running | PrintState::Paused { .. }) {
                return false;
            }
            *state = PrintState::Running;
            started = true;
            true
        });
        if !started {
            return Err(FileError::AlreadyPrinting);
        }
        *self.file_abort.lock().unwrap_or_else(|e| e.into_inner()) = Some(file_abort);
        Ok(())
    }

    /// Pause at a byte offset of the print file. Returns `false` if nothing is
    /// being printed.
    pub fn pause_at(&self, position: u64, reason: PrintPausedReason) -> bool {
        self.state.send_if_modified(|state| {
            if !matches!(state, PrintState::Running | PrintState::Paused { .. }) {
                return false;
            }
            *state = PrintState::Paused { position, reason };
            true
        })
    }

    pub fn resume(&self) -> bool {
        self.state.send_if_modified(|state| {
            if !matches!(state, PrintState::Paused { .. }) {
                return false;
            }
            *state = PrintState::Running;
            true
        })
    }

    /// Stop the print and wake a paused print loop so it can exit.
    pub fn cancel(&self) -> bool {
        let cancelled = self.state.send_if_modified(|state| {
            if !matches!(state, PrintState::Running | PrintState::Paused { .. }) {
                return false;
            }
            *state = PrintState::Cancelled;
            true
        });
        if let Some(abort) = self.file_abort.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            abort.abort();
        }
        cancelled
    }

    /// Release the print slot once the print loop has ended.
    pub fn finish(&self) {
        self.file_abort.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.state.send_replace(PrintState::Idle);
    }
}

impl Default for PrintManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Execute a print file until it ends, is cancelled or aborted. While the print
/// is paused the file is rewound to the pause position and the loop waits for
/// a resume.
///
/// The print state is checked after every read, so a line read while a pause or
/// cancel was landing is dropped instead of executed.
pub async fn run_print(executor: &dyn CodeExecutor, print: &PrintManager, file: &mut CodeFile) -> Result<PrintStoppedReason, FileError> {
    let mut state = print.subscribe();
    loop {
        let code = file.read_code().await?;

        let current = state.borrow_and_update().clone();
        match current {
            PrintState::Cancelled => return Ok(PrintStoppedReason::UserCancelled),
            PrintState::Paused { position, reason } => {
                tracing::info!("Print paused at byte {} ({:?})", position, reason);
                file.seek(position).await?;
                if state.wait_for(|s| !matches!(s, PrintState::Paused { .. })).await.is_err() {
                    return Ok(PrintStoppedReason::Abort);
                }
                if !matches!(*state.borrow(), PrintState::Cancelled) {
                    tracing::info!("Print resumed from byte {}", file.position());
                }
                continue;
            }
            PrintState::Idle => return Ok(PrintStoppedReason::Abort),
            PrintState::Running => {}
        }

        let Some(code) = code else {
            if file.is_aborted() {
                return Ok(PrintStoppedReason::Abort);
            }
            return Ok(PrintStoppedReason::NormalCompletion);
        };
        let result = executor.execute(code).await;
        if !result.is_successful() {
            tracing::warn!("{}: {}", file.path().display(), result);
        }
    }
}

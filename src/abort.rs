//! Abort signalling for tasks blocked on a channel, a file or an interception decision.

use crate::code::{CHANNEL_COUNT, CodeChannel};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Owning side of an abort signal. Once aborted it stays aborted.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal { rx: Some(self.tx.subscribe()) }
    }
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Observing side of an [`AbortHandle`].
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl AbortSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn is_aborted(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves once the abort has been requested.
    pub async fn aborted(&mut self) {
        match self.rx.as_mut() {
            Some(rx) => {
                if rx.wait_for(|aborted| *aborted).await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
            None => std::future::pending::<()>().await,
        }
    }
}

/// One abort generation per code channel. Aborting a channel fires the current
/// generation and starts a fresh one for codes submitted afterwards.
#[derive(Debug)]
pub struct ChannelAborts {
    handles: Mutex<[AbortHandle; CHANNEL_COUNT]>,
}

impl ChannelAborts {
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(std::array::from_fn(|_| AbortHandle::new())),
        }
    }

    pub fn signal(&self, channel: CodeChannel) -> AbortSignal {
        let handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles[channel.index()].signal()
    }

    pub fn abort(&self, channel: CodeChannel) {
        let previous = {
            let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut handles[channel.index()])
        };
        previous.abort();
    }

    pub fn abort_all(&self) {
        for channel in CodeChannel::ALL {
            self.abort(channel);
        }
    }
}

impl Default for ChannelAborts {
    fn default() -> Self {
        Self::new()
    }
}

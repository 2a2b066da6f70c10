//! # Code Pipeline
//!
//! Every code runs through the same stages: pre-interception, internal
//! handling, post-interception, the firmware and finally the executed-stage
//! notification. Codes of one channel complete in submission order; each takes
//! a ticket of its channel's [`ChannelSequencer`] when it is submitted and waits
//! for its turn before its first stage.
//!
//! Macro codes and codes inserted by an interceptor run inside the turn of the
//! code that caused them, so they skip the sequencer.

use crate::abort::AbortSignal;
use crate::code::{Code, CodeResult, CodeType, ParameterValue, UNNAMED_PARAMETER};
use crate::files::CodeExecutor;
use crate::intercept::{Interception, InterceptionStage};
use crate::services::Services;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

pub const CANCELLED_MESSAGE: &str = "Code has been cancelled";

/// Hands out tickets and tracks the oldest ticket that has not finished yet.
#[derive(Debug)]
pub struct ChannelSequencer {
    next_ticket: AtomicU64,
    serving: watch::Sender<u64>,
    finished: Mutex<BTreeSet<u64>>,
}

impl ChannelSequencer {
    pub fn new() -> Self {
        let (serving, _) = watch::channel(0);
        Self {
            next_ticket: AtomicU64::new(0),
            serving,
            finished: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn ticket(self: &Arc<Self>) -> Ticket {
        Ticket {
            id: self.next_ticket.fetch_add(1, Ordering::SeqCst),
            sequencer: self.clone(),
        }
    }

    /// Wait until every ticket handed out so far has finished.
    pub async fn flush(&self) {
        let target = self.next_ticket.load(Ordering::SeqCst);
        let mut serving = self.serving.subscribe();
        let _ = serving.wait_for(|serving| *serving >= target).await;
    }

    fn finish(&self, id: u64) {
        let mut finished = self.finished.lock().unwrap_or_else(|e| e.into_inner());
        finished.insert(id);
        self.serving.send_if_modified(|serving| {
            let before = *serving;
            while finished.remove(serving) {
                *serving += 1;
            }
            *serving != before
        });
    }
}

impl Default for ChannelSequencer {
    fn default() -> Self {
        Self::new()
    }
}

/// A place in a channel's order. Dropping the ticket finishes it, whether the
/// code completed or was abandoned.
#[derive(Debug)]
pub struct Ticket {
    id: u64,
    sequencer: Arc<ChannelSequencer>,
}

impl Ticket {
    pub async fn turn(&self) {
        let mut serving = self.sequencer.serving.subscribe();
        let _ = serving.wait_for(|serving| *serving >= self.id).await;
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.sequencer.finish(self.id);
    }
}

impl Services {
    /// Queue a code on its channel. The place in the channel's order is taken
    /// immediately; the returned future drives the code and yields its result.
    pub fn submit(self: &Arc<Self>, code: Code) -> impl Future<Output = CodeResult> + Send + 'static {
        let unordered = code.flags.is_from_macro || code.flags.is_inserted || code.flags.is_prioritized;
        let ticket = (!unordered).then(|| self.sequencer(code.channel).ticket());
        let abort = self.aborts.signal(code.channel);
        let services = self.clone();
        async move { services.process(code, ticket, abort).await }
    }

    async fn process(self: &Arc<Self>, code: Code, ticket: Option<Ticket>, mut abort: AbortSignal) -> CodeResult {
        if let Some(ticket) = &ticket {
            tokio::select! {
                biased;
                _ = abort.aborted() => return CodeResult::error(CANCELLED_MESSAGE),
                _ = ticket.turn() => {}
            }
        }
        if code.code_type == CodeType::Comment {
            return CodeResult::new();
        }

        let (code, result, handled) = self.run_stages(code, &mut abort).await;
        if handled == Handled::ByFirmware && result.is_successful() {
            self.after_success(&code).await;
        }
        self.interceptor.notify_executed(&code, &result);
        result
    }

    async fn run_stages(self: &Arc<Self>, mut code: Code, abort: &mut AbortSignal) -> (Code, CodeResult, Handled) {
        if !code.flags.is_pre_processed {
            if let Some(result) = self.offer(&mut code, InterceptionStage::Pre, abort).await {
                return (code, result, Handled::ByInterceptor);
            }
            code.flags.is_pre_processed = true;
        }

        if let Some(result) = self.execute_internally(&code).await {
            return (code, result, Handled::Internally);
        }

        if !code.flags.is_post_processed {
            if let Some(result) = self.offer(&mut code, InterceptionStage::Post, abort).await {
                return (code, result, Handled::ByInterceptor);
            }
            code.flags.is_post_processed = true;
        }

        tracing::debug!("Forwarding {} on {}", code, code.channel);
        let result = match self.firmware.execute(code.clone()).await {
            Ok(result) => result,
            Err(e) => CodeResult::error(e.to_string()),
        };
        (code, result, Handled::ByFirmware)
    }

    /// Offer a code to interceptors. `Some` ends the code with that result.
    async fn offer(&self, code: &mut Code, stage: InterceptionStage, abort: &mut AbortSignal) -> Option<CodeResult> {
        match self.interceptor.intercept(code, stage, abort).await {
            Interception::Ignored | Interception::TimedOut => None,
            Interception::Resolved(result) => Some(result),
            Interception::Cancelled => {
                tracing::debug!("{} cancelled during {:?} interception", code, stage);
                Some(CodeResult::new())
            }
            Interception::Rewritten(replacement) => {
                tracing::debug!("{} rewritten to {} during {:?} interception", code, replacement, stage);
                *code = rewritten(code, replacement);
                None
            }
        }
    }

    /// Codes the server handles itself instead of forwarding them.
    async fn execute_internally(self: &Arc<Self>, code: &Code) -> Option<CodeResult> {
        if code.code_type != CodeType::MCode {
            return None;
        }
        match code.major {
            Some(32) => {
                let file_name = code
                    .parameter(UNNAMED_PARAMETER)
                    .into_iter()
                    .chain(code.parameters.iter().map(|p| &p.value))
                    .find_map(|value| match value {
                        ParameterValue::String(s) if !s.is_empty() => Some(s.clone()),
                        _ => None,
                    });
                let Some(file_name) = file_name else {
                    return Some(CodeResult::error("Missing file name"));
                };
                Some(match self.start_print(&file_name).await {
                    Ok(()) => CodeResult::new(),
                    Err(e) => CodeResult::error(e.to_string()),
                })
            }
            Some(112) => Some(match self.firmware.emergency_stop().await {
                Ok(()) => CodeResult::new(),
                Err(e) => CodeResult::error(e.to_string()),
            }),
            Some(999) => Some(match self.firmware.reset().await {
                Ok(()) => CodeResult::new(),
                Err(e) => CodeResult::error(e.to_string()),
            }),
            _ => None,
        }
    }

    /// Host state that follows from a successfully executed code.
    async fn after_success(&self, code: &Code) {
        let flag = match (code.code_type, code.major) {
            (CodeType::GCode, Some(20)) => Some((ChannelFlag::UsingInches, true)),
            (CodeType::GCode, Some(21)) => Some((ChannelFlag::UsingInches, false)),
            (CodeType::GCode, Some(90)) => Some((ChannelFlag::RelativePositioning, false)),
            (CodeType::GCode, Some(91)) => Some((ChannelFlag::RelativePositioning, true)),
            (CodeType::MCode, Some(82)) => Some((ChannelFlag::RelativeExtrusion, false)),
            (CodeType::MCode, Some(83)) => Some((ChannelFlag::RelativeExtrusion, true)),
            (CodeType::MCode, Some(24)) => {
                if self.print.resume() {
                    tracing::info!("Print resumed by {}", code.channel);
                }
                None
            }
            (CodeType::MCode, Some(0 | 1)) => {
                if self.print.is_paused() && self.print.cancel() {
                    tracing::info!("Paused print cancelled by {}", code.channel);
                }
                None
            }
            _ => None,
        };

        if let Some((flag, value)) = flag {
            let mut handle = self.store.handle();
            let mut model = handle.write().await;
            let channel = model.channels.get_mut(code.channel);
            match flag {
                ChannelFlag::UsingInches => channel.using_inches = value,
                ChannelFlag::RelativePositioning => channel.relative_positioning = value,
                ChannelFlag::RelativeExtrusion => channel.relative_extrusion = value,
            }
        }
    }
}

/// Who produced a code's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handled {
    ByInterceptor,
    Internally,
    ByFirmware,
}

#[derive(Debug, Clone, Copy)]
enum ChannelFlag {
    UsingInches,
    RelativePositioning,
    RelativeExtrusion,
}

/// A replacement keeps the origin of the code it replaces.
fn rewritten(original: &Code, mut replacement: Code) -> Code {
    replacement.channel = original.channel;
    replacement.source_connection = original.source_connection;
    replacement.file_position = original.file_position;
    replacement.line_number = original.line_number;
    replacement.flags = original.flags;
    replacement
}

#[async_trait]
impl CodeExecutor for Arc<Services> {
    async fn execute(&self, code: Code) -> CodeResult {
        self.submit(code).await
    }
}

//! # Interception
//!
//! Codes are offered to observer connections at three points of their life:
//! before internal processing ([`InterceptionStage::Pre`]), before they are
//! forwarded to the firmware ([`InterceptionStage::Post`]) and, read-only, once
//! the firmware has answered ([`InterceptionStage::Executed`]).
//!
//! Observers are consulted in registration order. The first eligible observer
//! that is still connected decides the outcome of the stage; the others do not
//! see the code. With no eligible observer the stage is skipped.

use crate::abort::AbortSignal;
use crate::code::{Code, CodeChannel, CodeResult, CodeType};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Requests queued for an observer that is busy with another code.
const OBSERVER_BACKLOG: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InterceptionStage {
    Pre,
    Post,
    Executed,
}

/// Which codes an observer wants to see.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InterceptFilter {
    /// Channels to watch; empty means every channel.
    pub channels: Vec<CodeChannel>,
    /// Code patterns such as `G28`, `M98.1`, `M*` or a keyword like `echo`;
    /// empty means every code.
    pub filters: Vec<String>,
    /// Watch prioritized codes instead of regular ones.
    pub priority_codes: bool,
}

impl InterceptFilter {
    pub fn matches(&self, code: &Code) -> bool {
        if code.code_type == CodeType::Comment {
            return false;
        }
        if code.flags.is_prioritized != self.priority_codes {
            return false;
        }
        if !self.channels.is_empty() && !self.channels.contains(&code.channel) {
            return false;
        }
        self.filters.is_empty() || self.filters.iter().any(|f| filter_matches(f, code))
    }
}

fn filter_matches(filter: &str, code: &Code) -> bool {
    if code.code_type == CodeType::Keyword {
        let word = code.keyword.as_deref().and_then(|k| k.split_whitespace().next()).unwrap_or_default();
        return filter.eq_ignore_ascii_case(word);
    }
    let mut name = code.code_type.letter().to_string();
    if let Some(major) = code.major {
        name.push_str(&major.to_string());
        if let Some(minor) = code.minor {
            name.push('.');
            name.push_str(&minor.to_string());
        }
    }
    match filter.strip_suffix('*') {
        Some(prefix) => name.len() >= prefix.len() && name[..prefix.len()].eq_ignore_ascii_case(prefix),
        None => filter.eq_ignore_ascii_case(&name),
    }
}

/// An observer's answer to an offered code.
#[derive(Debug, Clone, PartialEq)]
pub enum InterceptDecision {
    /// Continue unchanged.
    Ignore,
    /// Complete the code with this result; nothing reaches the firmware.
    Resolve(CodeResult),
    /// Continue with a replacement code.
    Rewrite(Code),
    /// Drop the code with an empty result.
    Cancel,
}

/// A code offered to an observer. `respond_to` is absent for executed-stage
/// notifications, which cannot change anything.
#[derive(Debug)]
pub struct InterceptRequest {
    pub code: Code,
    pub stage: InterceptionStage,
    pub result: Option<CodeResult>,
    pub respond_to: Option<oneshot::Sender<InterceptDecision>>,
}

/// Outcome of one interception stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Interception {
    Ignored,
    Resolved(CodeResult),
    Rewritten(Code),
    Cancelled,
    TimedOut,
}

struct Observer {
    id: u64,
    connection: u32,
    stage: InterceptionStage,
    filter: InterceptFilter,
    tx: mpsc::Sender<InterceptRequest>,
}

type Registry = Arc<RwLock<Vec<Observer>>>;

#[derive(Clone)]
pub struct Interceptor {
    observers: Registry,
    next_id: Arc<AtomicU64>,
    timeout: Duration,
}

impl Interceptor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            observers: Arc::default(),
            next_id: Arc::new(AtomicU64::new(1)),
            timeout,
        }
    }

    /// Add an observer. It stays registered until the registration is dropped.
    pub fn register(&self, connection: u32, stage: InterceptionStage, filter: InterceptFilter) -> ObserverRegistration {
        let (tx, rx) = mpsc::channel(OBSERVER_BACKLOG);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Observer { id, connection, stage, filter, tx });
        tracing::debug!("Connection #{} intercepts {:?} codes", connection, stage);
        ObserverRegistration {
            id,
            observers: self.observers.clone(),
            requests: rx,
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Senders of eligible observers, in registration order.
    fn eligible(&self, code: &Code, stage: InterceptionStage) -> Vec<(u32, mpsc::Sender<InterceptRequest>)> {
        self.observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|o| o.stage == stage && o.connection != code.source_connection && o.filter.matches(code))
            .map(|o| (o.connection, o.tx.clone()))
            .collect()
    }

    /// Offer a code for the pre or post stage and wait for the decision.
    pub async fn intercept(&self, code: &Code, stage: InterceptionStage, abort: &mut AbortSignal) -> Interception {
        for (connection, tx) in self.eligible(code, stage) {
            let (respond_to, response) = oneshot::channel();
            let request = InterceptRequest {
                code: code.clone(),
                stage,
                result: None,
                respond_to: Some(respond_to),
            };
            let decision = async {
                tx.send(request).await.ok()?;
                response.await.ok()
            };
            tokio::select! {
                _ = abort.aborted() => return Interception::Cancelled,
                outcome = tokio::time::timeout(self.timeout, decision) => match outcome {
                    Ok(Some(decision)) => return decision.into(),
                    // observer went away before answering, ask the next one
                    Ok(None) => continue,
                    Err(_) => {
                        tracing::warn!("Connection #{} did not answer for {} within {:?}, ignoring", connection, code, self.timeout);
                        return Interception::TimedOut;
                    }
                },
            }
        }
        Interception::Ignored
    }

    /// Tell executed-stage observers about a finished code. Observers that are
    /// not keeping up miss the notification.
    pub fn notify_executed(&self, code: &Code, result: &CodeResult) {
        for (connection, tx) in self.eligible(code, InterceptionStage::Executed) {
            let request = InterceptRequest {
                code: code.clone(),
                stage: InterceptionStage::Executed,
                result: Some(result.clone()),
                respond_to: None,
            };
            if tx.try_send(request).is_err() {
                tracing::debug!("Connection #{} missed executed code {}", connection, code);
            }
        }
    }
}

impl From<InterceptDecision> for Interception {
    fn from(decision: InterceptDecision) -> Self {
        match decision {
            InterceptDecision::Ignore => Interception::Ignored,
            InterceptDecision::Resolve(result) => Interception::Resolved(result),
            InterceptDecision::Rewrite(code) => Interception::Rewritten(code),
            InterceptDecision::Cancel => Interception::Cancelled,
        }
    }
}

/// Live registration of an observer; dropping it unregisters the observer.
pub struct ObserverRegistration {
    id: u64,
    observers: Registry,
    requests: mpsc::Receiver<InterceptRequest>,
}

impl ObserverRegistration {
    pub async fn next_request(&mut self) -> Option<InterceptRequest> {
        self.requests.recv().await
    }
}

impl Drop for ObserverRegistration {
    fn drop(&mut self) {
        self.observers.write().unwrap_or_else(|e| e.into_inner()).retain(|o| o.id != self.id);
    }
}

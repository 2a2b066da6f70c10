//! Per-channel macro execution stacks.
//!
//! Every running macro owns a [`StackGuard`]. Popping the guard, or dropping it
//! on any other exit path, truncates the channel's stack back to the depth it
//! had before the push, so an aborted macro can never leave a stale frame
//! behind.

use crate::abort::AbortHandle;
use crate::code::{CHANNEL_COUNT, CodeChannel};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone)]
pub struct StackFrame {
    pub file_name: String,
    /// Position in the parent file to continue from once this frame ends.
    pub parent_position: Option<u64>,
    abort: AbortHandle,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionStacks {
    channels: Arc<Mutex<[Vec<StackFrame>; CHANNEL_COUNT]>>,
}

impl ExecutionStacks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, [Vec<StackFrame>; CHANNEL_COUNT]> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Begin a nested file on `channel`.
    pub fn push(&self, channel: CodeChannel, file_name: impl Into<String>, parent_position: Option<u64>) -> StackGuard {
        let abort = AbortHandle::new();
        let file_name = file_name.into();
        let mut channels = self.lock();
        let stack = &mut channels[channel.index()];
        let depth = stack.len();
        tracing::debug!("Stack push on {}: {} (depth {})", channel, file_name, depth + 1);
        stack.push(StackFrame {
            file_name,
            parent_position,
            abort: abort.clone(),
        });
        StackGuard {
            stacks: self.clone(),
            channel,
            depth,
            abort,
            popped: false,
        }
    }

    pub fn depth(&self, channel: CodeChannel) -> u8 {
        self.lock()[channel.index()].len().min(u8::MAX as usize) as u8
    }

    pub fn frames(&self, channel: CodeChannel) -> Vec<StackFrame> {
        self.lock()[channel.index()].clone()
    }

    /// Abort every file running on `channel`. Returns how many were aborted.
    pub fn abort_all(&self, channel: CodeChannel) -> usize {
        let channels = self.lock();
        let stack = &channels[channel.index()];
        stack.iter().for_each(|frame| frame.abort.abort());
        stack.len()
    }

    fn truncate(&self, channel: CodeChannel, depth: usize) -> usize {
        let mut channels = self.lock();
        let stack = &mut channels[channel.index()];
        let removed = stack.len().saturating_sub(depth);
        if removed > 0 {
            // frames above this one belong to nested files that cannot continue
            stack.drain(depth..).for_each(|frame| frame.abort.abort());
        }
        removed
    }
}

/// Ownership of one stack frame.
#[derive(Debug)]
pub struct StackGuard {
    stacks: ExecutionStacks,
    channel: CodeChannel,
    depth: usize,
    abort: AbortHandle,
    popped: bool,
}

impl StackGuard {
    pub fn channel(&self) -> CodeChannel {
        self.channel
    }

    /// Abort handle of the file running in this frame.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Regular end of the frame.
    pub fn pop(mut self) {
        self.popped = true;
        self.stacks.truncate(self.channel, self.depth);
        tracing::debug!("Stack pop on {} (depth {})", self.channel, self.depth);
    }
}

impl Drop for StackGuard {
    fn drop(&mut self) {
        if self.popped {
            return;
        }
        self.abort.abort();
        let removed = self.stacks.truncate(self.channel, self.depth);
        if removed > 0 {
            tracing::warn!("Forced stack pop on {}: {} frame(s) unwound to depth {}", self.channel, removed, self.depth);
        }
    }
}

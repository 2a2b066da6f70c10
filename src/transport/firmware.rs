//! # Firmware Link
//!
//! A single task owns the [`Framer`] and runs one transfer per poll interval.
//! Everything else talks to it through a [`FirmwareHandle`]: requests carry a
//! oneshot sender the task resolves once the firmware has answered.
//!
//! Per channel one code is in flight at a time. Codes of a running macro may be
//! sent while the code that started the macro is still waiting for its reply,
//! one per nesting level.

use super::frame::{BUFFER_SIZE, FrameError, Framer};
use super::link::Link;
use super::packets::{
    FirmwareRequest, HostRequest, MessageFlags, PacketWriter, PrintPausedReason, PrintStartedInfo, PrintStoppedReason, StackFlags,
    decode_frame,
};
use super::{EncodeError, binary_code};
use crate::abort::ChannelAborts;
use crate::code::{CHANNEL_COUNT, Code, CodeChannel, CodeResult, Message, MessageType};
use crate::config::FirmwareConfig;
use crate::files::{ExecutionStacks, PrintManager, StackGuard};
use crate::model::{MachineStatus, ModelHandle};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Result text of codes dropped by a protocol reset.
pub const RESET_MESSAGE: &str = "Code has been cancelled due to a controller reset";
/// Result text of codes dropped because the machine halted.
pub const EMERGENCY_STOP_MESSAGE: &str = "Code has been cancelled due to an emergency stop";

const COMMAND_BACKLOG: usize = 256;
/// Object model modules requested one after another after a (re)connect.
const STARTUP_MODULES: std::ops::RangeInclusive<u8> = 1..=13;
const STATE_MODULE: u8 = 2;
const JOB_MODULE: u8 = 3;

#[derive(Debug, Error)]
pub enum FirmwareError {
    #[error("Firmware link is not running")]
    Disconnected,
    #[error("Firmware link lost after {0} consecutive resets")]
    LinkLost(u32),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("{0}")]
    Cancelled(String),
    #[error("Failed to evaluate expression: {0}")]
    Evaluation(String),
}

/// Requests to the firmware task.
#[derive(Debug)]
pub enum FirmwareCommand {
    Code {
        code: Code,
        respond_to: oneshot::Sender<Result<CodeResult, FirmwareError>>,
    },
    Lock {
        channel: CodeChannel,
        respond_to: oneshot::Sender<Result<(), FirmwareError>>,
    },
    Unlock {
        channel: CodeChannel,
    },
    SetObjectModel {
        field: String,
        value: String,
    },
    PrintStarted(PrintStartedInfo),
    PrintStopped(PrintStoppedReason),
    MacroCompleted {
        channel: CodeChannel,
        error: bool,
    },
    Evaluate {
        channel: CodeChannel,
        expression: String,
        respond_to: oneshot::Sender<Result<String, FirmwareError>>,
    },
    EmergencyStop,
    Reset,
    /// Resolve pending codes of one channel, or of all channels, with an error.
    Invalidate {
        channel: Option<CodeChannel>,
        reason: String,
    },
}

/// Notifications from the firmware task that need work outside of it.
#[derive(Debug)]
pub enum FirmwareEvent {
    /// The firmware asks for a macro file. The stack frame has already been
    /// pushed so the reported stack depth matches.
    ExecuteMacro {
        frame: StackGuard,
        report_missing: bool,
        file_name: String,
    },
    /// The link could not be recovered.
    LinkLost,
}

/// Cloneable sender side of the firmware task.
#[derive(Debug, Clone)]
pub struct FirmwareHandle {
    tx: mpsc::Sender<FirmwareCommand>,
}

/// Create a handle and the command receiver for a [`FirmwareController`].
pub fn command_channel() -> (FirmwareHandle, mpsc::Receiver<FirmwareCommand>) {
    let (tx, rx) = mpsc::channel(COMMAND_BACKLOG);
    (FirmwareHandle::new(tx), rx)
}

impl FirmwareHandle {
    pub fn new(tx: mpsc::Sender<FirmwareCommand>) -> Self {
        Self { tx }
    }

    async fn send(&self, command: FirmwareCommand) -> Result<(), FirmwareError> {
        self.tx.send(command).await.map_err(|_| FirmwareError::Disconnected)
    }

    /// Send a code and wait for the firmware's reply.
    pub async fn execute(&self, code: Code) -> Result<CodeResult, FirmwareError> {
        let (respond_to, response) = oneshot::channel();
        self.send(FirmwareCommand::Code { code, respond_to }).await?;
        response.await.map_err(|_| FirmwareError::Disconnected)?
    }

    /// Wait until the machine stands still and movement is locked for `channel`.
    pub async fn lock_movement(&self, channel: CodeChannel) -> Result<(), FirmwareError> {
        let (respond_to, response) = oneshot::channel();
        self.send(FirmwareCommand::Lock { channel, respond_to }).await?;
        response.await.map_err(|_| FirmwareError::Disconnected)?
    }

    pub async fn unlock(&self, channel: CodeChannel) -> Result<(), FirmwareError> {
        self.send(FirmwareCommand::Unlock { channel }).await
    }

    pub async fn set_object_model(&self, field: impl Into<String>, value: impl Into<String>) -> Result<(), FirmwareError> {
        self.send(FirmwareCommand::SetObjectModel {
            field: field.into(),
            value: value.into(),
        })
        .await
    }

    pub async fn print_started(&self, info: PrintStartedInfo) -> Result<(), FirmwareError> {
        self.send(FirmwareCommand::PrintStarted(info)).await
    }

    pub async fn print_stopped(&self, reason: PrintStoppedReason) -> Result<(), FirmwareError> {
        self.send(FirmwareCommand::PrintStopped(reason)).await
    }

    pub async fn macro_completed(&self, channel: CodeChannel, error: bool) -> Result<(), FirmwareError> {
        self.send(FirmwareCommand::MacroCompleted { channel, error }).await
    }

    pub async fn evaluate(&self, channel: CodeChannel, expression: impl Into<String>) -> Result<String, FirmwareError> {
        let (respond_to, response) = oneshot::channel();
        self.send(FirmwareCommand::Evaluate {
            channel,
            expression: expression.into(),
            respond_to,
        })
        .await?;
        response.await.map_err(|_| FirmwareError::Disconnected)?
    }

    pub async fn emergency_stop(&self) -> Result<(), FirmwareError> {
        self.send(FirmwareCommand::EmergencyStop).await
    }

    pub async fn reset(&self) -> Result<(), FirmwareError> {
        self.send(FirmwareCommand::Reset).await
    }

    pub async fn invalidate(&self, channel: Option<CodeChannel>, reason: impl Into<String>) -> Result<(), FirmwareError> {
        self.send(FirmwareCommand::Invalidate {
            channel,
            reason: reason.into(),
        })
        .await
    }
}

/// Services of the rest of the server the firmware task works with.
pub struct ControllerContext {
    pub model: ModelHandle,
    pub print: PrintManager,
    pub stacks: ExecutionStacks,
    pub aborts: Arc<ChannelAborts>,
}

#[derive(Debug)]
struct PendingCode {
    code: Code,
    data: Vec<u8>,
    result: CodeResult,
    respond_to: oneshot::Sender<Result<CodeResult, FirmwareError>>,
}

impl PendingCode {
    fn complete(self) {
        let _ = self.respond_to.send(Ok(self.result));
    }

    fn resolve(self, message_type: MessageType, message: &str) {
        let _ = self.respond_to.send(Ok(CodeResult::from_message(message_type, message)));
    }
}

#[derive(Debug, Default)]
struct ChannelState {
    queued: VecDeque<PendingCode>,
    /// Codes sent and awaiting their reply; the last one is the innermost.
    in_flight: Vec<PendingCode>,
    lock_waiters: Vec<oneshot::Sender<Result<(), FirmwareError>>>,
}

struct PendingEvaluation {
    expression: String,
    respond_to: oneshot::Sender<Result<String, FirmwareError>>,
}

/// The transfer cycle task.
pub struct FirmwareController<L: Link> {
    framer: Framer<L>,
    writer: PacketWriter,
    commands: mpsc::Receiver<FirmwareCommand>,
    events: mpsc::UnboundedSender<FirmwareEvent>,
    context: ControllerContext,
    channels: [ChannelState; CHANNEL_COUNT],
    outbox: VecDeque<HostRequest>,
    resends: Vec<u16>,
    partial_reply: String,
    evaluations: VecDeque<PendingEvaluation>,
    reported_depths: Vec<(CodeChannel, u8)>,
    startup_modules: VecDeque<u8>,
    halted: bool,
    poll_interval: Duration,
    max_resets: u32,
    consecutive_resets: u32,
}

impl<L: Link> FirmwareController<L> {
    pub fn new(
        link: L,
        config: &FirmwareConfig,
        commands: mpsc::Receiver<FirmwareCommand>,
        events: mpsc::UnboundedSender<FirmwareEvent>,
        context: ControllerContext,
    ) -> Self {
        Self {
            framer: Framer::new(link, config.max_retries),
            writer: PacketWriter::new(BUFFER_SIZE),
            commands,
            events,
            context,
            channels: std::array::from_fn(|_| ChannelState::default()),
            outbox: VecDeque::new(),
            resends: Vec::new(),
            partial_reply: String::new(),
            evaluations: VecDeque::new(),
            reported_depths: Vec::new(),
            startup_modules: STARTUP_MODULES.collect(),
            halted: false,
            poll_interval: config.poll_interval(),
            max_resets: config.max_resets,
            consecutive_resets: 0,
        }
    }

    /// Run transfers until shutdown or until the link is lost.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), FirmwareError> {
        tracing::info!("Firmware link started, polling every {:?}", self.poll_interval);
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let outcome = loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Firmware link shutting down");
                    break Ok(());
                }
                _ = interval.tick() => {
                    if let Err(e) = self.cycle().await {
                        if let Err(lost) = self.recover(e) {
                            break Err(lost);
                        }
                    }
                }
            }
        };
        self.invalidate(None, "Code has been cancelled because the firmware link stopped");
        outcome
    }

    /// One full transfer: queue requests, exchange a frame, apply the answer.
    pub async fn cycle(&mut self) -> Result<(), FrameError> {
        self.drain_commands();
        self.fill_frame().await;

        let (payload, packet_count) = self.writer.take_frame();
        self.framer.send_frame(&payload, packet_count)?;
        let frame = self.framer.receive_frame().await?;
        self.consecutive_resets = 0;

        if frame.duplicate {
            return Ok(());
        }
        for packet in decode_frame::<FirmwareRequest>(&frame.data, frame.packet_count) {
            match packet {
                Ok(packet) => self.handle_request(packet.request).await,
                Err(e) => tracing::warn!("Dropped firmware packet of frame #{}: {}", frame.sequence_number, e),
            }
        }
        self.check_stack_depths();
        Ok(())
    }

    fn recover(&mut self, error: FrameError) -> Result<(), FirmwareError> {
        self.consecutive_resets += 1;
        tracing::warn!("Transfer failed: {}, resetting protocol ({}/{})", error, self.consecutive_resets, self.max_resets);
        self.framer.reset();
        self.writer.reset();
        self.resends.clear();
        self.startup_modules = STARTUP_MODULES.collect();
        self.invalidate(None, RESET_MESSAGE);

        if self.consecutive_resets > self.max_resets {
            tracing::error!("Firmware link lost after {} consecutive resets", self.consecutive_resets);
            let _ = self.events.send(FirmwareEvent::LinkLost);
            return Err(FirmwareError::LinkLost(self.consecutive_resets));
        }
        Ok(())
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            self.handle_command(command);
        }
    }

    fn handle_command(&mut self, command: FirmwareCommand) {
        match command {
            FirmwareCommand::Code { code, respond_to } => match binary_code::encode(&code) {
                Ok(data) => self.channels[code.channel.index()].queued.push_back(PendingCode {
                    code,
                    data,
                    result: CodeResult::new(),
                    respond_to,
                }),
                Err(e) => {
                    let _ = respond_to.send(Err(e.into()));
                }
            },
            FirmwareCommand::Lock { channel, respond_to } => {
                self.channels[channel.index()].lock_waiters.push(respond_to);
                self.outbox.push_back(HostRequest::LockMovementAndWaitForStandstill { channel });
            }
            FirmwareCommand::Unlock { channel } => self.outbox.push_back(HostRequest::Unlock { channel }),
            FirmwareCommand::SetObjectModel { field, value } => self.outbox.push_back(HostRequest::SetObjectModel { field, value }),
            FirmwareCommand::PrintStarted(info) => self.outbox.push_back(HostRequest::PrintStarted(info)),
            FirmwareCommand::PrintStopped(reason) => self.outbox.push_back(HostRequest::PrintStopped { reason }),
            FirmwareCommand::MacroCompleted { channel, error } => {
                self.outbox.push_back(HostRequest::MacroCompleted { channel, error })
            }
            FirmwareCommand::Evaluate {
                channel,
                expression,
                respond_to,
            } => {
                self.outbox.push_back(HostRequest::EvaluateExpression {
                    channel,
                    expression: expression.clone(),
                });
                self.evaluations.push_back(PendingEvaluation { expression, respond_to });
            }
            FirmwareCommand::EmergencyStop => {
                tracing::warn!("Emergency stop requested");
                self.outbox.push_front(HostRequest::EmergencyStop);
                self.invalidate(None, EMERGENCY_STOP_MESSAGE);
            }
            FirmwareCommand::Reset => {
                tracing::warn!("Firmware reset requested");
                self.outbox.push_front(HostRequest::Reset);
                self.invalidate(None, RESET_MESSAGE);
            }
            FirmwareCommand::Invalidate { channel, reason } => self.invalidate(channel, &reason),
        }
    }

    fn can_send(&self, channel: CodeChannel) -> bool {
        let state = &self.channels[channel.index()];
        let Some(next) = state.queued.front() else {
            return false;
        };
        state.in_flight.is_empty()
            || (next.code.flags.is_from_macro && state.in_flight.len() <= self.context.stacks.depth(channel) as usize)
    }

    async fn fill_frame(&mut self) {
        for packet_id in std::mem::take(&mut self.resends) {
            if !self.writer.resend(packet_id) {
                tracing::warn!("Cannot resend packet #{}", packet_id);
            }
        }

        let module = match self.startup_modules.pop_front() {
            Some(module) => module,
            None => {
                let processing = self.context.model.read().await.state.status == MachineStatus::Processing;
                if processing { JOB_MODULE } else { STATE_MODULE }
            }
        };
        for poll in [HostRequest::GetState, HostRequest::GetObjectModel { module }] {
            if let Err(e) = self.writer.push(&poll) {
                tracing::error!("Cannot encode {:?}: {}", poll, e);
            }
        }

        for e in self.writer.push_queue(&mut self.outbox) {
            tracing::error!("Dropped request: {}", e);
        }

        for channel in CodeChannel::ALL {
            while self.can_send(channel) {
                let state = &mut self.channels[channel.index()];
                let Some(next) = state.queued.front() else {
                    break;
                };
                let request = HostRequest::Code {
                    channel,
                    data: next.data.clone(),
                };
                match self.writer.push(&request) {
                    Ok(true) => {
                        if let Some(pending) = state.queued.pop_front() {
                            tracing::debug!("Sending {} on {}", pending.code, channel);
                            state.in_flight.push(pending);
                        }
                    }
                    // frame is full
                    Ok(false) => return,
                    Err(e) => {
                        if let Some(pending) = state.queued.pop_front() {
                            let _ = pending.respond_to.send(Err(e.into()));
                        }
                    }
                }
            }
        }
    }

    async fn handle_request(&mut self, request: FirmwareRequest) {
        match request {
            FirmwareRequest::ResendPacket { packet_id } => self.resends.push(packet_id),
            FirmwareRequest::ReportState { busy_channels } => {
                tracing::trace!("Busy channels: {:#06x}", busy_channels);
            }
            FirmwareRequest::ObjectModel { module, json } => {
                if let Err(e) = self.context.model.apply_firmware_update(module, &json).await {
                    tracing::warn!("Rejected object model update for module {}: {}", module, e);
                    return;
                }
                self.check_halted().await;
            }
            FirmwareRequest::CodeReply { flags, reply } => self.handle_reply(flags, reply).await,
            FirmwareRequest::ExecuteMacro {
                channel,
                report_missing,
                file_name,
            } => {
                let frame = self.context.stacks.push(channel, file_name.clone(), None);
                tracing::info!("Firmware requested macro {} on {}", file_name, channel);
                let _ = self.events.send(FirmwareEvent::ExecuteMacro {
                    frame,
                    report_missing,
                    file_name,
                });
            }
            FirmwareRequest::AbortFile { channel } => self.abort_file(channel),
            FirmwareRequest::StackEvent {
                channel,
                depth,
                flags,
                feedrate,
            } => {
                let mut model = self.context.model.write().await;
                let state = model.channels.get_mut(channel);
                state.stack_depth = depth;
                state.relative_extrusion = flags.has(StackFlags::DRIVES_RELATIVE);
                state.relative_positioning = flags.has(StackFlags::AXES_RELATIVE);
                state.using_inches = flags.has(StackFlags::USING_INCHES);
                state.feedrate = feedrate;
                drop(model);
                self.reported_depths.push((channel, depth));
            }
            FirmwareRequest::PrintPaused { file_position, reason } => self.print_paused(file_position as u64, reason).await,
            FirmwareRequest::HeightMap(map) => {
                self.context.model.write().await.motion.height_map = Some(map);
            }
            FirmwareRequest::Locked { channel } => {
                for waiter in self.channels[channel.index()].lock_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
            }
            FirmwareRequest::EvaluationResult { expression, success, result } => {
                match self.evaluations.iter().position(|e| e.expression == expression) {
                    Some(index) => {
                        if let Some(pending) = self.evaluations.remove(index) {
                            let outcome = if success { Ok(result) } else { Err(FirmwareError::Evaluation(result)) };
                            let _ = pending.respond_to.send(outcome);
                        }
                    }
                    None => tracing::warn!("Unexpected evaluation result for '{}'", expression),
                }
            }
        }
    }

    async fn handle_reply(&mut self, flags: MessageFlags, reply: String) {
        if flags.has(MessageFlags::PUSH) {
            self.partial_reply.push_str(&reply);
            return;
        }
        let text = if self.partial_reply.is_empty() {
            reply
        } else {
            std::mem::take(&mut self.partial_reply) + &reply
        };
        let message_type = flags.message_type();

        if flags.has(MessageFlags::BINARY_CODE_REPLY) {
            let mut delivered = false;
            for channel in CodeChannel::ALL.into_iter().filter(|c| flags.has_channel(*c)) {
                if let Some(mut pending) = self.channels[channel.index()].in_flight.pop() {
                    if !text.is_empty() {
                        pending.result.push(message_type, text.clone());
                    }
                    pending.complete();
                    delivered = true;
                }
            }
            if delivered {
                return;
            }
        }
        if !text.is_empty() {
            self.log_message(message_type, text).await;
        }
    }

    async fn log_message(&mut self, message_type: MessageType, text: String) {
        match message_type {
            MessageType::Error => tracing::error!("{}", text),
            MessageType::Warning => tracing::warn!("{}", text),
            MessageType::Success => tracing::info!("{}", text),
        }
        self.context.model.write().await.log_message(Message::new(message_type, text));
    }

    async fn check_halted(&mut self) {
        let halted = self.context.model.read().await.state.status == MachineStatus::Halted;
        if halted && !self.halted {
            tracing::warn!("Firmware halted");
            self.invalidate(None, EMERGENCY_STOP_MESSAGE);
        }
        self.halted = halted;
    }

    async fn print_paused(&mut self, position: u64, reason: PrintPausedReason) {
        tracing::info!("Firmware paused the print at byte {} ({:?})", position, reason);
        self.context.print.pause_at(position, reason);
        {
            let mut model = self.context.model.write().await;
            model.state.status = MachineStatus::Paused;
            model.job.pause_reason = Some(reason);
            model.job.file_position = Some(position);
        }
        let message = format!("Print has been paused at byte {}", position);
        self.resolve_codes(CodeChannel::File, MessageType::Warning, &message, |code| !code.flags.is_from_macro);
    }

    fn abort_file(&mut self, channel: CodeChannel) {
        let macros = self.context.stacks.abort_all(channel);
        tracing::info!("Firmware aborted {} macro file(s) on {}", macros, channel);
        self.resolve_codes(channel, MessageType::Error, "Macro file has been aborted", |code| code.flags.is_from_macro);
        if channel == CodeChannel::File && self.context.print.cancel() {
            tracing::info!("Print aborted by the firmware");
            self.resolve_codes(channel, MessageType::Error, "Print has been aborted", |_| true);
        }
    }

    /// Resolve queued and in-flight codes of `channel` selected by `filter`.
    fn resolve_codes(&mut self, channel: CodeChannel, message_type: MessageType, message: &str, filter: impl Fn(&Code) -> bool) {
        let state = &mut self.channels[channel.index()];
        let (resolved, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.in_flight).into_iter().partition(|p| filter(&p.code));
        state.in_flight = kept;
        let (queued, kept): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut state.queued).into_iter().partition(|p| filter(&p.code));
        state.queued = kept;
        for pending in resolved.into_iter().chain(queued) {
            pending.resolve(message_type, message);
        }
    }

    fn check_stack_depths(&mut self) {
        for (channel, depth) in std::mem::take(&mut self.reported_depths) {
            let tracked = self.context.stacks.depth(channel);
            if tracked != depth {
                tracing::warn!("Stack depth mismatch on {}: firmware {}, host {}", channel, depth, tracked);
                self.invalidate(Some(channel), "Code has been cancelled due to a stack depth mismatch");
            }
        }
    }

    /// Fail pending work of one channel or, with `None`, of every channel. Open
    /// macro files of the affected channels are aborted; invalidating every
    /// channel cancels the print as well.
    fn invalidate(&mut self, scope: Option<CodeChannel>, reason: &str) {
        let channels = match scope {
            Some(channel) => vec![channel],
            None => CodeChannel::ALL.to_vec(),
        };
        for channel in channels {
            let state = &mut self.channels[channel.index()];
            let count = state.in_flight.len() + state.queued.len();
            for pending in state.in_flight.drain(..).chain(state.queued.drain(..)) {
                pending.resolve(MessageType::Error, reason);
            }
            for waiter in state.lock_waiters.drain(..) {
                let _ = waiter.send(Err(FirmwareError::Cancelled(reason.to_string())));
            }
            if count > 0 {
                tracing::warn!("{} code(s) on {} cancelled: {}", count, channel, reason);
            }
            self.context.stacks.abort_all(channel);
            self.context.aborts.abort(channel);
        }
        if scope.is_none() {
            for evaluation in self.evaluations.drain(..) {
                let _ = evaluation.respond_to.send(Err(FirmwareError::Cancelled(reason.to_string())));
            }
            self.partial_reply.clear();
            self.context.print.cancel();
        }
    }
}

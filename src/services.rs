// src/services.rs - Shared services of the control server
use crate::abort::ChannelAborts;
use crate::code::{CHANNEL_COUNT, CodeChannel, Message, MessageType};
use crate::config::Config;
use crate::files::{CodeFile, ExecutionStacks, FileDirectory, FileError, PathError, PathResolver, PrintManager, StackGuard, run_macro, run_print};
use crate::intercept::Interceptor;
use crate::model::{JobFile, ModelStore};
use crate::pipeline::ChannelSequencer;
use crate::transport::{ControllerContext, FirmwareHandle, PrintStartedInfo, PrintStoppedReason};
use std::path::PathBuf;
use std::sync::Arc;

/// Everything a code, a file or a connection needs. Shared as `Arc<Services>`.
pub struct Services {
    pub config: Config,
    pub store: ModelStore,
    pub firmware: FirmwareHandle,
    pub interceptor: Interceptor,
    pub aborts: Arc<ChannelAborts>,
    pub stacks: ExecutionStacks,
    pub print: PrintManager,
    pub paths: PathResolver,
    sequencers: [Arc<ChannelSequencer>; CHANNEL_COUNT],
}

impl Services {
    pub fn new(config: Config, store: ModelStore, firmware: FirmwareHandle) -> Self {
        Self {
            interceptor: Interceptor::new(config.interception.timeout()),
            paths: PathResolver::new(&config.files),
            config,
            store,
            firmware,
            aborts: Arc::new(ChannelAborts::new()),
            stacks: ExecutionStacks::new(),
            print: PrintManager::new(),
            sequencers: std::array::from_fn(|_| Arc::new(ChannelSequencer::new())),
        }
    }

    /// The parts the firmware task shares with the rest of the server.
    pub fn controller_context(&self) -> ControllerContext {
        ControllerContext {
            model: self.store.handle(),
            print: self.print.clone(),
            stacks: self.stacks.clone(),
            aborts: self.aborts.clone(),
        }
    }

    pub(crate) fn sequencer(&self, channel: CodeChannel) -> &Arc<ChannelSequencer> {
        &self.sequencers[channel.index()]
    }

    /// Wait until every code submitted on `channel` so far has completed.
    pub async fn flush(&self, channel: CodeChannel) {
        self.sequencer(channel).flush().await;
    }

    /// Map a virtual path onto the local file system.
    pub async fn resolve_path(&self, path: &str, directory: FileDirectory) -> Result<PathBuf, PathError> {
        let volumes = self.store.handle().read().await.volumes.clone();
        self.paths.resolve(path, directory, &volumes)
    }

    /// Log a message and append it to the object model's message log.
    pub async fn write_message(&self, message_type: MessageType, content: impl Into<String>) {
        let message = Message::new(message_type, content);
        match message_type {
            MessageType::Error => tracing::error!("{}", message.content),
            MessageType::Warning => tracing::warn!("{}", message.content),
            MessageType::Success => tracing::info!("{}", message.content),
        }
        self.store.handle().write().await.log_message(message);
    }

    /// Open a file and print it on the File channel in the background.
    pub async fn start_print(self: &Arc<Self>, file_name: &str) -> Result<(), FileError> {
        let path = self.resolve_path(file_name, FileDirectory::GCodes).await?;
        let file = CodeFile::open(&path, CodeChannel::File).await?;
        self.print.start(file.abort_handle())?;

        let size = file.length();
        {
            let mut handle = self.store.handle();
            let mut model = handle.write().await;
            model.job.file = Some(JobFile {
                file_name: file_name.to_string(),
                size,
                ..JobFile::default()
            });
            model.job.file_position = Some(0);
            model.job.pause_reason = None;
            model.job.last_file_aborted = false;
            model.job.last_file_cancelled = false;
        }
        let info = PrintStartedInfo {
            file_name: file_name.to_string(),
            file_size: u32::try_from(size).unwrap_or(u32::MAX),
            ..PrintStartedInfo::default()
        };
        if let Err(e) = self.firmware.print_started(info).await {
            tracing::warn!("Could not announce print of {}: {}", file_name, e);
        }

        tracing::info!("Started printing {}", file_name);
        let services = self.clone();
        let file_name = file_name.to_string();
        tokio::spawn(async move { services.print_file(file, file_name).await });
        Ok(())
    }

    async fn print_file(self: Arc<Self>, mut file: CodeFile, file_name: String) {
        let reason = match run_print(&self, &self.print, &mut file).await {
            Ok(reason) => reason,
            Err(e) => {
                tracing::error!("Print of {} failed: {}", file_name, e);
                PrintStoppedReason::Abort
            }
        };
        self.print.finish();
        tracing::info!("Print of {} stopped: {:?}", file_name, reason);

        {
            let mut handle = self.store.handle();
            let mut model = handle.write().await;
            model.job.file = None;
            model.job.file_position = None;
            model.job.pause_reason = None;
            model.job.last_file_name = Some(file_name);
            model.job.last_file_aborted = reason == PrintStoppedReason::Abort;
            model.job.last_file_cancelled = reason == PrintStoppedReason::UserCancelled;
        }
        if let Err(e) = self.firmware.print_stopped(reason).await {
            tracing::warn!("Could not report the end of the print: {}", e);
        }
    }

    /// Run a macro the firmware asked for and report the outcome back.
    pub async fn run_requested_macro(self: &Arc<Self>, frame: StackGuard, file_name: String, report_missing: bool) {
        let channel = frame.channel();
        let path = match self.resolve_path(&file_name, FileDirectory::System).await {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!("Cannot resolve macro {}: {}", file_name, e);
                None
            }
        };
        let exists = match &path {
            Some(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
            None => false,
        };

        let error = match path {
            Some(path) if exists => match run_macro(self, frame, &path).await {
                Ok(outcome) => outcome.is_error(),
                Err(e) => {
                    tracing::error!("Macro {} failed: {}", file_name, e);
                    true
                }
            },
            _ => {
                if report_missing {
                    self.write_message(MessageType::Error, format!("Macro file {} not found", file_name)).await;
                } else {
                    tracing::debug!("Optional macro {} not found", file_name);
                }
                frame.pop();
                true
            }
        };

        if let Err(e) = self.firmware.macro_completed(channel, error).await {
            tracing::warn!("Could not report completion of {}: {}", file_name, e);
        }
    }
}

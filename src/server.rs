// src/server.rs - Wiring of the control server
use crate::config::Config;
use crate::ipc::{IpcError, IpcServer};
use crate::model::{ModelStore, ObjectModel};
use crate::services::Services;
use crate::transport::{FirmwareController, FirmwareError, FirmwareEvent, Link, command_channel};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),
    #[error("Firmware error: {0}")]
    Firmware(#[from] FirmwareError),
    #[error("Task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// The firmware link, the IPC server and the services they share.
pub struct ControlServer<L: Link> {
    services: Arc<Services>,
    controller: FirmwareController<L>,
    events: mpsc::UnboundedReceiver<FirmwareEvent>,
    shutdown_tx: broadcast::Sender<()>,
}

impl<L: Link + 'static> ControlServer<L> {
    pub fn new(config: Config, link: L) -> Self {
        let (firmware, commands) = command_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);
        let firmware_config = config.firmware.clone();
        let services = Arc::new(Services::new(config, ModelStore::new(ObjectModel::default()), firmware));
        let controller = FirmwareController::new(link, &firmware_config, commands, events_tx, services.controller_context());
        Self {
            services,
            controller,
            events,
            shutdown_tx,
        }
    }

    pub fn services(&self) -> Arc<Services> {
        self.services.clone()
    }

    /// Sending on the returned channel stops the server.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Serve until shutdown is requested or the firmware link is lost.
    pub async fn run(self) -> Result<(), ServerError> {
        let Self {
            services,
            controller,
            mut events,
            shutdown_tx,
        } = self;
        let mut shutdown = shutdown_tx.subscribe();

        let ipc = IpcServer::bind(services.clone())?;
        let ipc_task = tokio::spawn(ipc.run(shutdown_tx.subscribe()));
        let firmware_task = tokio::spawn(controller.run(shutdown_tx.subscribe()));
        tracing::info!("Control server ready");

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                event = events.recv() => match event {
                    Some(FirmwareEvent::ExecuteMacro { frame, report_missing, file_name }) => {
                        tracing::info!("Firmware requested macro {} on {}", file_name, frame.channel());
                        let services = services.clone();
                        tokio::spawn(async move {
                            services.run_requested_macro(frame, file_name, report_missing).await;
                        });
                    }
                    Some(FirmwareEvent::LinkLost) => {
                        tracing::error!("Firmware link lost, shutting down");
                        break;
                    }
                    None => break,
                }
            }
        }

        let _ = shutdown_tx.send(());
        let firmware = firmware_task.await?;
        ipc_task.await??;
        tracing::info!("Control server stopped");
        Ok(firmware?)
    }
}

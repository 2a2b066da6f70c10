//! # IPC
//!
//! Local clients connect to a unix socket. The server greets every new
//! connection with its id and the protocol version, the client answers with the
//! mode it wants and from then on the connection speaks that mode only:
//!
//! - `command`: request/response for the operations in [`command::Command`]
//! - `intercept`: receives codes from the interception stages and decides them
//! - `subscribe`: receives the object model, then patches or full updates
//! - `codeStream`: plain text, one code per line in, one result per line out
//! - `pluginService`: plugin bookkeeping
//!
//! Messages are newline-delimited JSON with camelCase field names.

pub mod code_stream;
pub mod command;
pub mod connection;
pub mod interception;
pub mod plugin_service;
pub mod subscription;

pub use command::Command;
pub use connection::Connection;

use crate::code::CodeChannel;
use crate::files::{FileError, PathError};
use crate::intercept::{InterceptFilter, InterceptionStage};
use crate::model::ModelError;
use crate::services::Services;
use crate::transport::FirmwareError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixListener;
use tokio::sync::broadcast;

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Command {0} is not supported in this mode")]
    UnsupportedCommand(&'static str),
    #[error("{0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    File(#[from] FileError),
    #[error(transparent)]
    Firmware(#[from] FirmwareError),
}

impl IpcError {
    /// Stable name of the error kind reported to clients as `errorType`.
    pub fn category(&self) -> &'static str {
        match self {
            IpcError::Io(_) => "io",
            IpcError::Json(_) => "invalidRequest",
            IpcError::UnsupportedCommand(_) => "unsupportedCommand",
            IpcError::InvalidArgument(_) => "invalidArgument",
            IpcError::Model(_) => "objectModel",
            IpcError::Path(_) => "path",
            IpcError::File(_) => "file",
            IpcError::Firmware(_) => "firmware",
        }
    }
}

/// First message of the server on every connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInit {
    pub id: u32,
    pub version: u32,
}

/// Mode selection sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum ClientInit {
    Command,
    Intercept(InterceptInit),
    Subscribe(SubscribeInit),
    CodeStream(CodeStreamInit),
    PluginService,
}

impl ClientInit {
    pub fn name(&self) -> &'static str {
        match self {
            ClientInit::Command => "command",
            ClientInit::Intercept(_) => "intercept",
            ClientInit::Subscribe(_) => "subscribe",
            ClientInit::CodeStream(_) => "codeStream",
            ClientInit::PluginService => "pluginService",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterceptInit {
    pub interception_mode: InterceptionStage,
    #[serde(flatten)]
    pub filter: InterceptFilter,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubscriptionMode {
    #[default]
    Full,
    Patch,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubscribeInit {
    pub subscription_mode: SubscriptionMode,
    /// Field paths such as `state/status`; empty selects the whole model.
    pub filters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CodeStreamInit {
    pub channel: CodeChannel,
    /// Codes that may be in flight at once.
    pub buffer_size: usize,
}

impl Default for CodeStreamInit {
    fn default() -> Self {
        Self {
            channel: CodeChannel::Sbc,
            buffer_size: 32,
        }
    }
}

/// Reply to a command or to the mode selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Response {
    pub fn from_result(result: Result<Value, IpcError>) -> Self {
        match result {
            Ok(value) => Self {
                success: true,
                result: (!value.is_null()).then_some(value),
                error_type: None,
                error_message: None,
            },
            Err(e) => Self {
                success: false,
                result: None,
                error_type: Some(e.category().to_string()),
                error_message: Some(e.to_string()),
            },
        }
    }
}

/// Accepts connections on the configured unix socket.
pub struct IpcServer {
    services: Arc<Services>,
    listener: UnixListener,
    path: PathBuf,
    next_id: AtomicU32,
    active: Arc<AtomicUsize>,
}

impl IpcServer {
    /// Bind the socket, replacing a stale socket file from an unclean exit.
    pub fn bind(services: Arc<Services>) -> Result<Self, IpcError> {
        let path = services.config.socket.path.clone();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!("Removed stale socket {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let listener = UnixListener::bind(&path)?;
        tracing::info!("Listening for IPC connections on {}", path.display());
        Ok(Self {
            services,
            listener,
            path,
            next_id: AtomicU32::new(1),
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<(), IpcError> {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("IPC server shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                        if active > self.services.config.socket.backlog_warning {
                            tracing::warn!("{} IPC connections open", active);
                        }
                        let services = self.services.clone();
                        let counter = self.active.clone();
                        tokio::spawn(async move {
                            handle_connection(services, id, stream).await;
                            counter.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                    Err(e) => tracing::error!("Failed to accept IPC connection: {}", e),
                }
            }
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!("Could not remove socket {}: {}", self.path.display(), e);
        }
        Ok(())
    }
}

/// Greet a connection, negotiate its mode and serve it until it closes.
pub async fn handle_connection<S>(services: Arc<Services>, id: u32, stream: S)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut conn = Connection::new(id, stream);
    match serve(&services, &mut conn).await {
        Ok(()) => tracing::debug!("IPC#{}: Connection closed", id),
        Err(IpcError::Io(e)) => tracing::debug!("IPC#{}: Connection lost: {}", id, e),
        Err(e) => {
            tracing::warn!("IPC#{}: {}", id, e);
            let _ = conn.send_response(Err(e)).await;
        }
    }
}

async fn serve(services: &Arc<Services>, conn: &mut Connection) -> Result<(), IpcError> {
    conn.send(&ServerInit {
        id: conn.id(),
        version: PROTOCOL_VERSION,
    })
    .await?;
    let Some(init) = conn.receive::<ClientInit>().await? else {
        return Ok(());
    };
    tracing::info!("IPC#{}: Switching to {} mode", conn.id(), init.name());
    conn.send_response(Ok(Value::Null)).await?;

    match init {
        ClientInit::Command => command::run(services, conn).await,
        ClientInit::Intercept(init) => interception::run(services, conn, init).await,
        ClientInit::Subscribe(init) => subscription::run(services, conn, init).await,
        ClientInit::CodeStream(init) => code_stream::run(services, conn, init).await,
        ClientInit::PluginService => plugin_service::run(services, conn).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_init_modes() {
        let init: ClientInit = serde_json::from_str(r#"{"mode":"command","version":1}"#).unwrap();
        assert_eq!(init, ClientInit::Command);

        let init: ClientInit =
            serde_json::from_str(r#"{"mode":"intercept","interceptionMode":"pre","channels":["HTTP"],"filters":["G28"]}"#).unwrap();
        let ClientInit::Intercept(intercept) = init else {
            panic!("expected intercept mode");
        };
        assert_eq!(intercept.interception_mode, InterceptionStage::Pre);
        assert_eq!(intercept.filter.channels, vec![CodeChannel::Http]);
        assert_eq!(intercept.filter.filters, vec!["G28".to_string()]);

        let init: ClientInit = serde_json::from_str(r#"{"mode":"codeStream","channel":"Telnet"}"#).unwrap();
        assert_eq!(
            init,
            ClientInit::CodeStream(CodeStreamInit {
                channel: CodeChannel::Telnet,
                buffer_size: 32
            })
        );
        assert!(serde_json::from_str::<ClientInit>(r#"{"mode":"teleport"}"#).is_err());
    }

    #[test]
    fn test_error_response_carries_category() {
        let response = Response::from_result(Err(IpcError::UnsupportedCommand("Acknowledge")));
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["errorType"], "unsupportedCommand");
        assert_eq!(json["errorMessage"], "Command Acknowledge is not supported in this mode");

        let json = serde_json::to_value(Response::from_result(Ok(Value::Null))).unwrap();
        assert_eq!(json, serde_json::json!({ "success": true }));
    }
}

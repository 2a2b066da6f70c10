// src/ipc/command.rs - Requests of command mode and the commands shared by all modes
use super::{Connection, IpcError};
use crate::code::{Code, CodeChannel, CodeResult, MessageType};
use crate::files::FileDirectory;
use crate::model::patch::merge;
use crate::model::{AccessLevel, HttpEndpoint, HttpEndpointType, SessionType, UserSession};
use crate::services::Services;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;

/// Every request a client can send, tagged by `command`. Which of them are
/// accepted depends on the connection mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all_fields = "camelCase")]
pub enum Command {
    /// Run a fully described code and return its result messages.
    Code(Code),
    /// Parse and run one or more lines of code text, returning the result as text.
    SimpleCode {
        code: String,
        #[serde(default)]
        channel: CodeChannel,
    },
    GetObjectModel,
    SetObjectModel {
        property_path: String,
        value: Value,
    },
    /// Merge a JSON patch into the sub-tree below `key`.
    PatchObjectModel {
        key: String,
        patch: Value,
    },
    Flush {
        #[serde(default)]
        channel: CodeChannel,
    },
    ResolvePath {
        path: String,
    },
    WriteMessage {
        #[serde(rename = "type")]
        message_type: MessageType,
        content: String,
    },
    AddUserSession {
        #[serde(default)]
        access_level: AccessLevel,
        #[serde(default)]
        session_type: SessionType,
        #[serde(default)]
        origin: String,
        #[serde(default)]
        origin_id: i32,
    },
    RemoveUserSession {
        id: u32,
    },
    AddHttpEndpoint {
        endpoint_type: HttpEndpointType,
        namespace: String,
        path: String,
    },
    RemoveHttpEndpoint {
        endpoint_type: HttpEndpointType,
        namespace: String,
        path: String,
    },
    EvaluateExpression {
        #[serde(default)]
        channel: CodeChannel,
        expression: String,
    },
    StartPrint {
        file_name: String,
    },
    LockMovement {
        #[serde(default)]
        channel: CodeChannel,
    },
    UnlockMovement {
        #[serde(default)]
        channel: CodeChannel,
    },

    // intercept mode
    Ignore,
    Resolve {
        #[serde(rename = "type")]
        message_type: MessageType,
        #[serde(default)]
        content: String,
    },
    Rewrite {
        code: Code,
    },
    Cancel,

    // subscribe mode
    Acknowledge,

    // plugin service mode
    RegisterPlugin {
        name: String,
        #[serde(default)]
        version: String,
    },
    UnregisterPlugin {
        name: String,
    },
    SetPluginData {
        plugin: String,
        key: String,
        value: Value,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Code(_) => "Code",
            Command::SimpleCode { .. } => "SimpleCode",
            Command::GetObjectModel => "GetObjectModel",
            Command::SetObjectModel { .. } => "SetObjectModel",
            Command::PatchObjectModel { .. } => "PatchObjectModel",
            Command::Flush { .. } => "Flush",
            Command::ResolvePath { .. } => "ResolvePath",
            Command::WriteMessage { .. } => "WriteMessage",
            Command::AddUserSession { .. } => "AddUserSession",
            Command::RemoveUserSession { .. } => "RemoveUserSession",
            Command::AddHttpEndpoint { .. } => "AddHttpEndpoint",
            Command::RemoveHttpEndpoint { .. } => "RemoveHttpEndpoint",
            Command::EvaluateExpression { .. } => "EvaluateExpression",
            Command::StartPrint { .. } => "StartPrint",
            Command::LockMovement { .. } => "LockMovement",
            Command::UnlockMovement { .. } => "UnlockMovement",
            Command::Ignore => "Ignore",
            Command::Resolve { .. } => "Resolve",
            Command::Rewrite { .. } => "Rewrite",
            Command::Cancel => "Cancel",
            Command::Acknowledge => "Acknowledge",
            Command::RegisterPlugin { .. } => "RegisterPlugin",
            Command::UnregisterPlugin { .. } => "UnregisterPlugin",
            Command::SetPluginData { .. } => "SetPluginData",
        }
    }
}

/// Per-connection state of the general commands.
#[derive(Debug)]
pub struct CommandSession {
    connection: u32,
    /// Codes are sent while this connection holds an intercepted code.
    inserting: bool,
    endpoints: Vec<HttpEndpoint>,
}

impl CommandSession {
    pub fn new(connection: u32) -> Self {
        Self {
            connection,
            inserting: false,
            endpoints: Vec::new(),
        }
    }

    pub fn set_inserting(&mut self, inserting: bool) {
        self.inserting = inserting;
    }

    pub async fn execute(&mut self, services: &Arc<Services>, command: Command) -> Result<Value, IpcError> {
        tracing::debug!("IPC#{}: {}", self.connection, command.name());
        match command {
            Command::Code(code) => {
                let result = self.run_code(services, code).await;
                Ok(serde_json::to_value(result)?)
            }
            Command::SimpleCode { code, channel } => {
                let mut output = Vec::new();
                for line in code.lines().filter(|l| !l.trim().is_empty()) {
                    let result = match Code::parse(line, channel) {
                        Ok(code) => self.run_code(services, code).await,
                        Err(e) => CodeResult::error(e.to_string()),
                    };
                    let text = result.to_string();
                    if !text.is_empty() {
                        output.push(text);
                    }
                }
                Ok(Value::String(output.join("\n")))
            }
            Command::GetObjectModel => Ok(services.store.handle().snapshot().await?),
            Command::SetObjectModel { property_path, value } => {
                services.store.handle().set_property(&property_path, value).await?;
                Ok(Value::Bool(true))
            }
            Command::PatchObjectModel { key, patch } => {
                let mut handle = services.store.handle();
                let pointer = format!("/{}", key.replace('.', "/").trim_matches('/'));
                let mut target = handle
                    .snapshot()
                    .await?
                    .pointer(&pointer)
                    .cloned()
                    .ok_or_else(|| IpcError::InvalidArgument(format!("Unknown object model key '{}'", key)))?;
                merge(&mut target, &patch);
                handle.set_property(&key, target).await?;
                Ok(Value::Null)
            }
            Command::Flush { channel } => {
                services.flush(channel).await;
                Ok(Value::Bool(true))
            }
            Command::ResolvePath { path } => {
                let resolved = services.resolve_path(&path, FileDirectory::GCodes).await?;
                Ok(Value::String(resolved.to_string_lossy().into_owned()))
            }
            Command::WriteMessage { message_type, content } => {
                services.write_message(message_type, content).await;
                Ok(Value::Null)
            }
            Command::AddUserSession {
                access_level,
                session_type,
                origin,
                origin_id,
            } => {
                let mut handle = services.store.handle();
                let mut model = handle.write().await;
                let id = model.user_sessions.iter().map(|s| s.id).max().unwrap_or(0) + 1;
                model.user_sessions.push(UserSession {
                    id,
                    access_level,
                    session_type,
                    origin,
                    origin_id,
                });
                tracing::info!("IPC#{}: Added user session {}", self.connection, id);
                Ok(json!(id))
            }
            Command::RemoveUserSession { id } => {
                let mut handle = services.store.handle();
                let mut model = handle.write().await;
                let before = model.user_sessions.len();
                model.user_sessions.retain(|s| s.id != id);
                Ok(Value::Bool(model.user_sessions.len() != before))
            }
            Command::AddHttpEndpoint {
                endpoint_type,
                namespace,
                path,
            } => self.add_endpoint(services, endpoint_type, namespace, path).await,
            Command::RemoveHttpEndpoint {
                endpoint_type,
                namespace,
                path,
            } => {
                let removed = remove_endpoint(services, endpoint_type, &namespace, &path).await;
                self.endpoints
                    .retain(|e| !(e.endpoint_type == endpoint_type && e.namespace == namespace && e.path == path));
                Ok(Value::Bool(removed))
            }
            Command::EvaluateExpression { channel, expression } => {
                services.flush(channel).await;
                let result = services.firmware.evaluate(channel, expression).await?;
                Ok(Value::String(result))
            }
            Command::StartPrint { file_name } => {
                services.start_print(&file_name).await?;
                Ok(Value::Null)
            }
            Command::LockMovement { channel } => {
                services.firmware.lock_movement(channel).await?;
                Ok(Value::Null)
            }
            Command::UnlockMovement { channel } => {
                services.firmware.unlock(channel).await?;
                Ok(Value::Null)
            }
            other => Err(IpcError::UnsupportedCommand(other.name())),
        }
    }

    async fn run_code(&self, services: &Arc<Services>, mut code: Code) -> CodeResult {
        code.source_connection = self.connection;
        if self.inserting {
            code.flags.is_inserted = true;
        }
        services.submit(code).await
    }

    async fn add_endpoint(
        &mut self,
        services: &Arc<Services>,
        endpoint_type: HttpEndpointType,
        namespace: String,
        path: String,
    ) -> Result<Value, IpcError> {
        if namespace.is_empty() || namespace.contains(['/', '\\']) || namespace.starts_with('.') {
            return Err(IpcError::InvalidArgument(format!("Invalid namespace '{}'", namespace)));
        }
        let path = path.trim_matches('/').to_string();
        if path.is_empty() || path.split('/').any(|s| s == "..") {
            return Err(IpcError::InvalidArgument(format!("Invalid endpoint path '{}'", path)));
        }

        let type_name = serde_json::to_value(endpoint_type)?;
        let type_name = type_name.as_str().unwrap_or_default();
        let socket_dir = services
            .config
            .socket
            .path
            .parent()
            .map(|p| p.join(&namespace))
            .unwrap_or_else(|| namespace.clone().into());
        let socket = socket_dir.join(format!("{}-{}.sock", path.replace('/', "_"), type_name));

        {
            let mut handle = services.store.handle();
            let mut model = handle.write().await;
            let taken = model
                .http_endpoints
                .iter()
                .any(|e| e.endpoint_type == endpoint_type && e.namespace == namespace && e.path == path);
            if taken {
                return Err(IpcError::InvalidArgument(format!(
                    "Endpoint {} /machine/{}/{} is already registered",
                    type_name, namespace, path
                )));
            }
            let endpoint = HttpEndpoint {
                endpoint_type,
                namespace,
                path,
                unix_socket: socket.to_string_lossy().into_owned(),
            };
            model.http_endpoints.push(endpoint.clone());
            self.endpoints.push(endpoint);
        }
        tokio::fs::create_dir_all(&socket_dir).await?;
        tracing::info!("IPC#{}: Registered HTTP endpoint {}", self.connection, socket.display());
        Ok(Value::String(socket.to_string_lossy().into_owned()))
    }

    /// Drop what this connection registered.
    pub async fn release(&mut self, services: &Services) {
        for endpoint in std::mem::take(&mut self.endpoints) {
            remove_endpoint(services, endpoint.endpoint_type, &endpoint.namespace, &endpoint.path).await;
            tracing::debug!(
                "IPC#{}: Removed HTTP endpoint {}/{}",
                self.connection,
                endpoint.namespace,
                endpoint.path
            );
        }
    }
}

async fn remove_endpoint(services: &Services, endpoint_type: HttpEndpointType, namespace: &str, path: &str) -> bool {
    let path = path.trim_matches('/');
    let mut handle = services.store.handle();
    let mut model = handle.write().await;
    let before = model.http_endpoints.len();
    model
        .http_endpoints
        .retain(|e| !(e.endpoint_type == endpoint_type && e.namespace == namespace && e.path == path));
    model.http_endpoints.len() != before
}

/// Command mode: answer requests until the client disconnects.
pub async fn run(services: &Arc<Services>, conn: &mut Connection) -> Result<(), IpcError> {
    let mut session = CommandSession::new(conn.id());
    let outcome = serve(services, conn, &mut session).await;
    session.release(services).await;
    outcome
}

async fn serve(services: &Arc<Services>, conn: &mut Connection, session: &mut CommandSession) -> Result<(), IpcError> {
    loop {
        let command = match conn.receive::<Command>().await {
            Ok(Some(command)) => command,
            Ok(None) => return Ok(()),
            Err(IpcError::Json(e)) => {
                conn.send_response(Err(IpcError::Json(e))).await?;
                continue;
            }
            Err(e) => return Err(e),
        };
        let result = session.execute(services, command).await;
        conn.send_response(result).await?;
    }
}

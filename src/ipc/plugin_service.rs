// src/ipc/plugin_service.rs - Plugin service mode
use super::command::CommandSession;
use super::{Command, Connection, IpcError};
use crate::model::Plugin;
use crate::services::Services;
use serde_json::Value;
use std::sync::Arc;

/// Bookkeeping of plugins in the object model. Other commands are handled as
/// in command mode.
pub async fn run(services: &Arc<Services>, conn: &mut Connection) -> Result<(), IpcError> {
    let mut session = CommandSession::new(conn.id());
    let outcome = loop {
        let command = match conn.receive::<Command>().await {
            Ok(Some(command)) => command,
            Ok(None) => break Ok(()),
            Err(IpcError::Json(e)) => {
                if let Err(e) = conn.send_response(Err(IpcError::Json(e))).await {
                    break Err(e);
                }
                continue;
            }
            Err(e) => break Err(e),
        };
        let result = match command {
            Command::RegisterPlugin { name, version } => register(services, name, version).await,
            Command::UnregisterPlugin { name } => unregister(services, &name).await,
            Command::SetPluginData { plugin, key, value } => set_data(services, &plugin, key, value).await,
            other => session.execute(services, other).await,
        };
        if let Err(e) = conn.send_response(result).await {
            break Err(e);
        }
    };
    session.release(services).await;
    outcome
}

async fn register(services: &Services, name: String, version: String) -> Result<Value, IpcError> {
    if name.is_empty() {
        return Err(IpcError::InvalidArgument("Plugin name must not be empty".to_string()));
    }
    let mut handle = services.store.handle();
    let mut model = handle.write().await;
    tracing::info!("Registered plugin {} {}", name, version);
    let plugin = model.plugins.entry(name.clone()).or_default();
    plugin.name = name;
    plugin.version = version;
    Ok(Value::Null)
}

async fn unregister(services: &Services, name: &str) -> Result<Value, IpcError> {
    let mut handle = services.store.handle();
    let removed: Option<Plugin> = handle.write().await.plugins.remove(name);
    if removed.is_some() {
        tracing::info!("Unregistered plugin {}", name);
    }
    Ok(Value::Bool(removed.is_some()))
}

async fn set_data(services: &Services, plugin: &str, key: String, value: Value) -> Result<Value, IpcError> {
    let mut handle = services.store.handle();
    let mut model = handle.write().await;
    let Some(entry) = model.plugins.get_mut(plugin) else {
        return Err(IpcError::InvalidArgument(format!("Unknown plugin '{}'", plugin)));
    };
    if value.is_null() {
        entry.data.remove(&key);
    } else {
        entry.data.insert(key, value);
    }
    Ok(Value::Null)
}

// src/ipc/interception.rs - Intercept mode
use super::command::CommandSession;
use super::{Command, Connection, InterceptInit, IpcError};
use crate::code::{Code, CodeResult};
use crate::intercept::{InterceptDecision, InterceptRequest, InterceptionStage};
use crate::services::Services;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::oneshot;

/// A code offered to the client. `result` is only present for executed codes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterceptedCode {
    pub stage: InterceptionStage,
    pub code: Code,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<CodeResult>,
}

fn decision(command: &Command) -> Option<InterceptDecision> {
    Some(match command {
        Command::Ignore => InterceptDecision::Ignore,
        Command::Resolve { message_type, content } => {
            InterceptDecision::Resolve(CodeResult::from_message(*message_type, content.clone()))
        }
        Command::Rewrite { code } => InterceptDecision::Rewrite(code.clone()),
        Command::Cancel => InterceptDecision::Cancel,
        _ => return None,
    })
}

pub async fn run(services: &Arc<Services>, conn: &mut Connection, init: InterceptInit) -> Result<(), IpcError> {
    let mut registration = services
        .interceptor
        .register(conn.id(), init.interception_mode, init.filter);
    let mut session = CommandSession::new(conn.id());

    let outcome = loop {
        tokio::select! {
            request = registration.next_request() => {
                let Some(request) = request else { break Ok(()) };
                match offer(services, conn, &mut session, request).await {
                    Ok(true) => {}
                    Ok(false) => break Ok(()),
                    Err(e) => break Err(e),
                }
            }
            command = conn.receive::<Command>() => match command {
                Ok(Some(command)) if decision(&command).is_some() => {
                    tracing::debug!("IPC#{}: Dropping stale {} decision", conn.id(), command.name());
                }
                Ok(Some(command)) => {
                    let result = session.execute(services, command).await;
                    if let Err(e) = conn.send_response(result).await {
                        break Err(e);
                    }
                }
                Ok(None) => break Ok(()),
                Err(IpcError::Json(e)) => {
                    if let Err(e) = conn.send_response(Err(IpcError::Json(e))).await {
                        break Err(e);
                    }
                }
                Err(e) => break Err(e),
            }
        }
    };
    drop(registration);
    session.release(services).await;
    outcome
}

/// Hand one code to the client and, for pre and post codes, wait for its
/// decision. Returns `false` once the client has disconnected.
async fn offer(
    services: &Arc<Services>,
    conn: &mut Connection,
    session: &mut CommandSession,
    request: InterceptRequest,
) -> Result<bool, IpcError> {
    let InterceptRequest {
        code,
        stage,
        result,
        respond_to,
    } = request;
    conn.send(&InterceptedCode { stage, code, result }).await?;
    let Some(mut respond_to) = respond_to else {
        return Ok(true);
    };

    session.set_inserting(true);
    let outcome = await_decision(services, conn, session, &mut respond_to).await;
    session.set_inserting(false);

    match outcome? {
        Some(decision) => {
            if respond_to.send(decision).is_err() {
                tracing::debug!("IPC#{}: Decision arrived after the code was done", conn.id());
            }
            Ok(true)
        }
        None if respond_to.is_closed() => Ok(true),
        None => Ok(false),
    }
}

/// Commands sent while a decision is pending are executed as inserted codes.
/// `None` means the client went away or the code no longer needs a decision.
async fn await_decision(
    services: &Arc<Services>,
    conn: &mut Connection,
    session: &mut CommandSession,
    respond_to: &mut oneshot::Sender<InterceptDecision>,
) -> Result<Option<InterceptDecision>, IpcError> {
    loop {
        let command = tokio::select! {
            _ = respond_to.closed() => {
                tracing::debug!("IPC#{}: Intercepted code was cancelled or timed out", conn.id());
                return Ok(None);
            }
            command = conn.receive::<Command>() => command,
        };
        let command = match command {
            Ok(Some(command)) => command,
            Ok(None) => return Ok(None),
            Err(IpcError::Json(e)) => {
                conn.send_response(Err(IpcError::Json(e))).await?;
                continue;
            }
            Err(e) => return Err(e),
        };
        if let Some(decision) = decision(&command) {
            return Ok(Some(decision));
        }
        let result = session.execute(services, command).await;
        conn.send_response(result).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{CodeChannel, MessageType};
    use crate::config::Config;
    use crate::ipc::handle_connection;
    use crate::services::test_support::{services, spawn_firmware};
    use serde_json::{Value, json};
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf, duplex};

    type Lines = tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>;

    async fn observer(services: &Arc<Services>, init: Value) -> (Lines, WriteHalf<DuplexStream>) {
        let (client, server) = duplex(64 * 1024);
        tokio::spawn(handle_connection(services.clone(), 9, server));
        let (read, mut write) = tokio::io::split(client);
        let mut lines = BufReader::new(read).lines();
        lines.next_line().await.unwrap().unwrap();
        write.write_all(format!("{}\n", init).as_bytes()).await.unwrap();
        let response: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(response["success"], true);
        // registration happens right after the init response
        while services.interceptor.observer_count() == 0 {
            tokio::task::yield_now().await;
        }
        (lines, write)
    }

    async fn next_json(lines: &mut Lines) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(1), lines.next_line()).await.unwrap().unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn test_pre_observer_resolves_code() {
        let (services, commands) = services(Config::default());
        let forwarded = spawn_firmware(commands);
        let (mut lines, mut write) =
            observer(&services, json!({ "mode": "intercept", "interceptionMode": "pre", "channels": ["HTTP"] })).await;

        let pending = tokio::spawn(services.submit(Code::parse("G28", CodeChannel::Http).unwrap()));
        let offered = next_json(&mut lines).await;
        assert_eq!(offered["stage"], "pre");
        assert_eq!(offered["code"]["major"], 28);

        write
            .write_all(b"{\"command\":\"Resolve\",\"type\":\"Success\",\"content\":\"ok\"}\n")
            .await
            .unwrap();
        let result = pending.await.unwrap();
        assert_eq!(result.to_string(), "ok");
        assert_eq!(result.messages()[0].message_type, MessageType::Success);
        assert!(forwarded.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_inserted_code_runs_while_decision_is_pending() {
        let (services, commands) = services(Config::default());
        let forwarded = spawn_firmware(commands);
        let (mut lines, mut write) =
            observer(&services, json!({ "mode": "intercept", "interceptionMode": "pre", "filters": ["M291"] })).await;

        let pending = tokio::spawn(services.submit(Code::parse("M291 P\"hello\"", CodeChannel::Http).unwrap()));
        next_json(&mut lines).await;

        // the held code owns the channel's turn; an inserted code must not wait for it
        write
            .write_all(b"{\"command\":\"SimpleCode\",\"code\":\"M400\",\"channel\":\"HTTP\"}\n")
            .await
            .unwrap();
        let response = next_json(&mut lines).await;
        assert_eq!(response["success"], true);
        {
            let forwarded = forwarded.lock().unwrap();
            assert_eq!(forwarded.len(), 1);
            assert!(forwarded[0].flags.is_inserted);
        }

        write
            .write_all(b"{\"command\":\"Rewrite\",\"code\":{\"type\":\"M\",\"major\":292}}\n")
            .await
            .unwrap();
        let result = pending.await.unwrap();
        assert!(result.is_successful());
        let forwarded = forwarded.lock().unwrap();
        assert_eq!(forwarded.len(), 2);
        assert_eq!(forwarded[1].to_string(), "M292");
        assert_eq!(forwarded[1].channel, CodeChannel::Http);
    }

    #[tokio::test]
    async fn test_executed_observer_sees_result() {
        let (services, commands) = services(Config::default());
        spawn_firmware(commands);
        let (mut lines, _write) =
            observer(&services, json!({ "mode": "intercept", "interceptionMode": "executed" })).await;

        let result = services.submit(Code::parse("G4 S0", CodeChannel::Sbc).unwrap()).await;
        assert!(result.is_successful());
        let executed = next_json(&mut lines).await;
        assert_eq!(executed["stage"], "executed");
        assert_eq!(executed["code"]["major"], 4);
        assert_eq!(executed["result"], json!([]));
    }

    #[tokio::test]
    async fn test_disconnected_observer_releases_code() {
        let (services, commands) = services(Config::default());
        let forwarded = spawn_firmware(commands);
        let (mut lines, write) =
            observer(&services, json!({ "mode": "intercept", "interceptionMode": "post" })).await;

        let pending = tokio::spawn(services.submit(Code::parse("G1 X5", CodeChannel::Sbc).unwrap()));
        next_json(&mut lines).await;
        drop(write);
        drop(lines);

        let result = tokio::time::timeout(Duration::from_secs(1), pending).await.unwrap().unwrap();
        assert!(result.is_successful());
        assert_eq!(forwarded.lock().unwrap().len(), 1);
        while services.interceptor.observer_count() != 0 {
            tokio::task::yield_now().await;
        }
    }
}

// src/ipc/subscription.rs - Subscribe mode
use super::{Command, Connection, IpcError, SubscribeInit, SubscriptionMode};
use crate::model::patch::diff;
use crate::model::PathFilter;
use crate::model::filter::apply_filters;
use crate::services::Services;
use serde_json::Value;
use std::sync::Arc;

/// Send the model, then one update per change of the document. The next update
/// is only sent once the client has acknowledged the previous one; changes made
/// in between are folded into it.
pub async fn run(services: &Arc<Services>, conn: &mut Connection, init: SubscribeInit) -> Result<(), IpcError> {
    let filters: Vec<PathFilter> = init.filters.iter().map(|f| PathFilter::parse(f)).collect();
    let mut revision = services.store.subscribe();
    let mut handle = services.store.handle();

    revision.borrow_and_update();
    let mut baseline = apply_filters(&handle.snapshot().await?, &filters);
    conn.send(&baseline).await?;
    tracing::debug!("IPC#{}: Sent object model ({:?} mode)", conn.id(), init.subscription_mode);

    loop {
        if !wait_for_acknowledge(conn).await? {
            return Ok(());
        }

        let current = loop {
            tokio::select! {
                changed = revision.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                line = conn.read_line() => match line? {
                    None => return Ok(()),
                    Some(line) => tracing::debug!("IPC#{}: Ignoring '{}' while no update is pending", conn.id(), line.trim()),
                }
            }
            revision.borrow_and_update();
            let current = apply_filters(&handle.snapshot().await?, &filters);
            if current != baseline {
                break current;
            }
        };

        let update = match init.subscription_mode {
            SubscriptionMode::Full => current.clone(),
            SubscriptionMode::Patch => match diff(&baseline, &current) {
                Some(patch) => patch,
                None => continue,
            },
        };
        conn.send(&update).await?;
        baseline = current;
    }
}

/// `false` when the client disconnected instead.
async fn wait_for_acknowledge(conn: &mut Connection) -> Result<bool, IpcError> {
    loop {
        match conn.receive::<Command>().await {
            Ok(Some(Command::Acknowledge)) => return Ok(true),
            Ok(Some(other)) => {
                conn.send_response(Err(IpcError::UnsupportedCommand(other.name()))).await?;
            }
            Ok(None) => return Ok(false),
            Err(IpcError::Json(e)) => conn.send_response(Err(IpcError::Json(e))).await?,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::ipc::handle_connection;
    use crate::model::MachineStatus;
    use crate::model::patch::merge;
    use crate::services::test_support::services;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf, duplex};

    struct Subscriber {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        write: WriteHalf<DuplexStream>,
    }

    impl Subscriber {
        async fn connect(services: &Arc<Services>, init: Value) -> Self {
            let (client, server) = duplex(256 * 1024);
            tokio::spawn(handle_connection(services.clone(), 4, server));
            let (read, write) = tokio::io::split(client);
            let mut subscriber = Self {
                lines: BufReader::new(read).lines(),
                write,
            };
            subscriber.next().await;
            subscriber.send(init).await;
            assert_eq!(subscriber.next().await["success"], true);
            subscriber
        }

        async fn next(&mut self) -> Value {
            let line = tokio::time::timeout(Duration::from_secs(1), self.lines.next_line())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn send(&mut self, message: Value) {
            self.write.write_all(format!("{}\n", message).as_bytes()).await.unwrap();
        }

        async fn acknowledge(&mut self) {
            self.send(json!({ "command": "Acknowledge" })).await;
        }
    }

    #[tokio::test]
    async fn test_patch_stream_replays_to_full_snapshot() {
        let (services, _commands) = services(Config::default());
        let mut full = Subscriber::connect(&services, json!({ "mode": "subscribe", "subscriptionMode": "full" })).await;
        let mut patch = Subscriber::connect(&services, json!({ "mode": "subscribe", "subscriptionMode": "patch" })).await;

        let initial = full.next().await;
        let mut replayed = patch.next().await;
        assert_eq!(initial, replayed);

        let mut handle = services.store.handle();
        let mutations: [fn(&mut crate::model::ObjectModel); 3] = [
            |m| m.state.status = MachineStatus::Processing,
            |m| m.network.hostname = "duet".to_string(),
            |m| m.state.status = MachineStatus::Paused,
        ];
        let mut last_full = initial;
        for mutate in mutations {
            full.acknowledge().await;
            patch.acknowledge().await;
            mutate(&mut *handle.write().await);
            last_full = full.next().await;
            let update = patch.next().await;
            assert!(update.get("boards").is_none(), "patch carries unchanged sub-models");
            merge(&mut replayed, &update);
        }
        assert_eq!(replayed, last_full);
        assert_eq!(last_full["state"]["status"], "paused");
        assert_eq!(last_full["network"]["hostname"], "duet");
    }

    #[tokio::test]
    async fn test_filters_limit_updates() {
        let (services, _commands) = services(Config::default());
        let mut subscriber = Subscriber::connect(
            &services,
            json!({ "mode": "subscribe", "subscriptionMode": "patch", "filters": ["state/status"] }),
        )
        .await;
        assert_eq!(subscriber.next().await, json!({ "state": { "status": "idle" } }));
        subscriber.acknowledge().await;

        let mut handle = services.store.handle();
        // outside the filter: nothing is sent
        handle.write().await.network.hostname = "duet".to_string();
        handle.write().await.state.status = MachineStatus::Busy;
        assert_eq!(subscriber.next().await, json!({ "state": { "status": "busy" } }));
    }

    #[tokio::test]
    async fn test_updates_wait_for_acknowledge() {
        let (services, _commands) = services(Config::default());
        let mut subscriber = Subscriber::connect(&services, json!({ "mode": "subscribe", "subscriptionMode": "patch" })).await;
        subscriber.next().await;

        let mut handle = services.store.handle();
        handle.write().await.state.status = MachineStatus::Busy;
        assert!(
            tokio::time::timeout(Duration::from_millis(50), subscriber.lines.next_line())
                .await
                .is_err()
        );
        handle.write().await.network.hostname = "duet".to_string();
        subscriber.acknowledge().await;
        let update = subscriber.next().await;
        assert_eq!(update, json!({ "state": { "status": "busy" }, "network": { "hostname": "duet" } }));
    }
}

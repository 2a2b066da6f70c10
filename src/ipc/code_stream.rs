// src/ipc/code_stream.rs - Code stream mode: code text in, result text out
use super::{CodeStreamInit, Connection, IpcError};
use crate::code::{Code, CodeParseError, CodeResult};
use crate::services::Services;
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{FuturesOrdered, StreamExt};
use std::sync::Arc;

pub const MAX_BUFFER_SIZE: usize = 256;

/// Reads one code per line and answers with one result per code, in the order
/// the codes were read. At most `buffer_size` codes are in flight; further
/// input is not read until a result has been written.
pub async fn run(services: &Arc<Services>, conn: &mut Connection, init: CodeStreamInit) -> Result<(), IpcError> {
    let buffer_size = init.buffer_size.clamp(1, MAX_BUFFER_SIZE);
    let mut pending: FuturesOrdered<BoxFuture<'static, CodeResult>> = FuturesOrdered::new();
    let mut input_closed = false;
    tracing::debug!(
        "IPC#{}: Streaming codes on {} with {} buffered",
        conn.id(),
        init.channel,
        buffer_size
    );

    loop {
        if input_closed && pending.is_empty() {
            return Ok(());
        }
        tokio::select! {
            Some(result) = pending.next(), if !pending.is_empty() => {
                conn.write_line(result.to_string().trim_end()).await?;
            }
            line = conn.read_line(), if !input_closed && pending.len() < buffer_size => match line? {
                None => input_closed = true,
                Some(line) => match Code::parse(&line, init.channel) {
                    Ok(mut code) => {
                        code.source_connection = conn.id();
                        pending.push_back(services.submit(code).boxed());
                    }
                    Err(CodeParseError::Empty) => {}
                    Err(e) => {
                        let result = CodeResult::error(e.to_string());
                        pending.push_back(futures_util::future::ready(result).boxed());
                    }
                },
            },
        }
    }
}

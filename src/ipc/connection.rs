// src/ipc/connection.rs - Line-delimited JSON framing of one client connection
use super::{IpcError, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

pub struct Connection {
    id: u32,
    lines: Lines<BufReader<Reader>>,
    writer: Writer,
}

impl Connection {
    pub fn new<S>(id: u32, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let reader: Reader = Box::new(reader);
        Self {
            id,
            lines: BufReader::new(reader).lines(),
            writer: Box::new(writer),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Next raw line, `None` once the client has closed its side. Cancel safe,
    /// so it may race other futures in a `select!`.
    pub async fn read_line(&mut self) -> Result<Option<String>, IpcError> {
        Ok(self.lines.next_line().await?)
    }

    pub async fn write_line(&mut self, line: &str) -> Result<(), IpcError> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), IpcError> {
        let json = serde_json::to_string(message)?;
        self.write_line(&json).await
    }

    /// Next JSON message; blank lines are skipped.
    pub async fn receive<T: DeserializeOwned>(&mut self) -> Result<Option<T>, IpcError> {
        loop {
            let Some(line) = self.read_line().await? else {
                return Ok(None);
            };
            if line.trim().is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_str(&line)?));
        }
    }

    pub async fn send_response(&mut self, result: Result<Value, IpcError>) -> Result<(), IpcError> {
        if let Err(e) = &result {
            tracing::debug!("IPC#{}: Request failed: {}", self.id, e);
        }
        self.send(&Response::from_result(result)).await
    }
}

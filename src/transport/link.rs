//! Byte links between the host and the firmware.
use async_trait::async_trait;
use serial2_tokio::SerialPort;
use std::io;
use std::time::Duration;
use tokio::sync::mpsc;

/// Full-duplex exchange of equally sized buffers.
#[async_trait]
pub trait Link: Send {
    /// Send `tx` while receiving `rx.len()` bytes from the peer.
    async fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> io::Result<()>;
}

/// Firmware link over a serial port. The port is half duplex, so each exchange
/// writes first and then reads the peer's bytes of the same length.
pub struct SerialLink {
    port: SerialPort,
    timeout: Duration,
}

impl SerialLink {
    pub fn open(path: &str, baud: u32, timeout: Duration) -> io::Result<Self> {
        let port = SerialPort::open(path, baud)?;
        tracing::info!("Opened firmware link {} @ {} baud", path, baud);
        Ok(Self { port, timeout })
    }

    async fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let n = self.port.write(buf).await?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "serial port accepted no data"));
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    async fn read_exact(&self, buf: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.port.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "serial port closed"));
            }
            filled += n;
        }
        Ok(())
    }
}

#[async_trait]
impl Link for SerialLink {
    async fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> io::Result<()> {
        let exchange = async {
            self.write_all(tx).await?;
            self.read_exact(rx).await
        };
        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "firmware did not answer in time")),
        }
    }
}

/// In-process link; two ends created by [`MemoryLink::pair`] exchange buffers
/// with each other.
pub struct MemoryLink {
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl MemoryLink {
    pub fn pair() -> (MemoryLink, MemoryLink) {
        let (a_tx, b_rx) = mpsc::channel(1);
        let (b_tx, a_rx) = mpsc::channel(1);
        (MemoryLink { tx: a_tx, rx: a_rx }, MemoryLink { tx: b_tx, rx: b_rx })
    }
}

#[async_trait]
impl Link for MemoryLink {
    async fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> io::Result<()> {
        self.tx
            .send(tx.to_vec())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer closed"))?;
        let data = self
            .rx
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "peer closed"))?;
        let n = data.len().min(rx.len());
        rx[..n].copy_from_slice(&data[..n]);
        rx[n..].fill(0);
        Ok(())
    }
}

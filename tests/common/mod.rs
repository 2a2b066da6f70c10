// tests/common/mod.rs - Firmware emulator and socket client shared by the integration tests
#![allow(dead_code)]

use krusty_control::code::CodeType;
use krusty_control::config::Config;
use krusty_control::model::ModelHandle;
use krusty_control::transport::frame::BUFFER_SIZE;
use krusty_control::transport::packets::{MessageFlags, PacketWriter, decode_frame};
use krusty_control::transport::{FirmwareRequest, Framer, HostRequest, MemoryLink, binary_code};
use krusty_control::{Code, CodeChannel, ControlServer, ServerError, Services};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// A code as the emulated firmware saw it.
#[derive(Debug, Clone)]
pub struct Received {
    pub code: Code,
    /// Whether the host reported relative positioning on the code's channel
    /// at the moment the code arrived.
    pub relative_positioning: bool,
}

/// Answers every code with an empty reply (`M115` gets a firmware name),
/// grants movement locks and evaluates every expression to `42`. Anything else
/// the host sends is recorded in `requests`.
pub struct Emulator {
    pub codes: Arc<Mutex<Vec<Received>>>,
    pub requests: Arc<Mutex<Vec<HostRequest>>>,
    inject: mpsc::UnboundedSender<FirmwareRequest>,
}

impl Emulator {
    pub fn spawn(link: MemoryLink, model: ModelHandle) -> Self {
        let codes = Arc::new(Mutex::new(Vec::new()));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let (inject, injected) = mpsc::unbounded_channel();
        tokio::spawn(emulate(link, model, codes.clone(), requests.clone(), injected));
        Self { codes, requests, inject }
    }

    /// Send a request with the next frame.
    pub fn inject(&self, request: FirmwareRequest) {
        self.inject.send(request).unwrap();
    }

    pub fn code_texts(&self) -> Vec<String> {
        self.codes.lock().unwrap().iter().map(|r| r.code.to_string()).collect()
    }
}

async fn emulate(
    link: MemoryLink,
    mut model: ModelHandle,
    codes: Arc<Mutex<Vec<Received>>>,
    requests: Arc<Mutex<Vec<HostRequest>>>,
    mut injected: mpsc::UnboundedReceiver<FirmwareRequest>,
) {
    let mut framer = Framer::new(link, 0);
    let mut writer = PacketWriter::new(BUFFER_SIZE);
    let mut outbox = VecDeque::new();
    loop {
        while let Ok(request) = injected.try_recv() {
            outbox.push_back(request);
        }
        writer.push_queue(&mut outbox);
        let (payload, count) = writer.take_frame();
        if framer.send_frame(&payload, count).is_err() {
            return;
        }
        // the host is gone once a transfer fails
        let Ok(frame) = framer.receive_frame().await else {
            return;
        };
        for packet in decode_frame::<HostRequest>(&frame.data, frame.packet_count).into_iter().flatten() {
            match packet.request {
                HostRequest::Code { channel, data } => {
                    let code = binary_code::decode(&data).unwrap();
                    let relative_positioning = model.read().await.channels.get(channel).relative_positioning;
                    let reply = if code.is(CodeType::MCode, 115) { "FIRMWARE_NAME: emulator" } else { "" };
                    codes.lock().unwrap().push(Received {
                        code,
                        relative_positioning,
                    });
                    outbox.push_back(FirmwareRequest::CodeReply {
                        flags: MessageFlags(MessageFlags::BINARY_CODE_REPLY | channel.flag()),
                        reply: reply.to_string(),
                    });
                }
                HostRequest::LockMovementAndWaitForStandstill { channel } => {
                    outbox.push_back(FirmwareRequest::Locked { channel });
                }
                HostRequest::EvaluateExpression { expression, .. } => {
                    outbox.push_back(FirmwareRequest::EvaluationResult {
                        expression,
                        success: true,
                        result: "42".to_string(),
                    });
                }
                HostRequest::GetState | HostRequest::GetObjectModel { .. } => {}
                other => requests.lock().unwrap().push(other),
            }
        }
    }
}

/// A control server on a socket in a temporary directory, talking to an [`Emulator`].
pub struct TestServer {
    pub services: Arc<Services>,
    pub emulator: Emulator,
    pub socket: PathBuf,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<Result<(), ServerError>>,
    dir: TempDir,
}

impl TestServer {
    pub async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        for sub in ["gcodes", "macros", "sys"] {
            std::fs::create_dir_all(dir.path().join("sd").join(sub)).unwrap();
        }
        let mut config = Config::default();
        config.socket.path = dir.path().join("run").join("control.sock");
        config.files.base_directory = dir.path().join("sd");
        config.firmware.poll_interval_ms = 2;

        let (host, firmware) = MemoryLink::pair();
        let server = ControlServer::new(config, host);
        let services = server.services();
        let emulator = Emulator::spawn(firmware, services.store.handle());
        let shutdown = server.shutdown_handle();
        let socket = services.config.socket.path.clone();
        let task = tokio::spawn(server.run());

        eventually("the socket to appear", || socket.exists()).await;
        Self {
            services,
            emulator,
            socket,
            shutdown,
            task,
            dir,
        }
    }

    /// The virtual SD card, i.e. `0:/`.
    pub fn sd(&self) -> PathBuf {
        self.dir.path().join("sd")
    }

    pub async fn connect(&self, init: Value) -> Client {
        Client::connect(&self.socket, init).await
    }

    pub async fn stop(self) {
        self.shutdown.send(()).unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(5), self.task).await.unwrap();
        outcome.unwrap().unwrap();
    }
}

/// One IPC client connection.
pub struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    pub async fn connect(socket: &Path, init: Value) -> Self {
        let stream = UnixStream::connect(socket).await.unwrap();
        let (read, writer) = stream.into_split();
        let mut client = Self {
            lines: BufReader::new(read).lines(),
            writer,
        };
        let server_init = client.receive().await;
        assert!(server_init["id"].as_u64().is_some());
        client.send(&init).await;
        let response = client.receive().await;
        assert_eq!(response["success"], true, "init rejected: {}", response);
        client
    }

    pub async fn send(&mut self, value: &Value) {
        self.write_line(&value.to_string()).await;
    }

    pub async fn write_line(&mut self, line: &str) {
        self.writer.write_all(format!("{}\n", line).as_bytes()).await.unwrap();
    }

    pub async fn read_line(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("no reply from the server")
            .unwrap()
            .expect("connection closed")
    }

    pub async fn receive(&mut self) -> Value {
        serde_json::from_str(&self.read_line().await).unwrap()
    }

    pub async fn request(&mut self, value: Value) -> Value {
        self.send(&value).await;
        self.receive().await
    }

    pub async fn simple_code(&mut self, code: &str) -> Value {
        self.request(json!({ "command": "SimpleCode", "code": code, "channel": "HTTP" })).await
    }
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

pub fn file_codes(emulator: &Emulator) -> Vec<Code> {
    emulator
        .codes
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r.code.channel == CodeChannel::File)
        .map(|r| r.code.clone())
        .collect()
}

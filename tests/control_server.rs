// tests/control_server.rs - End-to-end tests over the IPC socket against an emulated firmware
mod common;

use common::{TestServer, eventually, file_codes};
use krusty_control::{CodeChannel, CodeType};
use krusty_control::model::MachineStatus;
use krusty_control::transport::{FirmwareRequest, HostRequest, PrintPausedReason};
use serde_json::json;

#[tokio::test]
async fn test_codes_reach_the_firmware() {
    let server = TestServer::start().await;
    let mut client = server.connect(json!({ "mode": "command" })).await;

    let response = client.simple_code("M115").await;
    assert_eq!(response["success"], true);
    assert_eq!(response["result"], "FIRMWARE_NAME: emulator");

    let response = client
        .request(json!({ "command": "EvaluateExpression", "expression": "move.axes[0].homed" }))
        .await;
    assert_eq!(response["result"], "42");

    let response = client.request(json!({ "command": "LockMovement", "channel": "HTTP" })).await;
    assert_eq!(response["success"], true);
    client.request(json!({ "command": "UnlockMovement", "channel": "HTTP" })).await;
    eventually("the unlock request", || {
        server
            .emulator
            .requests
            .lock()
            .unwrap()
            .contains(&HostRequest::Unlock { channel: CodeChannel::Http })
    })
    .await;

    assert_eq!(server.emulator.code_texts(), vec!["M115"]);
    server.stop().await;
}

#[tokio::test]
async fn test_relative_mode_is_known_before_the_next_move() {
    let server = TestServer::start().await;
    let mut stream = server.connect(json!({ "mode": "codeStream", "channel": "File" })).await;

    stream.write_line("G91").await;
    stream.write_line("G1 X10").await;
    assert_eq!(stream.read_line().await, "");
    assert_eq!(stream.read_line().await, "");

    let codes = server.emulator.codes.lock().unwrap().clone();
    assert_eq!(codes.len(), 2);
    assert!(codes[0].code.is(CodeType::GCode, 91) && !codes[0].relative_positioning);
    assert!(codes[1].code.is(CodeType::GCode, 1) && codes[1].relative_positioning);
    server.stop().await;
}

#[tokio::test]
async fn test_pre_observer_resolves_code() {
    let server = TestServer::start().await;
    let mut observer = server
        .connect(json!({
            "mode": "intercept",
            "interceptionMode": "pre",
            "channels": ["HTTP"],
            "filters": ["M42"],
        }))
        .await;
    eventually("the observer to register", || server.services.interceptor.observer_count() == 1).await;
    let mut client = server.connect(json!({ "mode": "command" })).await;

    client
        .send(&json!({ "command": "SimpleCode", "code": "M42 P1 S1", "channel": "HTTP" }))
        .await;
    let offered = observer.receive().await;
    assert_eq!(offered["stage"], "pre");
    assert_eq!(offered["code"]["major"], 42);
    observer
        .send(&json!({ "command": "Resolve", "type": "Success", "content": "ok" }))
        .await;
    let response = client.receive().await;
    assert_eq!(response["result"], "ok");

    // codes outside the filter pass straight through
    let response = client.simple_code("M115").await;
    assert_eq!(response["result"], "FIRMWARE_NAME: emulator");
    assert_eq!(server.emulator.code_texts(), vec!["M115"]);
    server.stop().await;
}

#[tokio::test]
async fn test_print_resumes_where_the_firmware_paused() {
    let server = TestServer::start().await;
    // 16 bytes per line, so byte 4096 starts line 256
    let line = "G1 X1.000 Y2.00\n";
    std::fs::write(server.sd().join("gcodes").join("part.g"), line.repeat(1024)).unwrap();
    let mut client = server.connect(json!({ "mode": "command" })).await;

    let response = client.request(json!({ "command": "StartPrint", "fileName": "part.g" })).await;
    assert_eq!(response["success"], true, "{}", response);
    eventually("the first print moves", || file_codes(&server.emulator).len() >= 3).await;

    server.emulator.inject(FirmwareRequest::PrintPaused {
        file_position: 4096,
        reason: PrintPausedReason::User,
    });
    eventually("the print to pause", || server.services.print.is_paused()).await;
    {
        let model = server.services.store.handle().read().await.clone();
        assert_eq!(model.state.status, MachineStatus::Paused);
        assert_eq!(model.job.file_position, Some(4096));
    }
    assert!(file_codes(&server.emulator).iter().all(|c| c.file_position < Some(4096)));

    let response = client.simple_code("M24").await;
    assert_eq!(response["success"], true);
    eventually("the print to continue at the pause position", || {
        file_codes(&server.emulator).iter().any(|c| c.file_position == Some(4096))
    })
    .await;
    server.stop().await;
}

#[tokio::test]
async fn test_m32_starts_a_print() {
    let server = TestServer::start().await;
    std::fs::write(server.sd().join("gcodes").join("cube.g"), "G28\nG1 X5\n").unwrap();
    let mut client = server.connect(json!({ "mode": "command" })).await;

    let response = client.simple_code(r#"M32 "0:/gcodes/cube.g""#).await;
    assert_eq!(response["success"], true, "{}", response);
    assert_eq!(response["result"], "");
    eventually("the print to finish", || {
        file_codes(&server.emulator).len() == 2 && !server.services.print.is_printing()
    })
    .await;
    let codes = file_codes(&server.emulator);
    assert!(codes[0].is(CodeType::GCode, 28) && codes[1].is(CodeType::GCode, 1));
    eventually("the print to be reported", || {
        server.emulator.requests.lock().unwrap().iter().any(|r| matches!(r, HostRequest::PrintStarted(_)))
    })
    .await;
    // M32 itself never reaches the firmware
    assert!(!server.emulator.code_texts().iter().any(|c| c.starts_with("M32")));
    server.stop().await;
}

#[tokio::test]
async fn test_firmware_requested_macros() {
    let server = TestServer::start().await;
    std::fs::write(server.sd().join("sys").join("trigger2.g"), "G4 P0\nM400\n").unwrap();

    server.emulator.inject(FirmwareRequest::ExecuteMacro {
        channel: CodeChannel::Trigger,
        report_missing: true,
        file_name: "trigger2.g".to_string(),
    });
    let completed = HostRequest::MacroCompleted {
        channel: CodeChannel::Trigger,
        error: false,
    };
    eventually("the macro to complete", || server.emulator.requests.lock().unwrap().contains(&completed)).await;
    {
        let codes = server.emulator.codes.lock().unwrap();
        assert_eq!(codes.len(), 2);
        assert!(codes[0].code.is(CodeType::GCode, 4) && codes[1].code.is(CodeType::MCode, 400));
        assert!(codes.iter().all(|r| r.code.flags.is_from_macro && r.code.channel == CodeChannel::Trigger));
    }
    assert_eq!(server.services.stacks.depth(CodeChannel::Trigger), 0);

    server.emulator.inject(FirmwareRequest::ExecuteMacro {
        channel: CodeChannel::Trigger,
        report_missing: true,
        file_name: "trigger3.g".to_string(),
    });
    let failed = HostRequest::MacroCompleted {
        channel: CodeChannel::Trigger,
        error: true,
    };
    eventually("the missing macro to be reported", || server.emulator.requests.lock().unwrap().contains(&failed)).await;
    let messages = server.services.store.handle().read().await.messages.clone();
    assert!(messages.iter().any(|m| m.content == "Macro file trigger3.g not found"));
    assert_eq!(server.services.stacks.depth(CodeChannel::Trigger), 0);
    server.stop().await;
}

#[tokio::test]
async fn test_subscriber_follows_firmware_state() {
    let server = TestServer::start().await;
    let mut subscriber = server
        .connect(json!({ "mode": "subscribe", "subscriptionMode": "patch", "filters": ["state/status"] }))
        .await;

    let baseline = subscriber.receive().await;
    assert_eq!(baseline["state"]["status"], "idle");
    subscriber.send(&json!({ "command": "Acknowledge" })).await;

    server.emulator.inject(FirmwareRequest::ObjectModel {
        module: 2,
        json: r#"{"status":"busy"}"#.to_string(),
    });
    let patch = subscriber.receive().await;
    assert_eq!(patch, json!({ "state": { "status": "busy" } }));
    server.stop().await;
}

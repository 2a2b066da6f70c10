//! # Object Model
//!
//! Typed mirror of the machine state shared by the firmware link, the file
//! engine and every client connection. The document is held by a
//! [`ModelStore`] and reached only through scoped read/write access.
//!
//! Serialization never produces JSON `null`: optional fields are skipped when
//! absent. Patches use `null` to mark removed keys, so keeping nulls out of the
//! document keeps patch application idempotent.

pub mod filter;
pub mod patch;
pub mod store;

pub use filter::PathFilter;
pub use store::{ModelError, ModelHandle, ModelStore, ReadScope, WriteScope};

use crate::code::{CodeChannel, Message};
use crate::transport::packets::PrintPausedReason;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectModel {
    pub boards: Vec<Board>,
    pub channels: Channels,
    pub fans: Vec<Fan>,
    pub heat: Heat,
    pub http_endpoints: Vec<HttpEndpoint>,
    pub job: Job,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_box: Option<MessageBox>,
    pub messages: Vec<Message>,
    #[serde(rename = "move")]
    pub motion: Move,
    pub network: Network,
    pub plugins: BTreeMap<String, Plugin>,
    pub scanner: Scanner,
    pub sensors: Sensors,
    pub spindles: Vec<Spindle>,
    pub state: MachineState,
    pub tools: Vec<Tool>,
    pub user_sessions: Vec<UserSession>,
    pub volumes: Vec<Volume>,
}

/// Messages kept in the message log.
pub const MAX_LOGGED_MESSAGES: usize = 64;

impl ObjectModel {
    /// Append to the message log, dropping the oldest entries beyond
    /// [`MAX_LOGGED_MESSAGES`].
    pub fn log_message(&mut self, message: Message) {
        self.messages.push(message);
        let excess = self.messages.len().saturating_sub(MAX_LOGGED_MESSAGES);
        self.messages.drain(..excess);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Board {
    pub firmware_name: String,
    pub firmware_version: String,
    pub name: String,
    pub short_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iap_file_name_sbc: Option<String>,
}

/// Per-channel execution state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Channel {
    pub compatibility: String,
    pub feedrate: f32,
    pub relative_extrusion: bool,
    pub relative_positioning: bool,
    pub using_inches: bool,
    pub stack_depth: u8,
    pub line_number: u64,
}

impl Default for Channel {
    fn default() -> Self {
        Self {
            compatibility: "RepRapFirmware".to_string(),
            feedrate: 50.0,
            relative_extrusion: true,
            relative_positioning: false,
            using_inches: false,
            stack_depth: 0,
            line_number: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Channels {
    pub http: Channel,
    pub telnet: Channel,
    pub file: Channel,
    pub usb: Channel,
    pub aux: Channel,
    pub trigger: Channel,
    pub queue: Channel,
    pub lcd: Channel,
    pub sbc: Channel,
    pub daemon: Channel,
    pub aux2: Channel,
    pub auto_pause: Channel,
}

impl Channels {
    pub fn get(&self, channel: CodeChannel) -> &Channel {
        match channel {
            CodeChannel::Http => &self.http,
            CodeChannel::Telnet => &self.telnet,
            CodeChannel::File => &self.file,
            CodeChannel::Usb => &self.usb,
            CodeChannel::Aux => &self.aux,
            CodeChannel::Trigger => &self.trigger,
            CodeChannel::Queue => &self.queue,
            CodeChannel::Lcd => &self.lcd,
            CodeChannel::Sbc => &self.sbc,
            CodeChannel::Daemon => &self.daemon,
            CodeChannel::Aux2 => &self.aux2,
            CodeChannel::AutoPause => &self.auto_pause,
        }
    }

    pub fn get_mut(&mut self, channel: CodeChannel) -> &mut Channel {
        match channel {
            CodeChannel::Http => &mut self.http,
            CodeChannel::Telnet => &mut self.telnet,
            CodeChannel::File => &mut self.file,
            CodeChannel::Usb => &mut self.usb,
            CodeChannel::Aux => &mut self.aux,
            CodeChannel::Trigger => &mut self.trigger,
            CodeChannel::Queue => &mut self.queue,
            CodeChannel::Lcd => &mut self.lcd,
            CodeChannel::Sbc => &mut self.sbc,
            CodeChannel::Daemon => &mut self.daemon,
            CodeChannel::Aux2 => &mut self.aux2,
            CodeChannel::AutoPause => &mut self.auto_pause,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Fan {
    pub name: String,
    pub actual_value: f64,
    pub requested_value: f64,
    pub rpm: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HeaterState {
    #[default]
    Off,
    Standby,
    Active,
    Fault,
    Tuning,
    Offline,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Heater {
    pub current: f64,
    pub active: f64,
    pub standby: f64,
    pub state: HeaterState,
    pub sensor: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Heat {
    pub bed_heaters: Vec<i32>,
    pub chamber_heaters: Vec<i32>,
    pub cold_extrude_temperature: f64,
    pub cold_retract_temperature: f64,
    pub heaters: Vec<Heater>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpEndpointType {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Trace,
    Delete,
    Options,
    #[serde(rename = "WebSocket")]
    WebSocket,
}

/// Third-party HTTP endpoint served through a unix socket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpEndpoint {
    pub endpoint_type: HttpEndpointType,
    pub namespace: String,
    pub path: String,
    pub unix_socket: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobFile {
    pub file_name: String,
    pub size: u64,
    pub layer_height: f32,
    pub height: f32,
    pub filament: Vec<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub print_time: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Job {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<JobFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_position: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_file_name: Option<String>,
    pub last_file_aborted: bool,
    pub last_file_cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<PrintPausedReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layer: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageBox {
    pub mode: u8,
    pub title: String,
    pub message: String,
    pub timeout: u32,
    pub axis_controls: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Axis {
    pub letter: String,
    pub homed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_position: Option<f64>,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Extruder {
    pub position: f64,
    pub factor: f64,
}

/// Mesh compensation grid reported by the firmware.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeightMap {
    pub x_min: f32,
    pub x_max: f32,
    pub x_spacing: f32,
    pub y_min: f32,
    pub y_max: f32,
    pub y_spacing: f32,
    pub radius: f32,
    pub num_x: u16,
    pub num_y: u16,
    pub z_coordinates: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Move {
    pub axes: Vec<Axis>,
    pub extruders: Vec<Extruder>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height_map: Option<HeightMap>,
    pub speed_factor: f64,
}

impl Default for Move {
    fn default() -> Self {
        Self {
            axes: Vec::new(),
            extruders: Vec::new(),
            height_map: None,
            speed_factor: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkInterface {
    #[serde(rename = "type")]
    pub interface_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Network {
    pub hostname: String,
    pub name: String,
    pub interfaces: Vec<NetworkInterface>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Plugin {
    pub name: String,
    pub version: String,
    pub data: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScannerStatus {
    #[default]
    Disconnected,
    Idle,
    Scanning,
    PostProcessing,
    Calibrating,
    Uploading,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Scanner {
    pub progress: f64,
    pub status: ScannerStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalogSensor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reading: Option<f64>,
    #[serde(rename = "type")]
    pub sensor_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Endstop {
    pub triggered: bool,
    #[serde(rename = "type")]
    pub endstop_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Probe {
    pub value: Vec<i32>,
    pub threshold: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Sensors {
    pub analog: Vec<AnalogSensor>,
    pub endstops: Vec<Endstop>,
    pub probes: Vec<Probe>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Spindle {
    pub active: f64,
    pub current: f64,
    pub tool: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MachineStatus {
    Starting,
    Updating,
    Off,
    Halted,
    Pausing,
    Paused,
    Resuming,
    Processing,
    Simulating,
    Busy,
    ChangingTool,
    #[default]
    Idle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MachineState {
    pub status: MachineStatus,
    pub current_tool: i32,
    pub display_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
    pub machine_mode: String,
    pub up_time: u64,
}

impl Default for MachineState {
    fn default() -> Self {
        Self {
            status: MachineStatus::Idle,
            current_tool: -1,
            display_message: String::new(),
            log_file: None,
            machine_mode: "FFF".to_string(),
            up_time: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolState {
    #[default]
    Off,
    Active,
    Standby,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Tool {
    pub number: i32,
    pub name: String,
    pub fans: Vec<i32>,
    pub heaters: Vec<i32>,
    pub extruders: Vec<i32>,
    pub active: Vec<f64>,
    pub standby: Vec<f64>,
    pub offsets: Vec<f64>,
    pub state: ToolState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AccessLevel {
    #[default]
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionType {
    #[default]
    Local,
    Http,
    Telnet,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserSession {
    pub id: u32,
    pub access_level: AccessLevel,
    pub session_type: SessionType,
    pub origin: String,
    pub origin_id: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Volume {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub mounted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub free_space: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_space: Option<u64>,
}

/// Sub-model addressed by a firmware object model module number.
pub fn module_key(module: u8) -> Option<Option<&'static str>> {
    Some(match module {
        0 => None,
        1 => Some("boards"),
        2 => Some("state"),
        3 => Some("job"),
        4 => Some("move"),
        5 => Some("heat"),
        6 => Some("fans"),
        7 => Some("tools"),
        8 => Some("sensors"),
        9 => Some("network"),
        10 => Some("volumes"),
        11 => Some("spindles"),
        12 => Some("scanner"),
        13 => Some("channels"),
        _ => return None,
    })
}

//! Packet codec: typed requests inside a transfer frame.
//!
//! A frame payload is a sequence of packets, each an 8 byte header followed by
//! a payload padded to four bytes. Requests flowing from the firmware to the
//! host are [`FirmwareRequest`]s, the other direction uses [`HostRequest`].

use super::frame::{BUFFER_SIZE, pad4};
use crate::code::CodeChannel;
use crate::model::HeightMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;

pub const PACKET_HEADER_SIZE: usize = 8;
/// Largest binary code accepted by the firmware.
pub const MAX_CODE_SIZE: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Packet truncated")]
    Truncated,
    #[error("Unknown request {0}")]
    UnknownRequest(u16),
    #[error("Invalid channel {0}")]
    InvalidChannel(u8),
    #[error("Invalid {0}")]
    InvalidValue(&'static str),
    #[error("Invalid UTF-8 in packet")]
    InvalidUtf8,
    #[error("Packet length {length} exceeds the {remaining} bytes left in the frame")]
    Oversized { length: usize, remaining: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("Binary code of {0} bytes exceeds the maximum of {MAX_CODE_SIZE}")]
    CodeTooLong(usize),
    #[error("Comments cannot be sent to the firmware")]
    NotExecutable,
    #[error("Packet of {0} bytes can never fit into a frame")]
    PacketTooLarge(usize),
    #[error("{0} does not fit into a binary code")]
    OutOfRange(&'static str),
}

/// Message type flags attached to firmware replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageFlags(pub u32);

impl MessageFlags {
    pub const ERROR: u32 = 0x0100_0000;
    pub const WARNING: u32 = 0x0200_0000;
    pub const BINARY_CODE_REPLY: u32 = 0x1000_0000;
    /// Partial reply, concatenated with the next one.
    pub const PUSH: u32 = 0x2000_0000;

    pub fn has(self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    pub fn has_channel(self, channel: CodeChannel) -> bool {
        self.has(channel.flag())
    }

    pub fn message_type(self) -> crate::code::MessageType {
        use crate::code::MessageType;
        if self.has(Self::ERROR) {
            MessageType::Error
        } else if self.has(Self::WARNING) {
            MessageType::Warning
        } else {
            MessageType::Success
        }
    }
}

/// Flags of a firmware stack event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StackFlags(pub u16);

impl StackFlags {
    pub const DRIVES_RELATIVE: u16 = 0x01;
    pub const AXES_RELATIVE: u16 = 0x02;
    pub const USING_INCHES: u16 = 0x04;

    pub fn has(self, flag: u16) -> bool {
        self.0 & flag != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PrintPausedReason {
    User = 1,
    GCode = 2,
    FilamentChange = 3,
    Trigger = 4,
    HeaterFault = 5,
    Filament = 6,
    Stall = 7,
    LowVoltage = 8,
}

impl PrintPausedReason {
    fn from_u8(value: u8) -> Result<Self, DecodeError> {
        Ok(match value {
            1 => Self::User,
            2 => Self::GCode,
            3 => Self::FilamentChange,
            4 => Self::Trigger,
            5 => Self::HeaterFault,
            6 => Self::Filament,
            7 => Self::Stall,
            8 => Self::LowVoltage,
            _ => return Err(DecodeError::InvalidValue("pause reason")),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PrintStoppedReason {
    NormalCompletion = 0,
    UserCancelled = 1,
    Abort = 2,
}

impl PrintStoppedReason {
    fn from_u8(value: u8) -> Result<Self, DecodeError> {
        Ok(match value {
            0 => Self::NormalCompletion,
            1 => Self::UserCancelled,
            2 => Self::Abort,
            _ => return Err(DecodeError::InvalidValue("stop reason")),
        })
    }
}

/// Information about a file that starts printing.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PrintStartedInfo {
    pub file_name: String,
    pub file_size: u32,
    pub layer_height: f32,
    pub object_height: f32,
    pub print_time: u32,
    pub filament: Vec<f32>,
}

/// Requests sent by the firmware.
#[derive(Debug, Clone, PartialEq)]
pub enum FirmwareRequest {
    ResendPacket { packet_id: u16 },
    ReportState { busy_channels: u32 },
    ObjectModel { module: u8, json: String },
    CodeReply { flags: MessageFlags, reply: String },
    ExecuteMacro { channel: CodeChannel, report_missing: bool, file_name: String },
    AbortFile { channel: CodeChannel },
    StackEvent { channel: CodeChannel, depth: u8, flags: StackFlags, feedrate: f32 },
    PrintPaused { file_position: u32, reason: PrintPausedReason },
    HeightMap(HeightMap),
    Locked { channel: CodeChannel },
    EvaluationResult { expression: String, success: bool, result: String },
}

/// Requests sent by the host.
#[derive(Debug, Clone, PartialEq)]
pub enum HostRequest {
    EmergencyStop,
    Reset,
    Code { channel: CodeChannel, data: Vec<u8> },
    GetState,
    GetObjectModel { module: u8 },
    SetObjectModel { field: String, value: String },
    PrintStarted(PrintStartedInfo),
    PrintStopped { reason: PrintStoppedReason },
    MacroCompleted { channel: CodeChannel, error: bool },
    GetHeightMap,
    LockMovementAndWaitForStandstill { channel: CodeChannel },
    Unlock { channel: CodeChannel },
    EvaluateExpression { channel: CodeChannel, expression: String },
}

/// A request kind that can be carried in a packet.
pub trait WireRequest: Sized {
    fn request_id(&self) -> u16;
    fn write_payload(&self, w: &mut PayloadWriter);
    fn read_payload(request: u16, r: &mut PayloadReader<'_>) -> Result<Self, DecodeError>;
}

/// Little-endian payload builder.
#[derive(Debug, Default)]
pub struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }
    pub fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    pub fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    pub fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    pub fn f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    pub fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }
    pub fn align(&mut self) {
        self.buf.resize(pad4(self.buf.len()), 0);
    }
    pub fn len(&self) -> usize {
        self.buf.len()
    }
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Little-endian payload cursor.
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }
    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(n).ok_or(DecodeError::Truncated)?;
        let slice = self.buf.get(self.pos..end).ok_or(DecodeError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }
    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }
    pub fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }
    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
    pub fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(self.u32()? as i32)
    }
    pub fn f32(&mut self) -> Result<f32, DecodeError> {
        Ok(f32::from_bits(self.u32()?))
    }
    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        self.take(n)
    }
    pub fn string(&mut self, n: usize) -> Result<String, DecodeError> {
        let bytes = self.take(n)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
    }
    pub fn channel(&mut self) -> Result<CodeChannel, DecodeError> {
        let value = self.u8()?;
        CodeChannel::from_index(value).ok_or(DecodeError::InvalidChannel(value))
    }
    pub fn align(&mut self) {
        self.pos = pad4(self.pos).min(self.buf.len());
    }
    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

fn write_len(w: &mut PayloadWriter, s: &str) {
    w.u16(s.len() as u16);
}

impl WireRequest for FirmwareRequest {
    fn request_id(&self) -> u16 {
        match self {
            FirmwareRequest::ResendPacket { .. } => 0,
            FirmwareRequest::ReportState { .. } => 1,
            FirmwareRequest::ObjectModel { .. } => 2,
            FirmwareRequest::CodeReply { .. } => 3,
            FirmwareRequest::ExecuteMacro { .. } => 4,
            FirmwareRequest::AbortFile { .. } => 5,
            FirmwareRequest::StackEvent { .. } => 6,
            FirmwareRequest::PrintPaused { .. } => 7,
            FirmwareRequest::HeightMap(_) => 8,
            FirmwareRequest::Locked { .. } => 9,
            FirmwareRequest::EvaluationResult { .. } => 10,
        }
    }

    fn write_payload(&self, w: &mut PayloadWriter) {
        match self {
            FirmwareRequest::ResendPacket { packet_id } => w.u16(*packet_id),
            FirmwareRequest::ReportState { busy_channels } => w.u32(*busy_channels),
            FirmwareRequest::ObjectModel { module, json } => {
                w.u8(*module);
                w.u8(0);
                write_len(w, json);
                w.bytes(json.as_bytes());
            }
            FirmwareRequest::CodeReply { flags, reply } => {
                w.u32(flags.0);
                write_len(w, reply);
                w.u16(0);
                w.bytes(reply.as_bytes());
            }
            FirmwareRequest::ExecuteMacro { channel, report_missing, file_name } => {
                w.u8(channel.index() as u8);
                w.u8(*report_missing as u8);
                write_len(w, file_name);
                w.bytes(file_name.as_bytes());
            }
            FirmwareRequest::AbortFile { channel } | FirmwareRequest::Locked { channel } => {
                w.u8(channel.index() as u8)
            }
            FirmwareRequest::StackEvent { channel, depth, flags, feedrate } => {
                w.u8(channel.index() as u8);
                w.u8(*depth);
                w.u16(flags.0);
                w.f32(*feedrate);
            }
            FirmwareRequest::PrintPaused { file_position, reason } => {
                w.u32(*file_position);
                w.u8(*reason as u8);
            }
            FirmwareRequest::HeightMap(map) => {
                for v in [map.x_min, map.x_max, map.x_spacing, map.y_min, map.y_max, map.y_spacing, map.radius] {
                    w.f32(v);
                }
                w.u16(map.num_x);
                w.u16(map.num_y);
                for z in &map.z_coordinates {
                    w.f32(*z);
                }
            }
            FirmwareRequest::EvaluationResult { expression, success, result } => {
                w.u8(*success as u8);
                w.u8(0);
                write_len(w, expression);
                write_len(w, result);
                w.u16(0);
                w.bytes(expression.as_bytes());
                w.bytes(result.as_bytes());
            }
        }
    }

    fn read_payload(request: u16, r: &mut PayloadReader<'_>) -> Result<Self, DecodeError> {
        Ok(match request {
            0 => FirmwareRequest::ResendPacket { packet_id: r.u16()? },
            1 => FirmwareRequest::ReportState { busy_channels: r.u32()? },
            2 => {
                let module = r.u8()?;
                r.u8()?;
                let len = r.u16()? as usize;
                FirmwareRequest::ObjectModel { module, json: r.string(len)? }
            }
            3 => {
                let flags = MessageFlags(r.u32()?);
                let len = r.u16()? as usize;
                r.u16()?;
                FirmwareRequest::CodeReply { flags, reply: r.string(len)? }
            }
            4 => {
                let channel = r.channel()?;
                let report_missing = r.u8()? != 0;
                let len = r.u16()? as usize;
                FirmwareRequest::ExecuteMacro { channel, report_missing, file_name: r.string(len)? }
            }
            5 => FirmwareRequest::AbortFile { channel: r.channel()? },
            6 => FirmwareRequest::StackEvent {
                channel: r.channel()?,
                depth: r.u8()?,
                flags: StackFlags(r.u16()?),
                feedrate: r.f32()?,
            },
            7 => FirmwareRequest::PrintPaused {
                file_position: r.u32()?,
                reason: PrintPausedReason::from_u8(r.u8()?)?,
            },
            8 => {
                let mut v = [0f32; 7];
                for slot in v.iter_mut() {
                    *slot = r.f32()?;
                }
                let num_x = r.u16()?;
                let num_y = r.u16()?;
                let count = num_x as usize * num_y as usize;
                if count * 4 > r.remaining().len() {
                    return Err(DecodeError::Truncated);
                }
                let z_coordinates = (0..count).map(|_| r.f32()).collect::<Result<Vec<_>, _>>()?;
                FirmwareRequest::HeightMap(HeightMap {
                    x_min: v[0],
                    x_max: v[1],
                    x_spacing: v[2],
                    y_min: v[3],
                    y_max: v[4],
                    y_spacing: v[5],
                    radius: v[6],
                    num_x,
                    num_y,
                    z_coordinates,
                })
            }
            9 => FirmwareRequest::Locked { channel: r.channel()? },
            10 => {
                let success = r.u8()? != 0;
                r.u8()?;
                let expression_len = r.u16()? as usize;
                let result_len = r.u16()? as usize;
                r.u16()?;
                FirmwareRequest::EvaluationResult {
                    expression: r.string(expression_len)?,
                    success,
                    result: r.string(result_len)?,
                }
            }
            other => return Err(DecodeError::UnknownRequest(other)),
        })
    }
}

impl WireRequest for HostRequest {
    fn request_id(&self) -> u16 {
        match self {
            HostRequest::EmergencyStop => 0,
            HostRequest::Reset => 1,
            HostRequest::Code { .. } => 2,
            HostRequest::GetState => 3,
            HostRequest::GetObjectModel { .. } => 4,
            HostRequest::SetObjectModel { .. } => 5,
            HostRequest::PrintStarted(_) => 6,
            HostRequest::PrintStopped { .. } => 7,
            HostRequest::MacroCompleted { .. } => 8,
            HostRequest::GetHeightMap => 9,
            HostRequest::LockMovementAndWaitForStandstill { .. } => 10,
            HostRequest::Unlock { .. } => 11,
            HostRequest::EvaluateExpression { .. } => 12,
        }
    }

    fn write_payload(&self, w: &mut PayloadWriter) {
        match self {
            HostRequest::EmergencyStop | HostRequest::Reset | HostRequest::GetState | HostRequest::GetHeightMap => {}
            HostRequest::Code { channel, data } => {
                w.u8(channel.index() as u8);
                w.u8(0);
                w.u16(data.len() as u16);
                w.bytes(data);
            }
            HostRequest::GetObjectModel { module } => w.u8(*module),
            HostRequest::SetObjectModel { field, value } => {
                write_len(w, field);
                write_len(w, value);
                w.bytes(field.as_bytes());
                w.bytes(value.as_bytes());
            }
            HostRequest::PrintStarted(info) => {
                w.u32(info.file_size);
                w.f32(info.layer_height);
                w.f32(info.object_height);
                w.u32(info.print_time);
                write_len(w, &info.file_name);
                w.u16(info.filament.len() as u16);
                for f in &info.filament {
                    w.f32(*f);
                }
                w.bytes(info.file_name.as_bytes());
            }
            HostRequest::PrintStopped { reason } => w.u8(*reason as u8),
            HostRequest::MacroCompleted { channel, error } => {
                w.u8(channel.index() as u8);
                w.u8(*error as u8);
            }
            HostRequest::LockMovementAndWaitForStandstill { channel } | HostRequest::Unlock { channel } => {
                w.u8(channel.index() as u8)
            }
            HostRequest::EvaluateExpression { channel, expression } => {
                w.u8(channel.index() as u8);
                w.u8(0);
                write_len(w, expression);
                w.bytes(expression.as_bytes());
            }
        }
    }

    fn read_payload(request: u16, r: &mut PayloadReader<'_>) -> Result<Self, DecodeError> {
        Ok(match request {
            0 => HostRequest::EmergencyStop,
            1 => HostRequest::Reset,
            2 => {
                let channel = r.channel()?;
                r.u8()?;
                let len = r.u16()? as usize;
                if len > MAX_CODE_SIZE {
                    return Err(DecodeError::InvalidValue("code length"));
                }
                HostRequest::Code { channel, data: r.bytes(len)?.to_vec() }
            }
            3 => HostRequest::GetState,
            4 => HostRequest::GetObjectModel { module: r.u8()? },
            5 => {
                let field_len = r.u16()? as usize;
                let value_len = r.u16()? as usize;
                HostRequest::SetObjectModel { field: r.string(field_len)?, value: r.string(value_len)? }
            }
            6 => {
                let file_size = r.u32()?;
                let layer_height = r.f32()?;
                let object_height = r.f32()?;
                let print_time = r.u32()?;
                let name_len = r.u16()? as usize;
                let filament_count = r.u16()? as usize;
                let filament = (0..filament_count).map(|_| r.f32()).collect::<Result<Vec<_>, _>>()?;
                HostRequest::PrintStarted(PrintStartedInfo {
                    file_name: r.string(name_len)?,
                    file_size,
                    layer_height,
                    object_height,
                    print_time,
                    filament,
                })
            }
            7 => HostRequest::PrintStopped { reason: PrintStoppedReason::from_u8(r.u8()?)? },
            8 => HostRequest::MacroCompleted { channel: r.channel()?, error: r.u8()? != 0 },
            9 => HostRequest::GetHeightMap,
            10 => HostRequest::LockMovementAndWaitForStandstill { channel: r.channel()? },
            11 => HostRequest::Unlock { channel: r.channel()? },
            12 => {
                let channel = r.channel()?;
                r.u8()?;
                let len = r.u16()? as usize;
                HostRequest::EvaluateExpression { channel, expression: r.string(len)? }
            }
            other => return Err(DecodeError::UnknownRequest(other)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub request: u16,
    pub id: u16,
    pub length: u16,
    pub resend_packet_id: u16,
}

/// A decoded packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet<R> {
    pub header: PacketHeader,
    pub request: R,
}

/// Encode one request into a complete packet (header + padded payload).
pub fn encode_packet<R: WireRequest>(request: &R, id: u16) -> Vec<u8> {
    let mut payload = PayloadWriter::new();
    request.write_payload(&mut payload);
    let length = payload.len();
    let mut out = Vec::with_capacity(PACKET_HEADER_SIZE + pad4(length));
    out.extend_from_slice(&request.request_id().to_le_bytes());
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(&(length as u16).to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&payload.into_inner());
    out.resize(PACKET_HEADER_SIZE + pad4(length), 0);
    out
}

/// Decode every packet of a frame. A malformed packet yields an error entry and
/// decoding continues with the next one; only a length running past the end of
/// the frame stops decoding.
pub fn decode_frame<R: WireRequest>(data: &[u8], packet_count: u8) -> Vec<Result<Packet<R>, DecodeError>> {
    let mut packets = Vec::new();
    let mut offset = 0;
    while packets.len() < packet_count as usize && offset + PACKET_HEADER_SIZE <= data.len() {
        let mut r = PayloadReader::new(&data[offset..offset + PACKET_HEADER_SIZE]);
        let header = match (r.u16(), r.u16(), r.u16(), r.u16()) {
            (Ok(request), Ok(id), Ok(length), Ok(resend_packet_id)) => PacketHeader { request, id, length, resend_packet_id },
            _ => break,
        };
        offset += PACKET_HEADER_SIZE;
        let length = header.length as usize;
        let remaining = data.len() - offset;
        if length > remaining {
            packets.push(Err(DecodeError::Oversized { length, remaining }));
            break;
        }
        let mut payload = PayloadReader::new(&data[offset..offset + length]);
        packets.push(R::read_payload(header.request, &mut payload).map(|request| Packet { header, request }));
        offset += pad4(length).min(remaining);
    }
    if packets.len() < packet_count as usize && !matches!(packets.last(), Some(Err(DecodeError::Oversized { .. }))) {
        packets.push(Err(DecodeError::Truncated));
    }
    packets
}

/// Builds outgoing frames. Packet ids start at 0 in every frame. The packets of
/// the frame taken last are kept, so the firmware can ask for one of them again
/// by id while the next frame is filled.
#[derive(Debug)]
pub struct PacketWriter {
    capacity: usize,
    buf: Vec<u8>,
    count: u8,
    next_id: u16,
    current: Vec<(u16, Vec<u8>)>,
    previous: Vec<(u16, Vec<u8>)>,
}

impl PacketWriter {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.min(BUFFER_SIZE),
            buf: Vec::with_capacity(capacity),
            count: 0,
            next_id: 0,
            current: Vec::new(),
            previous: Vec::new(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.buf.len()
    }

    /// Append a request if it fits into this frame. Returns `false` when it has
    /// to wait for the next one.
    pub fn push<R: WireRequest>(&mut self, request: &R) -> Result<bool, EncodeError> {
        let packet = encode_packet(request, self.next_id);
        if packet.len() > self.capacity {
            return Err(EncodeError::PacketTooLarge(packet.len()));
        }
        if packet.len() > self.remaining() || self.count == u8::MAX {
            return Ok(false);
        }
        self.buf.extend_from_slice(&packet);
        self.current.push((self.next_id, packet));
        self.next_id = self.next_id.wrapping_add(1);
        self.count += 1;
        Ok(true)
    }

    /// Push queued requests in order until one does not fit; the rest stays queued.
    pub fn push_queue<R: WireRequest>(&mut self, queue: &mut VecDeque<R>) -> Vec<EncodeError> {
        let mut errors = Vec::new();
        while let Some(request) = queue.front() {
            match self.push(request) {
                Ok(true) => {
                    queue.pop_front();
                }
                Ok(false) => break,
                Err(e) => {
                    queue.pop_front();
                    errors.push(e);
                }
            }
        }
        errors
    }

    /// Copy a packet of the previous frame into this one.
    pub fn resend(&mut self, packet_id: u16) -> bool {
        let Some((_, packet)) = self.previous.iter().find(|(id, _)| *id == packet_id).cloned() else {
            return false;
        };
        if packet.len() > self.remaining() || self.count == u8::MAX {
            return false;
        }
        self.buf.extend_from_slice(&packet);
        self.current.push((packet_id, packet));
        self.count += 1;
        true
    }

    /// Finish the current frame and start a new one.
    pub fn take_frame(&mut self) -> (Vec<u8>, u8) {
        self.previous = std::mem::take(&mut self.current);
        self.next_id = 0;
        let count = std::mem::take(&mut self.count);
        (std::mem::take(&mut self.buf), count)
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.count = 0;
        self.next_id = 0;
        self.current.clear();
        self.previous.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<R: WireRequest + std::fmt::Debug + PartialEq>(request: R) {
        let packet = encode_packet(&request, 3);
        assert_eq!(packet.len() % 4, 0);
        let decoded = decode_frame::<R>(&packet, 1);
        assert_eq!(decoded.len(), 1);
        let decoded = decoded.into_iter().next().unwrap().unwrap();
        assert_eq!(decoded.header.id, 3);
        assert_eq!(decoded.request, request);
    }

    #[test]
    fn test_every_firmware_request_round_trips() {
        round_trip(FirmwareRequest::ResendPacket { packet_id: 9 });
        round_trip(FirmwareRequest::ReportState { busy_channels: 0b101 });
        round_trip(FirmwareRequest::ObjectModel { module: 2, json: "{\"state\":{\"status\":\"idle\"}}".to_string() });
        round_trip(FirmwareRequest::CodeReply {
            flags: MessageFlags(MessageFlags::BINARY_CODE_REPLY | CodeChannel::Http.flag()),
            reply: "ok".to_string(),
        });
        round_trip(FirmwareRequest::ExecuteMacro {
            channel: CodeChannel::Trigger,
            report_missing: true,
            file_name: "homeall.g".to_string(),
        });
        round_trip(FirmwareRequest::AbortFile { channel: CodeChannel::File });
        round_trip(FirmwareRequest::StackEvent {
            channel: CodeChannel::Usb,
            depth: 2,
            flags: StackFlags(StackFlags::AXES_RELATIVE),
            feedrate: 50.0,
        });
        round_trip(FirmwareRequest::PrintPaused { file_position: 4096, reason: PrintPausedReason::Filament });
        round_trip(FirmwareRequest::HeightMap(HeightMap {
            x_min: 0.0,
            x_max: 20.0,
            x_spacing: 10.0,
            y_min: 0.0,
            y_max: 10.0,
            y_spacing: 10.0,
            radius: -1.0,
            num_x: 3,
            num_y: 2,
            z_coordinates: vec![0.1, 0.2, 0.3, -0.1, -0.2, 0.0],
        }));
        round_trip(FirmwareRequest::Locked { channel: CodeChannel::Daemon });
        round_trip(FirmwareRequest::EvaluationResult {
            expression: "move.axes[0].homed".to_string(),
            success: true,
            result: "true".to_string(),
        });
    }

    #[test]
    fn test_every_host_request_round_trips() {
        round_trip(HostRequest::EmergencyStop);
        round_trip(HostRequest::Reset);
        round_trip(HostRequest::Code { channel: CodeChannel::File, data: vec![1, 2, 3, 4, 5] });
        round_trip(HostRequest::GetState);
        round_trip(HostRequest::GetObjectModel { module: 3 });
        round_trip(HostRequest::SetObjectModel { field: "state.displayMessage".to_string(), value: "\"hi\"".to_string() });
        round_trip(HostRequest::PrintStarted(PrintStartedInfo {
            file_name: "0:/gcodes/benchy.gcode".to_string(),
            file_size: 123_456,
            layer_height: 0.2,
            object_height: 48.0,
            print_time: 3600,
            filament: vec![1200.5, 30.0],
        }));
        round_trip(HostRequest::PrintStopped { reason: PrintStoppedReason::UserCancelled });
        round_trip(HostRequest::MacroCompleted { channel: CodeChannel::Aux, error: true });
        round_trip(HostRequest::GetHeightMap);
        round_trip(HostRequest::LockMovementAndWaitForStandstill { channel: CodeChannel::Http });
        round_trip(HostRequest::Unlock { channel: CodeChannel::Http });
        round_trip(HostRequest::EvaluateExpression { channel: CodeChannel::Sbc, expression: "1+1".to_string() });
    }

    #[test]
    fn test_bad_packet_does_not_stop_frame() {
        let mut data = encode_packet(&FirmwareRequest::ReportState { busy_channels: 1 }, 0);
        // unknown request id with a valid length
        data.extend_from_slice(&[0x77, 0x00, 0x01, 0x00, 0x04, 0x00, 0x00, 0x00, 1, 2, 3, 4]);
        data.extend_from_slice(&encode_packet(&FirmwareRequest::Locked { channel: CodeChannel::Http }, 2));
        let packets = decode_frame::<FirmwareRequest>(&data, 3);
        assert_eq!(packets.len(), 3);
        assert!(packets[0].is_ok());
        assert_eq!(packets[1], Err(DecodeError::UnknownRequest(0x77)));
        assert_eq!(packets[2].as_ref().unwrap().request, FirmwareRequest::Locked { channel: CodeChannel::Http });
    }

    #[test]
    fn test_invalid_channel_is_rejected() {
        let mut data = encode_packet(&FirmwareRequest::AbortFile { channel: CodeChannel::File }, 0);
        data[PACKET_HEADER_SIZE] = 42;
        let packets = decode_frame::<FirmwareRequest>(&data, 1);
        assert_eq!(packets[0], Err(DecodeError::InvalidChannel(42)));
    }

    #[test]
    fn test_writer_applies_backpressure() {
        let mut writer = PacketWriter::new(64);
        let mut queue: VecDeque<HostRequest> = (0..10).map(|_| HostRequest::GetObjectModel { module: 2 }).collect();
        let errors = writer.push_queue(&mut queue);
        assert!(errors.is_empty());
        // 12 bytes per packet
        assert_eq!(queue.len(), 5);
        let (frame, count) = writer.take_frame();
        assert_eq!(count, 5);
        assert_eq!(frame.len(), 60);
        let decoded = decode_frame::<HostRequest>(&frame, count);
        assert!(decoded.iter().all(|p| p.is_ok()));
    }

    #[test]
    fn test_packet_ids_restart_every_frame() {
        let mut writer = PacketWriter::new(BUFFER_SIZE);
        writer.push(&HostRequest::GetState).unwrap();
        writer.push(&HostRequest::GetObjectModel { module: 2 }).unwrap();
        let (frame, count) = writer.take_frame();
        let ids: Vec<u16> = decode_frame::<HostRequest>(&frame, count).iter().map(|p| p.as_ref().unwrap().header.id).collect();
        assert_eq!(ids, vec![0, 1]);

        writer.push(&HostRequest::GetState).unwrap();
        let (frame, count) = writer.take_frame();
        let decoded = decode_frame::<HostRequest>(&frame, count);
        assert_eq!(decoded[0].as_ref().unwrap().header.id, 0);
    }

    #[test]
    fn test_resend_only_reaches_back_one_frame() {
        let mut writer = PacketWriter::new(BUFFER_SIZE);
        writer.push(&HostRequest::GetState).unwrap();
        writer.push(&HostRequest::Unlock { channel: CodeChannel::Usb }).unwrap();
        let _ = writer.take_frame();
        writer.push(&HostRequest::GetState).unwrap();
        let _ = writer.take_frame();
        // packet 1 belonged to the frame before last
        assert!(!writer.resend(1));
        assert!(writer.resend(0));
    }

    #[test]
    fn test_resend_uses_previous_frame() {
        let mut writer = PacketWriter::new(BUFFER_SIZE);
        writer.push(&HostRequest::GetState).unwrap();
        writer.push(&HostRequest::GetObjectModel { module: 2 }).unwrap();
        let _ = writer.take_frame();
        assert!(writer.resend(1));
        assert!(!writer.resend(7));
        let (frame, count) = writer.take_frame();
        let decoded = decode_frame::<HostRequest>(&frame, count);
        let packet = decoded[0].as_ref().unwrap();
        assert_eq!(packet.header.id, 1);
        assert_eq!(packet.request, HostRequest::GetObjectModel { module: 2 });
    }
}

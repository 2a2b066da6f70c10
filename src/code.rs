//! Codes, channels and code results.
//!
//! A [`Code`] is the unit that travels through the pipeline: it is created by a
//! file or a client connection, offered to interceptors, forwarded to the
//! firmware and finally completed with a [`CodeResult`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Number of code channels known to the firmware.
pub const CHANNEL_COUNT: usize = 12;

/// Logical origin/destination of a code. The discriminant is the bit index
/// used in firmware message flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CodeChannel {
    #[serde(rename = "HTTP")]
    Http = 0,
    Telnet = 1,
    File = 2,
    #[serde(rename = "USB")]
    Usb = 3,
    Aux = 4,
    Trigger = 5,
    Queue = 6,
    #[serde(rename = "LCD")]
    Lcd = 7,
    #[serde(rename = "SBC")]
    Sbc = 8,
    Daemon = 9,
    Aux2 = 10,
    AutoPause = 11,
}

impl CodeChannel {
    pub const ALL: [CodeChannel; CHANNEL_COUNT] = [
        CodeChannel::Http,
        CodeChannel::Telnet,
        CodeChannel::File,
        CodeChannel::Usb,
        CodeChannel::Aux,
        CodeChannel::Trigger,
        CodeChannel::Queue,
        CodeChannel::Lcd,
        CodeChannel::Sbc,
        CodeChannel::Daemon,
        CodeChannel::Aux2,
        CodeChannel::AutoPause,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    /// Destination bit of this channel in firmware message flags.
    pub fn flag(self) -> u32 {
        1 << self.index()
    }

    /// Key of this channel below `channels` in the object model.
    pub fn model_key(self) -> &'static str {
        match self {
            CodeChannel::Http => "http",
            CodeChannel::Telnet => "telnet",
            CodeChannel::File => "file",
            CodeChannel::Usb => "usb",
            CodeChannel::Aux => "aux",
            CodeChannel::Trigger => "trigger",
            CodeChannel::Queue => "queue",
            CodeChannel::Lcd => "lcd",
            CodeChannel::Sbc => "sbc",
            CodeChannel::Daemon => "daemon",
            CodeChannel::Aux2 => "aux2",
            CodeChannel::AutoPause => "autoPause",
        }
    }
}

impl Default for CodeChannel {
    fn default() -> Self {
        CodeChannel::Sbc
    }
}

impl fmt::Display for CodeChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeType {
    #[serde(rename = "G")]
    GCode,
    #[serde(rename = "M")]
    MCode,
    #[serde(rename = "T")]
    TCode,
    #[serde(rename = "C")]
    Comment,
    #[serde(rename = "K")]
    Keyword,
}

impl CodeType {
    pub fn letter(self) -> char {
        match self {
            CodeType::GCode => 'G',
            CodeType::MCode => 'M',
            CodeType::TCode => 'T',
            CodeType::Comment => ';',
            CodeType::Keyword => 'K',
        }
    }
}

/// Typed parameter value. The variant order matches the firmware data type ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "value")]
pub enum ParameterValue {
    Int(i32),
    UInt(u32),
    Float(f32),
    IntArray(Vec<i32>),
    UIntArray(Vec<u32>),
    FloatArray(Vec<f32>),
    String(String),
    Expression(String),
    Bool(bool),
}

impl ParameterValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParameterValue::String(s) | ParameterValue::Expression(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParameterValue::Int(v) => Some(*v as i64),
            ParameterValue::UInt(v) => Some(*v as i64),
            ParameterValue::Float(v) => Some(*v as i64),
            ParameterValue::Bool(v) => Some(*v as i64),
            _ => None,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join<T: fmt::Display>(f: &mut fmt::Formatter<'_>, values: &[T]) -> fmt::Result {
            for (i, v) in values.iter().enumerate() {
                if i > 0 {
                    f.write_str(":")?;
                }
                write!(f, "{}", v)?;
            }
            Ok(())
        }
        match self {
            ParameterValue::Int(v) => write!(f, "{}", v),
            ParameterValue::UInt(v) => write!(f, "{}", v),
            ParameterValue::Float(v) => write!(f, "{}", v),
            ParameterValue::IntArray(v) => join(f, v),
            ParameterValue::UIntArray(v) => join(f, v),
            ParameterValue::FloatArray(v) => join(f, v),
            ParameterValue::String(s) if s.is_empty() => Ok(()),
            ParameterValue::String(s) => write!(f, "\"{}\"", s.replace('"', "\"\"")),
            ParameterValue::Expression(s) => f.write_str(s),
            ParameterValue::Bool(v) => write!(f, "{}", *v as u8),
        }
    }
}

/// Letter of a quoted string written without a parameter letter, as in `M32 "file.g"`.
pub const UNNAMED_PARAMETER: char = '@';

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeParameter {
    pub letter: char,
    pub value: ParameterValue,
}

impl CodeParameter {
    pub fn new(letter: char, value: ParameterValue) -> Self {
        Self { letter, value }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CodeFlags {
    /// Pre-stage interception has been passed.
    pub is_pre_processed: bool,
    /// Post-stage interception has been passed.
    pub is_post_processed: bool,
    /// Code was read from a macro file and runs inside its parent's turn.
    pub is_from_macro: bool,
    /// Only interceptors registered for priority codes see it.
    pub is_prioritized: bool,
    /// Sent by an interceptor while it holds another code of the channel.
    pub is_inserted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Code {
    #[serde(default)]
    pub channel: CodeChannel,
    #[serde(rename = "type")]
    pub code_type: CodeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub major: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minor: Option<i8>,
    #[serde(default)]
    pub parameters: Vec<CodeParameter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Full statement text of a keyword code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
    /// Connection that submitted the code, 0 for internal sources.
    #[serde(default)]
    pub source_connection: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_position: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u64>,
    #[serde(default)]
    pub flags: CodeFlags,
}

impl Code {
    pub fn new(channel: CodeChannel, code_type: CodeType, major: Option<i32>) -> Self {
        Self {
            channel,
            code_type,
            major,
            minor: None,
            parameters: Vec::new(),
            comment: None,
            keyword: None,
            source_connection: 0,
            file_position: None,
            line_number: None,
            flags: CodeFlags::default(),
        }
    }

    pub fn comment(channel: CodeChannel, text: impl Into<String>) -> Self {
        let mut code = Self::new(channel, CodeType::Comment, None);
        code.comment = Some(text.into());
        code
    }

    pub fn with_parameter(mut self, letter: char, value: ParameterValue) -> Self {
        self.parameters.push(CodeParameter::new(letter, value));
        self
    }

    pub fn parameter(&self, letter: char) -> Option<&ParameterValue> {
        let letter = letter.to_ascii_uppercase();
        self.parameters.iter().find(|p| p.letter == letter).map(|p| &p.value)
    }

    pub fn is(&self, code_type: CodeType, major: i32) -> bool {
        self.code_type == code_type && self.major == Some(major)
    }

    /// Parse a single line of code text.
    pub fn parse(line: &str, channel: CodeChannel) -> Result<Code, CodeParseError> {
        parse_line(line, channel)
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code_type {
            CodeType::Comment => return write!(f, ";{}", self.comment.as_deref().unwrap_or("")),
            CodeType::Keyword => return f.write_str(self.keyword.as_deref().unwrap_or("")),
            _ => {}
        }
        write!(f, "{}", self.code_type.letter())?;
        if let Some(major) = self.major {
            write!(f, "{}", major)?;
            if let Some(minor) = self.minor {
                write!(f, ".{}", minor)?;
            }
        }
        for p in &self.parameters {
            if p.letter == UNNAMED_PARAMETER {
                write!(f, " {}", p.value)?;
            } else {
                write!(f, " {}{}", p.letter, p.value)?;
            }
        }
        if let Some(comment) = &self.comment {
            write!(f, " ;{}", comment)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodeParseError {
    #[error("Empty line")]
    Empty,
    #[error("Invalid code '{0}'")]
    InvalidCode(String),
    #[error("Invalid value '{value}' for parameter {letter}")]
    InvalidParameter { letter: char, value: String },
    #[error("Unterminated string or expression")]
    Unterminated,
}

const KEYWORDS: &[&str] = &[
    "if", "elif", "else", "while", "break", "continue", "abort", "var", "global", "set", "echo",
];

fn parse_line(line: &str, channel: CodeChannel) -> Result<Code, CodeParseError> {
    let mut text = line.trim();
    let mut line_number = None;

    if let Some(rest) = text.strip_prefix(['N', 'n']) {
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        if !digits.is_empty() {
            line_number = digits.parse().ok();
            text = rest[digits.len()..].trim_start();
            // *NN checksum trails a numbered line
            if let Some(star) = text.rfind('*') {
                text = text[..star].trim_end();
            }
        }
    }

    let (body, comment) = split_comment(text)?;
    let body = body.trim();
    if body.is_empty() {
        return match comment {
            Some(comment) => {
                let mut code = Code::comment(channel, comment);
                code.line_number = line_number;
                Ok(code)
            }
            None => Err(CodeParseError::Empty),
        };
    }

    let first_word = body.split_whitespace().next().unwrap_or_default();
    if KEYWORDS.contains(&first_word) {
        let mut code = Code::new(channel, CodeType::Keyword, None);
        code.keyword = Some(body.to_string());
        code.line_number = line_number;
        return Ok(code);
    }

    let mut chars = body.chars();
    let code_type = match chars.next().map(|c| c.to_ascii_uppercase()) {
        Some('G') => CodeType::GCode,
        Some('M') => CodeType::MCode,
        Some('T') => CodeType::TCode,
        _ => return Err(CodeParseError::InvalidCode(body.to_string())),
    };
    let rest = chars.as_str();
    let number_len = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'))
        .unwrap_or(rest.len());
    let number = &rest[..number_len];

    let mut code = Code::new(channel, code_type, None);
    code.line_number = line_number;
    code.comment = comment;
    if !number.is_empty() {
        let (major, minor) = match number.split_once('.') {
            Some((major, minor)) => (major, Some(minor)),
            None => (number, None),
        };
        code.major = Some(
            major
                .parse()
                .map_err(|_| CodeParseError::InvalidCode(body.to_string()))?,
        );
        if let Some(minor) = minor {
            code.minor = Some(
                minor
                    .parse()
                    .map_err(|_| CodeParseError::InvalidCode(body.to_string()))?,
            );
        }
    } else if code_type != CodeType::TCode {
        return Err(CodeParseError::InvalidCode(body.to_string()));
    }

    code.parameters = parse_parameters(&rest[number_len..])?;
    Ok(code)
}

fn split_comment(text: &str) -> Result<(&str, Option<String>), CodeParseError> {
    let mut in_string = false;
    for (i, c) in text.char_indices() {
        match c {
            '"' => in_string = !in_string,
            ';' if !in_string => return Ok((&text[..i], Some(text[i + 1..].trim().to_string()))),
            _ => {}
        }
    }
    if in_string {
        return Err(CodeParseError::Unterminated);
    }
    Ok((text, None))
}

fn parse_parameters(text: &str) -> Result<Vec<CodeParameter>, CodeParseError> {
    let mut parameters = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        let letter = if c == '"' {
            UNNAMED_PARAMETER
        } else if c.is_ascii_alphabetic() {
            i += 1;
            c.to_ascii_uppercase()
        } else {
            return Err(CodeParseError::InvalidCode(text.trim().to_string()));
        };

        let mut raw = String::new();
        match chars.get(i) {
            Some('"') => {
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(CodeParseError::Unterminated),
                        Some('"') if chars.get(i + 1) == Some(&'"') => {
                            raw.push('"');
                            i += 2;
                        }
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            raw.push(ch);
                            i += 1;
                        }
                    }
                }
                parameters.push(CodeParameter::new(letter, ParameterValue::String(raw)));
                continue;
            }
            Some('{') => {
                let mut depth = 0;
                loop {
                    let Some(&ch) = chars.get(i) else {
                        return Err(CodeParseError::Unterminated);
                    };
                    raw.push(ch);
                    i += 1;
                    match ch {
                        '{' => depth += 1,
                        '}' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                }
                parameters.push(CodeParameter::new(letter, ParameterValue::Expression(raw)));
                continue;
            }
            _ => {}
        }

        while let Some(&ch) = chars.get(i) {
            if ch.is_whitespace() || (ch.is_ascii_alphabetic() && !raw.is_empty()) {
                break;
            }
            raw.push(ch);
            i += 1;
        }
        parameters.push(CodeParameter::new(letter, parse_value(letter, &raw)?));
    }
    Ok(parameters)
}

fn parse_value(letter: char, raw: &str) -> Result<ParameterValue, CodeParseError> {
    if raw.is_empty() {
        return Ok(ParameterValue::String(String::new()));
    }
    let invalid = || CodeParseError::InvalidParameter { letter, value: raw.to_string() };
    if raw.contains(':') {
        let parts: Vec<&str> = raw.split(':').collect();
        if let Ok(ints) = parts.iter().map(|p| p.parse::<i32>()).collect::<Result<Vec<_>, _>>() {
            return Ok(ParameterValue::IntArray(ints));
        }
        if let Ok(uints) = parts.iter().map(|p| p.parse::<u32>()).collect::<Result<Vec<_>, _>>() {
            return Ok(ParameterValue::UIntArray(uints));
        }
        return parts
            .iter()
            .map(|p| p.parse::<f32>())
            .collect::<Result<Vec<_>, _>>()
            .map(ParameterValue::FloatArray)
            .map_err(|_| invalid());
    }
    if let Ok(v) = raw.parse::<i32>() {
        return Ok(ParameterValue::Int(v));
    }
    if let Ok(v) = raw.parse::<u32>() {
        return Ok(ParameterValue::UInt(v));
    }
    if let Ok(v) = raw.parse::<f32>() {
        return Ok(ParameterValue::Float(v));
    }
    Ok(ParameterValue::String(raw.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Success,
    Warning,
    Error,
}

/// A single message produced while a code executes, or logged by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub content: String,
    pub time: DateTime<Utc>,
}

impl Message {
    pub fn new(message_type: MessageType, content: impl Into<String>) -> Self {
        Self {
            message_type,
            content: content.into(),
            time: Utc::now(),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message_type {
            MessageType::Success => f.write_str(&self.content),
            MessageType::Warning => write!(f, "Warning: {}", self.content),
            MessageType::Error => write!(f, "Error: {}", self.content),
        }
    }
}

/// Ordered messages of an executed code.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodeResult(Vec<Message>);

impl CodeResult {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn from_message(message_type: MessageType, content: impl Into<String>) -> Self {
        let mut result = Self::new();
        result.push(message_type, content);
        result
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::from_message(MessageType::Error, content)
    }

    pub fn push(&mut self, message_type: MessageType, content: impl Into<String>) {
        self.0.push(Message::new(message_type, content));
    }

    pub fn is_successful(&self) -> bool {
        self.0.iter().all(|m| m.message_type != MessageType::Error)
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|m| m.content.is_empty())
    }

    pub fn messages(&self) -> &[Message] {
        &self.0
    }
}

impl fmt::Display for CodeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for message in self.0.iter().filter(|m| !m.content.is_empty()) {
            if !first {
                f.write_str("\n")?;
            }
            write!(f, "{}", message)?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_move() {
        let code = Code::parse("G1 X10 Y-2.5 F1500", CodeChannel::File).unwrap();
        assert_eq!(code.code_type, CodeType::GCode);
        assert_eq!(code.major, Some(1));
        assert_eq!(code.parameter('x'), Some(&ParameterValue::Int(10)));
        assert_eq!(code.parameter('Y'), Some(&ParameterValue::Float(-2.5)));
        assert_eq!(code.parameter('F'), Some(&ParameterValue::Int(1500)));
    }

    #[test]
    fn test_parse_unspaced_and_minor() {
        let code = Code::parse("G29.1X1Y2", CodeChannel::Http).unwrap();
        assert_eq!(code.major, Some(29));
        assert_eq!(code.minor, Some(1));
        assert_eq!(code.parameters.len(), 2);
    }

    #[test]
    fn test_parse_string_expression_array() {
        let code = Code::parse("M98 P\"homeall.g\" S{1+2} E1:2:3 ; home", CodeChannel::Http).unwrap();
        assert_eq!(code.parameter('P').and_then(|v| v.as_str()), Some("homeall.g"));
        assert_eq!(code.parameter('S'), Some(&ParameterValue::Expression("{1+2}".to_string())));
        assert_eq!(code.parameter('E'), Some(&ParameterValue::IntArray(vec![1, 2, 3])));
        assert_eq!(code.comment.as_deref(), Some("home"));
    }

    #[test]
    fn test_parse_unnamed_string() {
        let code = Code::parse("M32 \"0:/gcodes/part.g\"", CodeChannel::Http).unwrap();
        assert_eq!(code.parameters.len(), 1);
        assert_eq!(code.parameter(UNNAMED_PARAMETER).and_then(|v| v.as_str()), Some("0:/gcodes/part.g"));
        assert_eq!(code.to_string(), "M32 \"0:/gcodes/part.g\"");

        let code = Code::parse("M98 \"macro.g\" S1", CodeChannel::Http).unwrap();
        assert_eq!(code.parameter(UNNAMED_PARAMETER).and_then(|v| v.as_str()), Some("macro.g"));
        assert_eq!(code.parameter('S'), Some(&ParameterValue::Int(1)));
    }

    #[test]
    fn test_parse_comment_keyword_and_errors() {
        let comment = Code::parse("; just a note", CodeChannel::File).unwrap();
        assert_eq!(comment.code_type, CodeType::Comment);
        let keyword = Code::parse("echo \"hi\"", CodeChannel::File).unwrap();
        assert_eq!(keyword.code_type, CodeType::Keyword);
        assert_eq!(Code::parse("   ", CodeChannel::File), Err(CodeParseError::Empty));
        assert!(matches!(Code::parse("X10", CodeChannel::File), Err(CodeParseError::InvalidCode(_))));
        assert_eq!(Code::parse("M117 \"open", CodeChannel::File), Err(CodeParseError::Unterminated));
    }

    #[test]
    fn test_line_number_and_checksum() {
        let code = Code::parse("N12 G28 X*87", CodeChannel::Usb).unwrap();
        assert_eq!(code.line_number, Some(12));
        assert_eq!(code.major, Some(28));
        assert_eq!(code.parameter('X'), Some(&ParameterValue::String(String::new())));
    }

    #[test]
    fn test_display_reconstructs_text() {
        let code = Code::parse("M104 S200 T0", CodeChannel::Http).unwrap();
        assert_eq!(code.to_string(), "M104 S200 T0");
        let t = Code::parse("T1", CodeChannel::Http).unwrap();
        assert_eq!(t.to_string(), "T1");
    }

    #[test]
    fn test_code_result_rendering() {
        let mut result = CodeResult::new();
        assert!(result.is_successful());
        result.push(MessageType::Success, "ok");
        result.push(MessageType::Warning, "hot");
        assert!(result.is_successful());
        result.push(MessageType::Error, "failed");
        assert!(!result.is_successful());
        assert_eq!(result.to_string(), "ok\nWarning: hot\nError: failed");
    }

    #[test]
    fn test_channel_flags() {
        assert_eq!(CodeChannel::Http.flag(), 0x01);
        assert_eq!(CodeChannel::File.flag(), 0x04);
        assert_eq!(CodeChannel::AutoPause.flag(), 0x800);
        assert_eq!(CodeChannel::from_index(8), Some(CodeChannel::Sbc));
        assert_eq!(CodeChannel::from_index(12), None);
    }
}

// src/transport/binary_code.rs - Binary representation of codes sent to the firmware
use super::packets::{DecodeError, EncodeError, MAX_CODE_SIZE, PayloadReader, PayloadWriter};
use crate::code::{Code, CodeChannel, CodeParameter, CodeType, ParameterValue};

const HAS_MAJOR: u8 = 0x01;
const HAS_MINOR: u8 = 0x02;
const HAS_FILE_POSITION: u8 = 0x04;
const HAS_LINE_NUMBER: u8 = 0x08;
const IS_PRIORITIZED: u8 = 0x10;
const IS_FROM_MACRO: u8 = 0x20;

const TYPE_INT: u8 = 0;
const TYPE_UINT: u8 = 1;
const TYPE_FLOAT: u8 = 2;
const TYPE_INT_ARRAY: u8 = 3;
const TYPE_UINT_ARRAY: u8 = 4;
const TYPE_FLOAT_ARRAY: u8 = 5;
const TYPE_STRING: u8 = 6;
const TYPE_EXPRESSION: u8 = 7;
const TYPE_BOOL: u8 = 10;

/// Letter used for keyword statements.
const KEYWORD_LETTER: u8 = b'K';

/// Encode a code for the firmware. Comments, standalone or trailing, never
/// reach the firmware.
pub fn encode(code: &Code) -> Result<Vec<u8>, EncodeError> {
    let letter = match code.code_type {
        CodeType::GCode => b'G',
        CodeType::MCode => b'M',
        CodeType::TCode => b'T',
        CodeType::Keyword => KEYWORD_LETTER,
        CodeType::Comment => return Err(EncodeError::NotExecutable),
    };

    let mut parameters: Vec<CodeParameter> = code.parameters.clone();
    if code.code_type == CodeType::Keyword {
        parameters = vec![CodeParameter::new('K', ParameterValue::String(code.keyword.clone().unwrap_or_default()))];
    }

    let mut flags = 0u8;
    if code.major.is_some() {
        flags |= HAS_MAJOR;
    }
    if code.minor.is_some() {
        flags |= HAS_MINOR;
    }
    if code.file_position.is_some() {
        flags |= HAS_FILE_POSITION;
    }
    if code.line_number.is_some() {
        flags |= HAS_LINE_NUMBER;
    }
    if code.flags.is_prioritized {
        flags |= IS_PRIORITIZED;
    }
    if code.flags.is_from_macro {
        flags |= IS_FROM_MACRO;
    }

    let mut w = PayloadWriter::new();
    w.u8(code.channel.index() as u8);
    w.u8(flags);
    w.u8(u8::try_from(parameters.len()).map_err(|_| EncodeError::OutOfRange("parameter count"))?);
    w.u8(letter);
    w.i32(code.major.unwrap_or(-1));
    w.i32(code.minor.map(i32::from).unwrap_or(-1));
    w.u32(u32::try_from(code.file_position.unwrap_or(0)).map_err(|_| EncodeError::OutOfRange("file position"))?);
    w.u32(u32::try_from(code.line_number.unwrap_or(0)).map_err(|_| EncodeError::OutOfRange("line number"))?);

    let mut extra = PayloadWriter::new();
    for p in &parameters {
        w.u8(u8::try_from(p.letter).map_err(|_| EncodeError::OutOfRange("parameter letter"))?);
        match &p.value {
            ParameterValue::Int(v) => {
                w.u8(TYPE_INT);
                w.u16(0);
                w.i32(*v);
            }
            ParameterValue::UInt(v) => {
                w.u8(TYPE_UINT);
                w.u16(0);
                w.u32(*v);
            }
            ParameterValue::Float(v) => {
                w.u8(TYPE_FLOAT);
                w.u16(0);
                w.f32(*v);
            }
            ParameterValue::Bool(v) => {
                w.u8(TYPE_BOOL);
                w.u16(0);
                w.u32(*v as u32);
            }
            ParameterValue::IntArray(values) => {
                w.u8(TYPE_INT_ARRAY);
                w.u16(0);
                w.u32(length(values.len())?);
                values.iter().for_each(|v| extra.i32(*v));
            }
            ParameterValue::UIntArray(values) => {
                w.u8(TYPE_UINT_ARRAY);
                w.u16(0);
                w.u32(length(values.len())?);
                values.iter().for_each(|v| extra.u32(*v));
            }
            ParameterValue::FloatArray(values) => {
                w.u8(TYPE_FLOAT_ARRAY);
                w.u16(0);
                w.u32(length(values.len())?);
                values.iter().for_each(|v| extra.f32(*v));
            }
            ParameterValue::String(s) | ParameterValue::Expression(s) => {
                let kind = if matches!(p.value, ParameterValue::String(_)) { TYPE_STRING } else { TYPE_EXPRESSION };
                w.u8(kind);
                w.u16(0);
                w.u32(length(s.len())?);
                extra.bytes(s.as_bytes());
                extra.align();
            }
        }
    }
    w.bytes(&extra.into_inner());

    let data = w.into_inner();
    if data.len() > MAX_CODE_SIZE {
        return Err(EncodeError::CodeTooLong(data.len()));
    }
    Ok(data)
}

fn length(len: usize) -> Result<u32, EncodeError> {
    u32::try_from(len).map_err(|_| EncodeError::OutOfRange("parameter length"))
}

/// Decode a binary code, the inverse of [`encode`].
pub fn decode(data: &[u8]) -> Result<Code, DecodeError> {
    let mut r = PayloadReader::new(data);
    let channel_index = r.u8()?;
    let channel = CodeChannel::from_index(channel_index).ok_or(DecodeError::InvalidChannel(channel_index))?;
    let flags = r.u8()?;
    let count = r.u8()? as usize;
    let letter = r.u8()?;
    let major = r.i32()?;
    let minor = r.i32()?;
    let file_position = r.u32()?;
    let line_number = r.u32()?;

    let code_type = match letter {
        b'G' => CodeType::GCode,
        b'M' => CodeType::MCode,
        b'T' => CodeType::TCode,
        KEYWORD_LETTER => CodeType::Keyword,
        _ => return Err(DecodeError::InvalidValue("code letter")),
    };

    let mut headers = Vec::with_capacity(count);
    for _ in 0..count {
        let letter = r.u8()? as char;
        let kind = r.u8()?;
        r.u16()?;
        let raw = r.u32()?;
        headers.push((letter, kind, raw));
    }

    let mut code = Code::new(channel, code_type, (flags & HAS_MAJOR != 0).then_some(major));
    code.minor = if flags & HAS_MINOR != 0 {
        Some(i8::try_from(minor).map_err(|_| DecodeError::InvalidValue("minor number"))?)
    } else {
        None
    };
    code.file_position = (flags & HAS_FILE_POSITION != 0).then_some(file_position as u64);
    code.line_number = (flags & HAS_LINE_NUMBER != 0).then_some(line_number as u64);
    code.flags.is_prioritized = flags & IS_PRIORITIZED != 0;
    code.flags.is_from_macro = flags & IS_FROM_MACRO != 0;

    for (letter, kind, raw) in headers {
        let n = raw as usize;
        let value = match kind {
            TYPE_INT => ParameterValue::Int(raw as i32),
            TYPE_UINT => ParameterValue::UInt(raw),
            TYPE_FLOAT => ParameterValue::Float(f32::from_bits(raw)),
            TYPE_BOOL => ParameterValue::Bool(raw != 0),
            TYPE_INT_ARRAY => ParameterValue::IntArray((0..n).map(|_| r.i32()).collect::<Result<_, _>>()?),
            TYPE_UINT_ARRAY => ParameterValue::UIntArray((0..n).map(|_| r.u32()).collect::<Result<_, _>>()?),
            TYPE_FLOAT_ARRAY => ParameterValue::FloatArray((0..n).map(|_| r.f32()).collect::<Result<_, _>>()?),
            TYPE_STRING | TYPE_EXPRESSION => {
                let s = r.string(n)?;
                r.align();
                if kind == TYPE_STRING { ParameterValue::String(s) } else { ParameterValue::Expression(s) }
            }
            _ => return Err(DecodeError::InvalidValue("parameter type")),
        };

        match (letter, value) {
            ('K', ParameterValue::String(s)) if code_type == CodeType::Keyword => code.keyword = Some(s),
            (letter, value) => code.parameters.push(CodeParameter::new(letter, value)),
        }
    }
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::UNNAMED_PARAMETER;

    #[test]
    fn test_code_survives_encoding() {
        let mut code = Code::parse("G1 X10 Y-2.5 E1:2 S\"abc\" R{var.x} ; move", CodeChannel::File).unwrap();
        code.file_position = Some(4096);
        code.flags.is_from_macro = true;
        let data = encode(&code).unwrap();
        assert_eq!(data.len() % 4, 0);
        let decoded = decode(&data).unwrap();
        assert_eq!(decoded.channel, CodeChannel::File);
        assert_eq!(decoded.major, Some(1));
        assert_eq!(decoded.parameters, code.parameters);
        assert_eq!(decoded.comment, None);
        assert_eq!(decoded.file_position, Some(4096));
        assert!(decoded.flags.is_from_macro);
    }

    #[test]
    fn test_unnamed_string_keeps_its_letter() {
        let code = Code::parse("M32 \"0:/gcodes/part.g\"", CodeChannel::Http).unwrap();
        let decoded = decode(&encode(&code).unwrap()).unwrap();
        assert_eq!(decoded.parameters, code.parameters);
        assert_eq!(decoded.parameter(UNNAMED_PARAMETER).and_then(|v| v.as_str()), Some("0:/gcodes/part.g"));
    }

    #[test]
    fn test_values_beyond_the_wire_range_are_rejected() {
        let mut code = Code::parse("G1 X1", CodeChannel::File).unwrap();
        code.file_position = Some(u64::from(u32::MAX) + 1);
        assert_eq!(encode(&code), Err(EncodeError::OutOfRange("file position")));

        let mut code = Code::new(CodeChannel::Http, CodeType::GCode, Some(1));
        code.parameters = (0..300).map(|_| CodeParameter::new('X', ParameterValue::Int(1))).collect();
        assert_eq!(encode(&code), Err(EncodeError::OutOfRange("parameter count")));
    }

    #[test]
    fn test_keyword_and_tool_codes() {
        let keyword = Code::parse("echo \"hello\"", CodeChannel::Http).unwrap();
        let decoded = decode(&encode(&keyword).unwrap()).unwrap();
        assert_eq!(decoded.code_type, CodeType::Keyword);
        assert_eq!(decoded.keyword.as_deref(), Some("echo \"hello\""));

        let tool = Code::parse("T", CodeChannel::Http).unwrap();
        let decoded = decode(&encode(&tool).unwrap()).unwrap();
        assert_eq!(decoded.major, None);
    }

    #[test]
    fn test_comment_and_oversized_rejected() {
        let comment = Code::comment(CodeChannel::File, "note");
        assert_eq!(encode(&comment), Err(EncodeError::NotExecutable));

        let long = Code::new(CodeChannel::Http, CodeType::MCode, Some(117))
            .with_parameter('S', ParameterValue::String("x".repeat(300)));
        assert!(matches!(encode(&long), Err(EncodeError::CodeTooLong(_))));
    }
}

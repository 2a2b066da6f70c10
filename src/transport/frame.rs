//! Transfer frames: header, checksums and the retry/reset exchange cycle.
//!
//! Every cycle both sides exchange a fixed-size header, a response code, the
//! frame payload and a second response code. A side that cannot validate what
//! it received answers with a non-success response and both sides repeat that
//! phase. When the retries are used up the caller must reset the protocol.

use super::link::Link;
use thiserror::Error;

pub const FORMAT_CODE: u8 = 0x5F;
/// Sent by a firmware that is starting up or has just been reset.
pub const INVALID_FORMAT_CODE: u8 = 0xC9;
pub const PROTOCOL_VERSION: u16 = 4;
pub const BUFFER_SIZE: usize = 8192;
pub const HEADER_SIZE: usize = 12;
pub const RESPONSE_SIZE: usize = 4;

/// CRC-16-CCITT calculation (XMODEM variant)
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0u16;
    for &b in data {
        crc ^= (b as u16) << 8;
        for _ in 0..8 {
            if (crc & 0x8000) != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Round a length up to the next multiple of four.
pub fn pad4(len: usize) -> usize {
    (len + 3) & !3
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferResponse {
    Success = 1,
    BadFormat = 2,
    BadProtocolVersion = 3,
    BadDataLength = 4,
    BadHeaderChecksum = 5,
    BadDataChecksum = 6,
    BadResponse = 0xFEFE_FEFE,
}

impl TransferResponse {
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => TransferResponse::Success,
            2 => TransferResponse::BadFormat,
            3 => TransferResponse::BadProtocolVersion,
            4 => TransferResponse::BadDataLength,
            5 => TransferResponse::BadHeaderChecksum,
            6 => TransferResponse::BadDataChecksum,
            _ => TransferResponse::BadResponse,
        }
    }

    pub fn to_bytes(self) -> [u8; RESPONSE_SIZE] {
        (self as u32).to_le_bytes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferHeader {
    pub format_code: u8,
    pub packet_count: u8,
    pub protocol_version: u16,
    pub sequence_number: u16,
    pub data_length: u16,
    pub data_checksum: u16,
    pub header_checksum: u16,
}

impl TransferHeader {
    pub fn new(sequence_number: u16, packet_count: u8, data: &[u8]) -> Self {
        let mut header = Self {
            format_code: FORMAT_CODE,
            packet_count,
            protocol_version: PROTOCOL_VERSION,
            sequence_number,
            data_length: data.len() as u16,
            data_checksum: crc16(data),
            header_checksum: 0,
        };
        let bytes = header.to_bytes();
        header.header_checksum = crc16(&bytes[..HEADER_SIZE - 2]);
        header
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0] = self.format_code;
        out[1] = self.packet_count;
        out[2..4].copy_from_slice(&self.protocol_version.to_le_bytes());
        out[4..6].copy_from_slice(&self.sequence_number.to_le_bytes());
        out[6..8].copy_from_slice(&self.data_length.to_le_bytes());
        out[8..10].copy_from_slice(&self.data_checksum.to_le_bytes());
        out[10..12].copy_from_slice(&self.header_checksum.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        let u16_at = |i: usize| u16::from_le_bytes([bytes[i], bytes[i + 1]]);
        Self {
            format_code: bytes[0],
            packet_count: bytes[1],
            protocol_version: u16_at(2),
            sequence_number: u16_at(4),
            data_length: u16_at(6),
            data_checksum: u16_at(8),
            header_checksum: u16_at(10),
        }
    }

    /// Check a received header and produce the response to send back.
    pub fn validate(bytes: &[u8; HEADER_SIZE]) -> Result<Self, TransferResponse> {
        let header = Self::from_bytes(bytes);
        if header.format_code != FORMAT_CODE {
            return Err(TransferResponse::BadFormat);
        }
        if crc16(&bytes[..HEADER_SIZE - 2]) != header.header_checksum {
            return Err(TransferResponse::BadHeaderChecksum);
        }
        if header.protocol_version != PROTOCOL_VERSION {
            return Err(TransferResponse::BadProtocolVersion);
        }
        if header.data_length as usize > BUFFER_SIZE {
            return Err(TransferResponse::BadDataLength);
        }
        Ok(header)
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Link error: {0}")]
    Link(#[from] std::io::Error),
    #[error("Frame rejected after retries: {0:?}")]
    Rejected(TransferResponse),
    #[error("Payload of {0} bytes exceeds the transfer buffer")]
    PayloadTooLarge(usize),
    #[error("Firmware is not ready")]
    FirmwareNotReady,
}

/// A validated inbound frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub sequence_number: u16,
    pub packet_count: u8,
    pub data: Vec<u8>,
    /// Set when the peer repeated its previous frame; `data` is empty then.
    pub duplicate: bool,
}

/// Owns the link and the fixed-size transfer buffers.
pub struct Framer<L: Link> {
    link: L,
    max_retries: u32,
    tx_sequence: u16,
    last_rx_sequence: Option<u16>,
    tx_data: Vec<u8>,
    tx_packet_count: u8,
}

impl<L: Link> Framer<L> {
    pub fn new(link: L, max_retries: u32) -> Self {
        Self {
            link,
            max_retries,
            tx_sequence: 0,
            last_rx_sequence: None,
            tx_data: Vec::with_capacity(BUFFER_SIZE),
            tx_packet_count: 0,
        }
    }

    /// Stage the payload for the next exchange.
    pub fn send_frame(&mut self, payload: &[u8], packet_count: u8) -> Result<(), FrameError> {
        if payload.len() > BUFFER_SIZE {
            return Err(FrameError::PayloadTooLarge(payload.len()));
        }
        self.tx_data.clear();
        self.tx_data.extend_from_slice(payload);
        self.tx_packet_count = packet_count;
        Ok(())
    }

    /// Run one full exchange and return what the peer sent.
    pub async fn receive_frame(&mut self) -> Result<Frame, FrameError> {
        let header = self.exchange_header().await?;
        let data = self.exchange_data(&header).await?;

        self.tx_sequence = self.tx_sequence.wrapping_add(1);
        self.tx_data.clear();
        self.tx_packet_count = 0;

        if self.last_rx_sequence == Some(header.sequence_number) {
            tracing::debug!("Duplicate frame #{} ignored", header.sequence_number);
            return Ok(Frame {
                sequence_number: header.sequence_number,
                duplicate: true,
                ..Frame::default()
            });
        }
        self.last_rx_sequence = Some(header.sequence_number);
        Ok(Frame {
            sequence_number: header.sequence_number,
            packet_count: header.packet_count,
            data,
            duplicate: false,
        })
    }

    /// Forget sequencing state; both sides start over from zero.
    pub fn reset(&mut self) {
        self.tx_sequence = 0;
        self.last_rx_sequence = None;
        self.tx_data.clear();
        self.tx_packet_count = 0;
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    async fn exchange_header(&mut self) -> Result<TransferHeader, FrameError> {
        let tx = TransferHeader::new(self.tx_sequence, self.tx_packet_count, &self.tx_data).to_bytes();
        let mut attempt = 0;
        loop {
            let mut rx = [0u8; HEADER_SIZE];
            self.link.transfer(&tx, &mut rx).await?;
            let validated = TransferHeader::validate(&rx);
            let ours = match validated {
                Ok(_) => TransferResponse::Success,
                Err(response) => response,
            };
            let theirs = self.exchange_response(ours).await?;
            match validated {
                Ok(header) if theirs == TransferResponse::Success => return Ok(header),
                _ => {}
            }

            if rx[0] == INVALID_FORMAT_CODE {
                return Err(FrameError::FirmwareNotReady);
            }
            attempt += 1;
            let failure = if ours != TransferResponse::Success { ours } else { theirs };
            if attempt > self.max_retries {
                return Err(FrameError::Rejected(failure));
            }
            tracing::warn!("Header exchange failed ({:?}), retry {}/{}", failure, attempt, self.max_retries);
        }
    }

    async fn exchange_data(&mut self, header: &TransferHeader) -> Result<Vec<u8>, FrameError> {
        let rx_len = header.data_length as usize;
        let len = pad4(self.tx_data.len().max(rx_len));
        if len == 0 {
            return Ok(Vec::new());
        }

        let mut tx = self.tx_data.clone();
        tx.resize(len, 0);
        let mut attempt = 0;
        loop {
            let mut rx = vec![0u8; len];
            self.link.transfer(&tx, &mut rx).await?;
            rx.truncate(rx_len);
            let ours = if crc16(&rx) == header.data_checksum {
                TransferResponse::Success
            } else {
                TransferResponse::BadDataChecksum
            };
            let theirs = self.exchange_response(ours).await?;
            if ours == TransferResponse::Success && theirs == TransferResponse::Success {
                return Ok(rx);
            }

            attempt += 1;
            let failure = if ours != TransferResponse::Success { ours } else { theirs };
            if attempt > self.max_retries {
                return Err(FrameError::Rejected(failure));
            }
            tracing::warn!("Data exchange failed ({:?}), retry {}/{}", failure, attempt, self.max_retries);
        }
    }

    async fn exchange_response(&mut self, ours: TransferResponse) -> Result<TransferResponse, FrameError> {
        let mut rx = [0u8; RESPONSE_SIZE];
        self.link.transfer(&ours.to_bytes(), &mut rx).await?;
        Ok(TransferResponse::from_u32(u32::from_le_bytes(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::link::MemoryLink;

    #[test]
    fn test_crc16_xmodem() {
        assert_eq!(crc16(b"123456789"), 0x31C3);
        assert_eq!(crc16(&[]), 0);
    }

    #[test]
    fn test_header_validation() {
        let data = b"abcd";
        let header = TransferHeader::new(7, 1, data);
        let bytes = header.to_bytes();
        assert_eq!(TransferHeader::validate(&bytes), Ok(header));

        let mut corrupted = bytes;
        corrupted[6] ^= 0xFF;
        assert_eq!(TransferHeader::validate(&corrupted), Err(TransferResponse::BadHeaderChecksum));

        let mut wrong_format = bytes;
        wrong_format[0] = INVALID_FORMAT_CODE;
        assert_eq!(TransferHeader::validate(&wrong_format), Err(TransferResponse::BadFormat));

        let mut old = TransferHeader::new(0, 0, &[]);
        old.protocol_version = 3;
        let mut old_bytes = old.to_bytes();
        let crc = crc16(&old_bytes[..HEADER_SIZE - 2]);
        old_bytes[10..12].copy_from_slice(&crc.to_le_bytes());
        assert_eq!(TransferHeader::validate(&old_bytes), Err(TransferResponse::BadProtocolVersion));
    }

    #[tokio::test]
    async fn test_exchange_between_peers() {
        let (a, b) = MemoryLink::pair();
        let mut host = Framer::new(a, 2);
        let mut firmware = Framer::new(b, 2);
        host.send_frame(b"host", 1).unwrap();
        firmware.send_frame(b"firmware", 2).unwrap();

        let (from_firmware, from_host) = tokio::join!(host.receive_frame(), firmware.receive_frame());
        let from_firmware = from_firmware.unwrap();
        let from_host = from_host.unwrap();
        assert_eq!(from_firmware.data, b"firmware");
        assert_eq!(from_firmware.packet_count, 2);
        assert_eq!(from_host.data, b"host");
        assert_eq!(from_host.sequence_number, 0);
    }

    #[tokio::test]
    async fn test_payload_too_large() {
        let (a, _b) = MemoryLink::pair();
        let mut host = Framer::new(a, 2);
        let payload = vec![0u8; BUFFER_SIZE + 1];
        assert!(matches!(host.send_frame(&payload, 1), Err(FrameError::PayloadTooLarge(_))));
    }
}

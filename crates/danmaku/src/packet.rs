//! Binary packet framing for the live message stream.
//!
//! Every WebSocket binary frame carries one or more packets:
//!
//! ```text
//! offset 0  u32 BE  packet length (header + body)
//! offset 4  u16 BE  header length (16)
//! offset 6  u16 BE  protocol version
//! offset 8  u32 BE  operation
//! offset 12 u32 BE  sequence
//! offset 16 ...     body
//! ```
//!
//! Version 2 bodies are zlib streams and version 3 bodies are brotli streams;
//! both decompress to another sequence of framed packets.

use std::io::Read;

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{DanmakuError, Result};

/// Size of the fixed packet header.
pub const HEADER_LEN: usize = 16;

/// Upper bound for a single packet body, before and after decompression.
pub const MAX_PAYLOAD_BYTES: usize = 8 * 1024 * 1024;

/// Compressed packets may nest; anything deeper than this is rejected.
const MAX_NESTING: usize = 4;

/// Heartbeat body expected by the server.
const HEARTBEAT_BODY: &[u8] = b"[object Object]";

/// Operation codes
pub mod op {
    pub const HEARTBEAT: u32 = 2;
    pub const HEARTBEAT_REPLY: u32 = 3;
    pub const MESSAGE: u32 = 5;
    pub const AUTH: u32 = 7;
    pub const AUTH_REPLY: u32 = 8;
}

/// Protocol versions
pub mod ver {
    pub const PLAIN_JSON: u16 = 0;
    pub const PLAIN: u16 = 1;
    pub const ZLIB: u16 = 2;
    pub const BROTLI: u16 = 3;
}

/// Parsed fixed-size packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_len: u32,
    pub header_len: u16,
    pub version: u16,
    pub operation: u32,
    pub sequence: u32,
}

impl PacketHeader {
    /// Parse a header from the first 16 bytes of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(DanmakuError::decode(format!(
                "truncated header: {} bytes",
                buf.len()
            )));
        }

        let header = Self {
            packet_len: BigEndian::read_u32(&buf[0..4]),
            header_len: BigEndian::read_u16(&buf[4..6]),
            version: BigEndian::read_u16(&buf[6..8]),
            operation: BigEndian::read_u32(&buf[8..12]),
            sequence: BigEndian::read_u32(&buf[12..16]),
        };

        if (header.header_len as usize) < HEADER_LEN {
            return Err(DanmakuError::decode(format!(
                "invalid header length {}",
                header.header_len
            )));
        }
        if header.packet_len < header.header_len as u32 {
            return Err(DanmakuError::decode(format!(
                "invalid packet length {} (header length {})",
                header.packet_len, header.header_len
            )));
        }

        Ok(header)
    }
}

/// A single framed packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: u16,
    pub operation: u32,
    pub sequence: u32,
    pub body: Bytes,
}

impl Packet {
    /// Create a packet with sequence number 1.
    pub fn new(version: u16, operation: u32, body: impl Into<Bytes>) -> Self {
        Self {
            version,
            operation,
            sequence: 1,
            body: body.into(),
        }
    }

    /// Set the sequence number.
    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    /// Heartbeat packet (operation 2).
    pub fn heartbeat() -> Self {
        Self::new(ver::PLAIN, op::HEARTBEAT, Bytes::from_static(HEARTBEAT_BODY))
    }

    /// Serialize the packet including its 16-byte header.
    pub fn encode(&self) -> Vec<u8> {
        let packet_len = HEADER_LEN + self.body.len();
        let mut buf = Vec::with_capacity(packet_len);

        buf.extend_from_slice(&(packet_len as u32).to_be_bytes());
        buf.extend_from_slice(&(HEADER_LEN as u16).to_be_bytes());
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.extend_from_slice(&self.operation.to_be_bytes());
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.body);

        buf
    }

    /// Deserialize the body as JSON.
    pub fn body_json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Decode a WebSocket frame into its plain packets, recursing into
/// compressed bodies.
pub fn decode_frame(data: &[u8]) -> Result<Vec<Packet>> {
    let mut packets = Vec::new();
    decode_into(data, 0, &mut packets)?;
    Ok(packets)
}

fn decode_into(data: &[u8], depth: usize, out: &mut Vec<Packet>) -> Result<()> {
    if depth > MAX_NESTING {
        return Err(DanmakuError::decode("compressed packets nested too deeply"));
    }

    let mut offset = 0;
    while offset < data.len() {
        let header = PacketHeader::parse(&data[offset..])?;
        let packet_len = header.packet_len as usize;
        let end = offset
            .checked_add(packet_len)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| {
                DanmakuError::decode(format!(
                    "packet length {} exceeds remaining {} bytes",
                    packet_len,
                    data.len() - offset
                ))
            })?;

        let body = &data[offset + header.header_len as usize..end];
        if body.len() > MAX_PAYLOAD_BYTES {
            return Err(DanmakuError::decode(format!(
                "packet body of {} bytes exceeds limit",
                body.len()
            )));
        }

        match header.version {
            ver::ZLIB => {
                let inflated = decompress_zlib(body)?;
                decode_into(&inflated, depth + 1, out)?;
            }
            ver::BROTLI => {
                let inflated = decompress_brotli(body)?;
                decode_into(&inflated, depth + 1, out)?;
            }
            ver::PLAIN_JSON | ver::PLAIN => out.push(Packet {
                version: header.version,
                operation: header.operation,
                sequence: header.sequence,
                body: Bytes::copy_from_slice(body),
            }),
            other => {
                debug!(version = other, "Skipping packet with unknown protocol version");
            }
        }

        offset = end;
    }

    Ok(())
}

/// Wrap `inner` packets into a single compressed packet (version 2 or 3).
pub fn encode_compressed(inner: &[Packet], version: u16, operation: u32) -> Result<Packet> {
    let plain: Vec<u8> = inner.iter().flat_map(Packet::encode).collect();

    let body = match version {
        ver::ZLIB => {
            use std::io::Write;
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&plain)?;
            encoder.finish()?
        }
        ver::BROTLI => {
            use std::io::Write;
            let mut out = Vec::new();
            {
                let mut writer = brotli::CompressorWriter::new(&mut out, 4096, 5, 22);
                writer.write_all(&plain)?;
                writer.flush()?;
            }
            out
        }
        other => {
            return Err(DanmakuError::other(format!(
                "version {other} is not a compressed protocol version"
            )));
        }
    };

    Ok(Packet::new(version, operation, body))
}

fn read_capped(reader: impl Read, codec: &str) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    reader
        .take(MAX_PAYLOAD_BYTES as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| DanmakuError::decode(format!("{codec} decompression failed: {e}")))?;

    if out.len() > MAX_PAYLOAD_BYTES {
        return Err(DanmakuError::decode(format!(
            "{codec} payload exceeds {MAX_PAYLOAD_BYTES} bytes"
        )));
    }
    Ok(out)
}

fn decompress_zlib(data: &[u8]) -> Result<Vec<u8>> {
    read_capped(ZlibDecoder::new(data), "zlib")
}

fn decompress_brotli(data: &[u8]) -> Result<Vec<u8>> {
    read_capped(brotli::Decompressor::new(data, 4096), "brotli")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn danmu_json(content: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "cmd": "DANMU_MSG",
            "info": [[0, 1, 25, 16777215], content, [7, "viewer"]]
        }))
        .unwrap()
    }

    #[test]
    fn test_encode_header_layout() {
        let packet = Packet::new(ver::PLAIN, op::AUTH, Bytes::from_static(b"test"));
        let raw = packet.encode();

        assert_eq!(BigEndian::read_u32(&raw[0..4]), 20);
        assert_eq!(BigEndian::read_u16(&raw[4..6]), 16);
        assert_eq!(BigEndian::read_u16(&raw[6..8]), 1);
        assert_eq!(BigEndian::read_u32(&raw[8..12]), op::AUTH);
        assert_eq!(BigEndian::read_u32(&raw[12..16]), 1);
        assert_eq!(&raw[16..], b"test");
    }

    #[test]
    fn test_heartbeat_matches_wire_bytes() {
        let raw = Packet::heartbeat().encode();
        assert_eq!(raw.len(), 31);
        assert_eq!(&raw[0..4], &[0, 0, 0, 0x1f]);
        assert_eq!(&raw[16..], b"[object Object]");
    }

    #[test]
    fn test_decode_multiple_plain_packets() {
        let mut frame = Packet::new(ver::PLAIN, op::HEARTBEAT_REPLY, vec![0, 0, 0, 9]).encode();
        frame.extend(Packet::new(ver::PLAIN_JSON, op::MESSAGE, danmu_json("a")).encode());

        let packets = decode_frame(&frame).unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].operation, op::HEARTBEAT_REPLY);
        assert_eq!(packets[1].operation, op::MESSAGE);
    }

    #[test]
    fn test_decode_zlib_nested() {
        let inner = vec![
            Packet::new(ver::PLAIN_JSON, op::MESSAGE, danmu_json("first")),
            Packet::new(ver::PLAIN_JSON, op::MESSAGE, danmu_json("second")),
        ];
        let outer = encode_compressed(&inner, ver::ZLIB, op::MESSAGE).unwrap();

        let packets = decode_frame(&outer.encode()).unwrap();
        assert_eq!(packets, inner);
    }

    #[test]
    fn test_decode_brotli_nested() {
        let inner = vec![Packet::new(ver::PLAIN_JSON, op::MESSAGE, danmu_json("br"))];
        let outer = encode_compressed(&inner, ver::BROTLI, op::MESSAGE).unwrap();

        let packets = decode_frame(&outer.encode()).unwrap();
        assert_eq!(packets, inner);
    }

    #[test]
    fn test_decode_rejects_short_packet_length() {
        let mut raw = Packet::new(ver::PLAIN, op::MESSAGE, b"x".to_vec()).encode();
        raw[0..4].copy_from_slice(&8u32.to_be_bytes());
        assert!(matches!(decode_frame(&raw), Err(DanmakuError::Decode(_))));
    }

    #[test]
    fn test_decode_rejects_overlong_packet_length() {
        let mut raw = Packet::new(ver::PLAIN, op::MESSAGE, b"xyz".to_vec()).encode();
        raw[0..4].copy_from_slice(&100u32.to_be_bytes());
        assert!(matches!(decode_frame(&raw), Err(DanmakuError::Decode(_))));
    }

    #[test]
    fn test_decode_rejects_truncated_header() {
        assert!(decode_frame(&[0, 0, 0, 16, 0, 16]).is_err());
    }

    #[test]
    fn test_decode_rejects_corrupt_zlib() {
        let raw = Packet::new(ver::ZLIB, op::MESSAGE, b"not zlib".to_vec()).encode();
        assert!(matches!(decode_frame(&raw), Err(DanmakuError::Decode(_))));
    }

    #[test]
    fn test_body_json() {
        let packet = Packet::new(ver::PLAIN_JSON, op::AUTH_REPLY, b"{\"code\":0}".to_vec());
        let value: serde_json::Value = packet.body_json().unwrap();
        assert_eq!(value["code"], 0);
    }
}

// Copyright 2020 Joyent, Inc.

//! Remoting command definition and the framing codec used on the wire.

use std::collections::HashMap;
use std::fmt;
use std::io::{Error, ErrorKind};

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num::FromPrimitive;
use serde_derive::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

const RPC_TYPE_BIT: i32 = 0;
const RPC_ONEWAY_BIT: i32 = 1;

const LENGTH_FIELD_SZ: usize = 4;
const HEADER_MARK_SZ: usize = 4;
const HEADER_LENGTH_MASK: u32 = 0x00ff_ffff;

/// Largest frame accepted by default, 16 MiB.
pub const DEFAULT_FRAME_MAX_LENGTH: usize = 16 * 1024 * 1024;

pub const LANGUAGE_RUST: &str = "RUST";
pub const PROTOCOL_VERSION: i32 = 0;

/// Opaques are allocated from a circular 31-bit space.
const OPAQUE_MAX: u32 = i32::max_value() as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemotingCommandType {
    Request,
    Response,
}

/// Response codes the remoting layer itself produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_derive::FromPrimitive)]
pub enum ResponseCode {
    Success = 0,
    SystemError = 1,
    SystemBusy = 2,
    RequestCodeNotSupported = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, num_derive::FromPrimitive)]
pub enum SerializeType {
    Json = 0,
}

/// Caller-owned generator of opaque request identifiers.
#[derive(Debug)]
pub struct OpaqueId(u32);

impl OpaqueId {
    pub fn new() -> OpaqueId {
        OpaqueId(0)
    }

    pub fn starting_at(start: u32) -> OpaqueId {
        OpaqueId(start % OPAQUE_MAX)
    }
}

impl Default for OpaqueId {
    fn default() -> Self {
        OpaqueId::new()
    }
}

impl Iterator for OpaqueId {
    type Item = i32;

    fn next(&mut self) -> Option<i32> {
        let current = self.0;
        self.0 = (self.0 + 1) % OPAQUE_MAX;
        Some(current as i32)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
struct CommandHeader {
    code: i32,
    language: String,
    version: i32,
    opaque: i32,
    flag: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    remark: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ext_fields: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemotingCommand {
    pub code: i32,
    pub language: String,
    pub version: i32,
    pub opaque: i32,
    pub flag: i32,
    pub remark: Option<String>,
    pub ext_fields: HashMap<String, String>,
    pub body: Option<Bytes>,
}

impl RemotingCommand {
    fn with_code(code: i32) -> RemotingCommand {
        RemotingCommand {
            code,
            language: String::from(LANGUAGE_RUST),
            version: PROTOCOL_VERSION,
            opaque: 0,
            flag: 0,
            remark: None,
            ext_fields: HashMap::new(),
            body: None,
        }
    }

    pub fn create_request(code: i32, opaque: i32) -> RemotingCommand {
        let mut cmd = RemotingCommand::with_code(code);
        cmd.opaque = opaque;
        cmd
    }

    pub fn create_response(code: ResponseCode, remark: Option<String>) -> RemotingCommand {
        let mut cmd = RemotingCommand::with_code(code as i32);
        cmd.mark_response_type();
        cmd.remark = remark;
        cmd
    }

    pub fn with_body<B: Into<Bytes>>(mut self, body: B) -> RemotingCommand {
        self.body = Some(body.into());
        self
    }

    pub fn with_ext_field(mut self, key: &str, value: &str) -> RemotingCommand {
        self.ext_fields.insert(String::from(key), String::from(value));
        self
    }

    pub fn mark_response_type(&mut self) {
        self.flag |= 1 << RPC_TYPE_BIT;
    }

    pub fn mark_oneway(&mut self) {
        self.flag |= 1 << RPC_ONEWAY_BIT;
    }

    pub fn is_oneway(&self) -> bool {
        self.flag & (1 << RPC_ONEWAY_BIT) != 0
    }

    pub fn command_type(&self) -> RemotingCommandType {
        if self.flag & (1 << RPC_TYPE_BIT) != 0 {
            RemotingCommandType::Response
        } else {
            RemotingCommandType::Request
        }
    }

    /// Interprets `code` as one of the remoting layer's own response codes.
    pub fn response_code(&self) -> Option<ResponseCode> {
        FromPrimitive::from_i32(self.code)
    }

    fn header(&self) -> CommandHeader {
        CommandHeader {
            code: self.code,
            language: self.language.clone(),
            version: self.version,
            opaque: self.opaque,
            flag: self.flag,
            remark: self.remark.clone(),
            ext_fields: if self.ext_fields.is_empty() {
                None
            } else {
                Some(self.ext_fields.clone())
            },
        }
    }

    fn from_parts(header: CommandHeader, body: Option<Bytes>) -> RemotingCommand {
        RemotingCommand {
            code: header.code,
            language: header.language,
            version: header.version,
            opaque: header.opaque,
            flag: header.flag,
            remark: header.remark,
            ext_fields: header.ext_fields.unwrap_or_default(),
            body,
        }
    }
}

impl fmt::Display for RemotingCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "command [code={}, opaque={}, flag={:#b}, language={}, version={}, body={}B",
            self.code,
            self.opaque,
            self.flag,
            self.language,
            self.version,
            self.body.as_ref().map_or(0, |b| b.len())
        )?;
        if let Some(remark) = &self.remark {
            write!(f, ", remark={}", remark)?;
        }
        if !self.ext_fields.is_empty() {
            write!(f, ", ext={:?}", self.ext_fields)?;
        }
        write!(f, "]")
    }
}

fn invalid_data<E: Into<Box<dyn std::error::Error + Send + Sync>>>(e: E) -> Error {
    Error::new(ErrorKind::InvalidData, e)
}

/// Codec for the length-prefixed JSON-header command frame.
#[derive(Debug, Clone)]
pub struct RemotingCodec {
    frame_max_length: usize,
}

impl RemotingCodec {
    pub fn new(frame_max_length: usize) -> RemotingCodec {
        RemotingCodec { frame_max_length }
    }
}

impl Default for RemotingCodec {
    fn default() -> Self {
        RemotingCodec::new(DEFAULT_FRAME_MAX_LENGTH)
    }
}

impl Decoder for RemotingCodec {
    type Item = RemotingCommand;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Error> {
        if buf.len() < LENGTH_FIELD_SZ {
            return Ok(None);
        }

        let frame_len = BigEndian::read_u32(&buf[..LENGTH_FIELD_SZ]) as usize;
        if frame_len > self.frame_max_length {
            let msg = format!(
                "frame length {} exceeds maximum of {}",
                frame_len, self.frame_max_length
            );
            return Err(invalid_data(msg));
        }
        if frame_len < HEADER_MARK_SZ {
            return Err(invalid_data("frame too short to hold a header mark"));
        }
        if buf.len() < LENGTH_FIELD_SZ + frame_len {
            buf.reserve(LENGTH_FIELD_SZ + frame_len - buf.len());
            return Ok(None);
        }

        buf.advance(LENGTH_FIELD_SZ);
        let mut frame = buf.split_to(frame_len);

        let mark = frame.get_u32();
        let serialize_type = (mark >> 24) as u8;
        let header_len = (mark & HEADER_LENGTH_MASK) as usize;

        match SerializeType::from_u8(serialize_type) {
            Some(SerializeType::Json) => (),
            None => {
                let msg = format!("unsupported serialize type {}", serialize_type);
                return Err(invalid_data(msg));
            }
        }

        if header_len > frame.len() {
            return Err(invalid_data(
                "header length does not fit within the frame",
            ));
        }

        let header_bytes = frame.split_to(header_len);
        let header: CommandHeader = serde_json::from_slice(&header_bytes)
            .map_err(|e| invalid_data(format!("failed to parse command header: {}", e)))?;

        let body = if frame.is_empty() {
            None
        } else {
            Some(frame.freeze())
        };

        Ok(Some(RemotingCommand::from_parts(header, body)))
    }
}

impl Encoder<RemotingCommand> for RemotingCodec {
    type Error = Error;

    fn encode(&mut self, item: RemotingCommand, buf: &mut BytesMut) -> Result<(), Error> {
        encode_frame(&item, buf, self.frame_max_length)
    }
}

/// Encode `cmd` with the default frame limit.
pub fn encode_cmd(cmd: &RemotingCommand, buf: &mut BytesMut) -> Result<(), Error> {
    encode_frame(cmd, buf, DEFAULT_FRAME_MAX_LENGTH)
}

/// Nothing is written to `buf` when the command is rejected.
fn encode_frame(
    cmd: &RemotingCommand,
    buf: &mut BytesMut,
    frame_max_length: usize,
) -> Result<(), Error> {
    let header = serde_json::to_vec(&cmd.header())
        .map_err(|e| invalid_data(format!("failed to encode command header: {}", e)))?;
    if header.len() as u32 > HEADER_LENGTH_MASK {
        return Err(invalid_data("command header too large"));
    }

    let body_len = cmd.body.as_ref().map_or(0, |b| b.len());
    let frame_len = HEADER_MARK_SZ + header.len() + body_len;
    if frame_len > frame_max_length {
        let msg = format!(
            "frame length {} exceeds maximum of {}",
            frame_len, frame_max_length
        );
        return Err(invalid_data(msg));
    }

    buf.reserve(LENGTH_FIELD_SZ + frame_len);
    buf.put_u32(frame_len as u32);
    buf.put_u32(((SerializeType::Json as u32) << 24) | header.len() as u32);
    buf.put_slice(&header);
    if let Some(body) = &cmd.body {
        buf.put_slice(body);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use quickcheck::{quickcheck, Arbitrary, Gen};

    #[derive(Clone, Debug)]
    struct ArbCommand(RemotingCommand);

    impl Arbitrary for ArbCommand {
        fn arbitrary(g: &mut Gen) -> ArbCommand {
            let mut cmd = RemotingCommand::create_request(
                i32::arbitrary(g),
                i32::arbitrary(g),
            );
            cmd.flag = i32::arbitrary(g) & 0x3;
            cmd.remark = Option::<String>::arbitrary(g);
            cmd.ext_fields = HashMap::<String, String>::arbitrary(g);
            let body = Vec::<u8>::arbitrary(g);
            if !body.is_empty() {
                cmd.body = Some(Bytes::from(body));
            }
            ArbCommand(cmd)
        }
    }

    quickcheck! {
        fn prop_decode_inverts_encode(cmd: ArbCommand) -> bool {
            let mut buf = BytesMut::new();
            let mut codec = RemotingCodec::default();
            codec.encode(cmd.0.clone(), &mut buf).is_ok()
                && matches!(codec.decode(&mut buf), Ok(Some(ref d)) if *d == cmd.0)
                && buf.is_empty()
        }

        fn prop_opaque_ids_stay_positive(start: u32, count: u8) -> bool {
            OpaqueId::starting_at(start)
                .take(count as usize)
                .all(|id| id >= 0)
        }
    }

    #[test]
    fn opaque_ids_wrap_within_31_bits() {
        let mut ids = OpaqueId::starting_at(OPAQUE_MAX - 1);
        assert_eq!(ids.next(), Some(i32::max_value() - 1));
        assert_eq!(ids.next(), Some(0));
        assert_eq!(ids.next(), Some(1));
    }

    #[test]
    fn partial_frame_needs_more_bytes() {
        let cmd = RemotingCommand::create_request(10, 7).with_body(&b"payload"[..]);
        let mut full = BytesMut::new();
        encode_cmd(&cmd, &mut full).unwrap();

        let mut codec = RemotingCodec::default();
        let mut partial = BytesMut::from(&full[..full.len() - 3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[full.len() - 3..]);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded.opaque, 7);
        assert_eq!(decoded.body, Some(Bytes::from_static(b"payload")));
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let mut buf = BytesMut::new();
        encode_cmd(&RemotingCommand::create_request(1, 1), &mut buf).unwrap();
        encode_cmd(&RemotingCommand::create_request(2, 2), &mut buf).unwrap();

        let mut codec = RemotingCodec::default();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().opaque, 1);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().opaque, 2);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut buf = BytesMut::new();
        encode_cmd(
            &RemotingCommand::create_request(1, 1).with_body(vec![0u8; 128]),
            &mut buf,
        )
        .unwrap();
        let mut codec = RemotingCodec::new(64);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn oversized_command_not_encoded() {
        let mut buf = BytesMut::new();
        let mut codec = RemotingCodec::new(64);
        let err = codec
            .encode(
                RemotingCommand::create_request(1, 1).with_body(vec![0u8; 128]),
                &mut buf,
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert!(buf.is_empty());

        codec
            .encode(RemotingCommand::create_request(1, 2), &mut buf)
            .unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().opaque, 2);
    }

    #[test]
    fn description_names_code_and_opaque() {
        let cmd = RemotingCommand::create_request(17, 42).with_body(&b"abc"[..]);
        let desc = cmd.to_string();
        assert!(desc.contains("code=17"));
        assert!(desc.contains("opaque=42"));
        assert!(desc.contains("body=3B"));
    }

    #[test]
    fn unknown_serialize_type_rejected() {
        let mut buf = BytesMut::new();
        encode_cmd(&RemotingCommand::create_request(1, 1), &mut buf).unwrap();
        buf[LENGTH_FIELD_SZ] = 0x7f;
        assert!(RemotingCodec::default().decode(&mut buf).is_err());
    }

    #[test]
    fn flags_classify_commands() {
        let mut req = RemotingCommand::create_request(5, 9);
        assert_eq!(req.command_type(), RemotingCommandType::Request);
        assert!(!req.is_oneway());
        req.mark_oneway();
        assert!(req.is_oneway());

        let resp = RemotingCommand::create_response(ResponseCode::SystemBusy, None);
        assert_eq!(resp.command_type(), RemotingCommandType::Response);
        assert_eq!(resp.response_code(), Some(ResponseCode::SystemBusy));
    }

    #[test]
    fn header_uses_camel_case_fields() {
        let cmd = RemotingCommand::create_request(3, 4).with_ext_field("topic", "t");
        let json = serde_json::to_value(&cmd.header()).unwrap();
        assert_eq!(json["extFields"]["topic"], "t");
        assert_eq!(json["opaque"], 4);
        assert!(json.get("remark").is_none());
    }
}

//! Length-prefixed frame codec for the Control Stream.
//!
//! Frames are `be32(len(body)) ‖ body`, where the body is JSON or CBOR per
//! the negotiated session encoding. The decoder keeps a carry-over buffer:
//! QUIC reads routinely deliver more (or less) than one frame per chunk.

use crate::error::ProtocolError;
use crate::protocol::types::RpcMessage;
use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Length-prefix size in bytes.
const LENGTH_PREFIX: usize = 4;

/// Control Stream body encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    Json,
    Cbor,
}

impl Encoding {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "json" => Some(Self::Json),
            "cbor" => Some(Self::Cbor),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Cbor => "cbor",
        }
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stateless frame encoder.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: u32,
}

impl FrameCodec {
    pub fn new(max_frame_size: u32) -> Self {
        Self { max_frame_size }
    }

    /// Serialize a message as a length-prefixed frame.
    pub fn encode(
        &self,
        message: &RpcMessage,
        encoding: Encoding,
    ) -> Result<Bytes, ProtocolError> {
        let body = encode_body(message, encoding)?;

        if body.len() as u64 > self.max_frame_size as u64 {
            return Err(ProtocolError::FrameTooLarge {
                size: body.len() as u64,
                max: self.max_frame_size,
            });
        }

        let mut frame = BytesMut::with_capacity(LENGTH_PREFIX + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame.freeze())
    }
}

/// Incremental frame decoder with a carry-over buffer.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_frame_size: u32,
}

impl FrameDecoder {
    pub fn new(max_frame_size: u32) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_frame_size,
        }
    }

    /// Feed incoming bytes into the decode buffer.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Attempt to decode the next complete frame.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn try_decode(&mut self, encoding: Encoding) -> Result<Option<RpcMessage>, ProtocolError> {
        match self.try_next_body()? {
            Some(body) => decode_message(&body, encoding).map(Some),
            None => Ok(None),
        }
    }

    /// Extract the next complete frame body without parsing it.
    ///
    /// The length prefix is validated before the body is buffered, so an
    /// oversize announcement fails immediately rather than after 16 MiB
    /// of reads. The session layer parses the body itself so it can retry
    /// under the other encoding to diagnose an encoding mismatch.
    pub fn try_next_body(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        if self.buffer.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let length = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]);

        if length > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: length as u64,
                max: self.max_frame_size,
            });
        }

        let total = LENGTH_PREFIX + length as usize;
        if self.buffer.len() < total {
            return Ok(None);
        }

        self.buffer.advance(LENGTH_PREFIX);
        let body = self.buffer.split_to(length as usize);
        Ok(Some(body.freeze()))
    }

    /// True when EOF at this point would cut a frame in half.
    pub fn has_partial_frame(&self) -> bool {
        !self.buffer.is_empty()
    }
}

fn encode_body(message: &RpcMessage, encoding: Encoding) -> Result<Vec<u8>, ProtocolError> {
    match encoding {
        Encoding::Json => serde_json::to_vec(message)
            .map_err(|e| ProtocolError::InternalError(e.to_string().into())),
        Encoding::Cbor => {
            let mut body = Vec::new();
            ciborium::into_writer(message, &mut body)
                .map_err(|e| ProtocolError::InternalError(e.to_string().into()))?;
            Ok(body)
        }
    }
}

/// Parse one frame body under the given encoding.
pub fn decode_message(body: &[u8], encoding: Encoding) -> Result<RpcMessage, ProtocolError> {
    match encoding {
        Encoding::Json => serde_json::from_slice(body).map_err(|_| ProtocolError::ParseError),
        Encoding::Cbor => ciborium::from_reader(body).map_err(|_| ProtocolError::ParseError),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::{RpcRequest, RpcResponse};

    fn sample_request() -> RpcMessage {
        RpcMessage::Request(
            RpcRequest::new("tools/call")
                .with_id(7)
                .with_params(serde_json::json!({"name": "echo_joke", "arguments": {}})),
        )
    }

    #[test]
    fn test_roundtrip_json() {
        let codec = FrameCodec::new(1024);
        let message = sample_request();
        let frame = codec.encode(&message, Encoding::Json).unwrap();

        let mut decoder = FrameDecoder::new(1024);
        decoder.feed(&frame);
        let decoded = decoder.try_decode(Encoding::Json).unwrap().unwrap();
        assert_eq!(decoded, message);
        assert!(!decoder.has_partial_frame());
    }

    #[test]
    fn test_roundtrip_cbor() {
        let codec = FrameCodec::new(1024);
        let message = RpcMessage::Response(RpcResponse::success(
            Some(3i64.into()),
            serde_json::json!({"tools": []}),
        ));
        let frame = codec.encode(&message, Encoding::Cbor).unwrap();

        let mut decoder = FrameDecoder::new(1024);
        decoder.feed(&frame);
        let decoded = decoder.try_decode(Encoding::Cbor).unwrap().unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_length_prefix_layout() {
        let codec = FrameCodec::new(1024);
        let frame = codec.encode(&sample_request(), Encoding::Json).unwrap();

        let length = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        assert_eq!(length as usize, frame.len() - 4);
    }

    #[test]
    fn test_decode_across_chunks() {
        let codec = FrameCodec::new(1024);
        let message = sample_request();
        let frame = codec.encode(&message, Encoding::Json).unwrap();

        let mut decoder = FrameDecoder::new(1024);
        // 3-byte chunks never align with the 4-byte prefix
        for chunk in frame.chunks(3) {
            decoder.feed(chunk);
        }
        let decoded = decoder.try_decode(Encoding::Json).unwrap().unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_two_frames_one_chunk() {
        let codec = FrameCodec::new(1024);
        let first = sample_request();
        let second = RpcMessage::Request(RpcRequest::new("ping").with_id(8));

        let mut bytes = codec.encode(&first, Encoding::Json).unwrap().to_vec();
        bytes.extend_from_slice(&codec.encode(&second, Encoding::Json).unwrap());

        let mut decoder = FrameDecoder::new(1024);
        decoder.feed(&bytes);
        assert_eq!(decoder.try_decode(Encoding::Json).unwrap().unwrap(), first);
        assert_eq!(decoder.try_decode(Encoding::Json).unwrap().unwrap(), second);
        assert!(decoder.try_decode(Encoding::Json).unwrap().is_none());
    }

    #[test]
    fn test_incomplete_frame_pends() {
        let codec = FrameCodec::new(1024);
        let frame = codec.encode(&sample_request(), Encoding::Json).unwrap();

        let mut decoder = FrameDecoder::new(1024);
        decoder.feed(&frame[..frame.len() - 1]);
        assert!(decoder.try_decode(Encoding::Json).unwrap().is_none());
        assert!(decoder.has_partial_frame());
    }

    #[test]
    fn test_oversize_announcement_rejected() {
        let mut decoder = FrameDecoder::new(16);
        decoder.feed(&1024u32.to_be_bytes());
        let err = decoder.try_decode(Encoding::Json).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_oversize_encode_rejected() {
        let codec = FrameCodec::new(8);
        let err = codec.encode(&sample_request(), Encoding::Json).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_invalid_body() {
        let mut decoder = FrameDecoder::new(1024);
        let mut frame = 9u32.to_be_bytes().to_vec();
        frame.extend_from_slice(b"not json!");
        decoder.feed(&frame);

        let err = decoder.try_decode(Encoding::Json).unwrap_err();
        assert!(matches!(err, ProtocolError::ParseError));
    }

    #[test]
    fn test_wrong_encoding_rejected() {
        let codec = FrameCodec::new(1024);
        let frame = codec.encode(&sample_request(), Encoding::Cbor).unwrap();

        let mut decoder = FrameDecoder::new(1024);
        decoder.feed(&frame);
        // CBOR body under a JSON decoder is a parse error, surfaced
        // as an encoding mismatch by the session layer.
        assert!(decoder.try_decode(Encoding::Json).is_err());
    }
}

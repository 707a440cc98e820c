//! 帧格式：4 字节大端长度 + UTF-8 字符串组成的 JSON 数组
//!
//! 服务端每收到一帧回一个字节的确认。

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::core::error::{EngineError, EngineResult};

/// 单帧上限，超过即断开连接
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

const ACK_BYTE: u8 = 1;

fn frame_error(e: io::Error) -> EngineError {
    match e.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput => EngineError::Protocol(e.to_string()),
        _ => EngineError::Io(e),
    }
}

/// 一批命令行参数
#[derive(Debug, Clone)]
pub struct BatchCodec {
    inner: LengthDelimitedCodec,
}

impl BatchCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(MAX_FRAME_LEN)
                .new_codec(),
        }
    }
}

impl Default for BatchCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for BatchCodec {
    type Item = Vec<String>;
    type Error = EngineError;

    fn decode(&mut self, src: &mut BytesMut) -> EngineResult<Option<Self::Item>> {
        match self.inner.decode(src).map_err(frame_error)? {
            Some(body) => Ok(Some(serde_json::from_slice(&body)?)),
            None => Ok(None),
        }
    }
}

impl<'a> Encoder<&'a [String]> for BatchCodec {
    type Error = EngineError;

    fn encode(&mut self, args: &'a [String], dst: &mut BytesMut) -> EngineResult<()> {
        let body = Bytes::from(serde_json::to_vec(args)?);
        self.inner.encode(body, dst).map_err(frame_error)
    }
}

/// 服务端对一帧的确认
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack;

#[derive(Debug, Clone, Copy, Default)]
pub struct AckCodec;

impl Decoder for AckCodec {
    type Item = Ack;
    type Error = EngineError;

    fn decode(&mut self, src: &mut BytesMut) -> EngineResult<Option<Ack>> {
        if src.is_empty() {
            return Ok(None);
        }
        match src.get_u8() {
            ACK_BYTE => Ok(Some(Ack)),
            other => Err(EngineError::Protocol(format!("无效的确认: {}", other))),
        }
    }
}

impl Encoder<Ack> for AckCodec {
    type Error = EngineError;

    fn encode(&mut self, _ack: Ack, dst: &mut BytesMut) -> EngineResult<()> {
        dst.put_u8(ACK_BYTE);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch() -> Vec<String> {
        vec!["https://example.com/a.zip".to_string(), "-d".to_string(), "/tmp/下载".to_string()]
    }

    fn encode(args: &[String]) -> BytesMut {
        let mut dst = BytesMut::new();
        BatchCodec::new().encode(args, &mut dst).unwrap();
        dst
    }

    #[test]
    fn test_wire_layout() {
        let frame = encode(&[]);
        assert_eq!(&frame[..], b"\x00\x00\x00\x02[]");
    }

    #[test]
    fn test_partial_frame_not_yielded() {
        let frame = encode(&batch());
        let mut codec = BatchCodec::new();
        let mut src = BytesMut::new();
        for byte in &frame[..frame.len() - 1] {
            src.put_u8(*byte);
            assert!(codec.decode(&mut src).unwrap().is_none());
        }
        src.put_u8(frame[frame.len() - 1]);
        assert_eq!(codec.decode(&mut src).unwrap(), Some(batch()));
        assert!(src.is_empty());
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut codec = BatchCodec::new();
        let mut src = encode(&batch());
        src.extend_from_slice(&encode(&[]));
        assert_eq!(codec.decode(&mut src).unwrap(), Some(batch()));
        assert_eq!(codec.decode(&mut src).unwrap(), Some(Vec::new()));
        assert_eq!(codec.decode(&mut src).unwrap(), None);
    }

    #[test]
    fn test_oversize_frame_rejected() {
        let mut codec = BatchCodec::new();
        let mut src = BytesMut::from(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes()[..]);
        assert!(matches!(codec.decode(&mut src), Err(EngineError::Protocol(_))));

        let huge = vec!["x".repeat(MAX_FRAME_LEN)];
        let mut dst = BytesMut::new();
        assert!(matches!(BatchCodec::new().encode(&huge[..], &mut dst), Err(EngineError::Protocol(_))));
    }

    #[test]
    fn test_malformed_body() {
        let mut codec = BatchCodec::new();
        let mut src = BytesMut::new();
        src.put_u32(3);
        src.put_slice(b"{}x");
        assert!(matches!(codec.decode(&mut src), Err(EngineError::Json(_))));
    }

    #[test]
    fn test_ack() {
        let mut dst = BytesMut::new();
        AckCodec.encode(Ack, &mut dst).unwrap();
        assert_eq!(AckCodec.decode(&mut dst).unwrap(), Some(Ack));
        assert_eq!(AckCodec.decode(&mut dst).unwrap(), None);
        let mut bad = BytesMut::from(&b"\x07"[..]);
        assert!(AckCodec.decode(&mut bad).is_err());
    }
}

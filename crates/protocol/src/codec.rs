//! Length-delimited gzip-JSON framing for the signalling protocol.
//!
//! Every frame on a duplex binary channel is the gzip-compressed JSON encoding
//! of a single concrete message struct. Decoding is two-phase in spirit: a
//! caller that only needs the `payload_type` tag decodes into [`MessageBase`],
//! then the same bytes are re-decoded into the concrete struct it names. In
//! practice `decode_message` is generic over the target type, so callers
//! usually decode straight into [`FramedMessage`] and match on the variant.

use serde::{Serialize, de::DeserializeOwned};
use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    EncodeJson(#[source] serde_json::Error),
    #[error("failed to decode message: {0}")]
    DecodeJson(#[source] serde_json::Error),
    #[error("failed to gzip-compress message: {0}")]
    Compress(#[source] std::io::Error),
    #[error("failed to gzip-decompress message: {0}")]
    Decompress(#[source] std::io::Error),
}

/// Marshal `msg` to JSON, then gzip-compress it into a single binary frame.
pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, CodecError> {
    let json = serde_json::to_vec(msg).map_err(CodecError::EncodeJson)?;

    let mut writer = GzEncoder::new(Vec::new(), Compression::default());
    writer.write_all(&json).map_err(CodecError::Compress)?;
    writer.finish().map_err(CodecError::Compress)
}

/// Gzip-decompress `data`, then JSON-decode it into `T`.
///
/// This is used both to peek at a frame's `payload_type` (with `T =
/// MessageBase`) and to decode the concrete message once the tag is known
/// (with `T` a [`FramedMessage`] variant's payload, or `FramedMessage`
/// itself).
pub fn decode_message<T: DeserializeOwned>(data: &[u8]) -> Result<T, CodecError> {
    let mut reader = GzDecoder::new(data);
    let mut json = Vec::new();
    reader
        .read_to_end(&mut json)
        .map_err(CodecError::Decompress)?;
    serde_json::from_slice(&json).map_err(CodecError::DecodeJson)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{FramedMessage, MessageBase};

    #[test]
    fn roundtrip_framed_message() {
        let msg = FramedMessage::Log {
            latency_tracker: None,
            level: "info".to_string(),
            message: "hello".to_string(),
            time: "2024-01-01T00:00:00Z".to_string(),
        };
        let encoded = encode_message(&msg).unwrap();
        let decoded: FramedMessage = decode_message(&encoded).unwrap();
        match decoded {
            FramedMessage::Log { message, .. } => assert_eq!(message, "hello"),
            other => panic!("expected Log, got {other:?}"),
        }
    }

    #[test]
    fn two_phase_decode_reads_tag_from_base() {
        let msg = FramedMessage::Answer {
            latency_tracker: None,
            answer_type: crate::messages::AnswerType::Ok,
        };
        let encoded = encode_message(&msg).unwrap();
        let base: MessageBase = decode_message(&encoded).unwrap();
        assert_eq!(base.payload_type, "answer");

        let concrete: FramedMessage = decode_message(&encoded).unwrap();
        assert!(matches!(
            concrete,
            FramedMessage::Answer {
                answer_type: crate::messages::AnswerType::Ok,
                ..
            }
        ));
    }

    #[test]
    fn bad_frame_is_an_error_not_a_panic() {
        let garbage = b"not a gzip stream";
        let result: Result<FramedMessage, _> = decode_message(garbage);
        assert!(result.is_err());
    }

    #[test]
    fn output_is_actually_gzip_compressed() {
        let msg = FramedMessage::Log {
            latency_tracker: None,
            level: "info".to_string(),
            message: "x".repeat(1000),
            time: "2024-01-01T00:00:00Z".to_string(),
        };
        let encoded = encode_message(&msg).unwrap();
        // gzip magic bytes
        assert_eq!(&encoded[0..2], &[0x1f, 0x8b]);
    }
}

//! JSON framing for murmur envelopes.
//!
//! Wire format: one UTF-8 JSON object per WebSocket text frame. Frame
//! boundaries come from the transport, so there is no length prefix.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{MurmurError, MurmurResult};

/// Default maximum accepted inbound frame size (64 KiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

/// Encode a value into a single text frame.
pub fn frame_encode<T: Serialize>(value: &T) -> MurmurResult<String> {
    Ok(serde_json::to_string(value)?)
}

/// Decode a text frame into a typed value.
pub fn frame_decode<T: DeserializeOwned>(frame: &str) -> MurmurResult<T> {
    Ok(serde_json::from_str(frame)?)
}

/// Decode a frame after checking it against a size limit.
///
/// Oversized frames are rejected before parsing, so no JSON tree is built
/// for them. The transport bounds how much is buffered in the first place.
pub fn frame_decode_bounded<T: DeserializeOwned>(frame: &str, max_bytes: usize) -> MurmurResult<T> {
    if frame.len() > max_bytes {
        return Err(MurmurError::InvalidArgument(format!(
            "frame too large: {} bytes (max {max_bytes})",
            frame.len()
        )));
    }
    frame_decode(frame)
}

/// Decode a binary frame. Clients may send JSON in binary frames; it must
/// still be valid UTF-8.
pub fn frame_decode_bytes<T: DeserializeOwned>(data: &[u8], max_bytes: usize) -> MurmurResult<T> {
    let text = std::str::from_utf8(data)
        .map_err(|e| MurmurError::Codec(format!("frame is not valid UTF-8: {e}")))?;
    frame_decode_bounded(text, max_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{ClientEnvelope, ServerEnvelope};
    use crate::error::ErrorKind;

    #[test]
    fn encodes_notice() {
        let frame = frame_encode(&ServerEnvelope::notice("server shutdown")).unwrap();
        assert!(frame.contains(r#""type":"sys""#));
        assert!(frame.contains("server shutdown"));
    }

    #[test]
    fn malformed_frame_is_invalid_argument() {
        let err = frame_decode::<ClientEnvelope>("{not json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn oversized_frame_rejected_before_parse() {
        let big = format!(
            r#"{{"type":"channelMessage","channelMessage":{{"text":"{}"}}}}"#,
            "a".repeat(200)
        );
        let err = frame_decode_bounded::<ClientEnvelope>(&big, 64).unwrap_err();
        assert!(matches!(err, MurmurError::InvalidArgument(_)));
        assert!(frame_decode_bounded::<ClientEnvelope>(&big, 1024).is_ok());
    }

    #[test]
    fn binary_frames_must_be_utf8() {
        let err = frame_decode_bytes::<ClientEnvelope>(&[0xff, 0xfe], 1024).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let ok = frame_decode_bytes::<ClientEnvelope>(br#"{"type":"users"}"#, 1024).unwrap();
        assert!(matches!(ok, ClientEnvelope::Users));
    }
}

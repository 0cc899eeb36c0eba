//! Hybrid binary framing for browser/CLI terminal bridges.
//!
//! Every WebSocket binary message starts with a 1-byte tag: `0x00` control
//! (the rest is UTF-8 JSON `{type, payload}`) or `0x01` data (the rest is
//! raw terminal bytes). Text frames are not used on terminal bridges.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub const FRAME_CONTROL: u8 = 0x00;
pub const FRAME_DATA: u8 = 0x01;

/// Control frames on a terminal bridge, either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ControlFrame {
    /// Client→server: resize the PTY.
    Resize { cols: u16, rows: u16 },
    /// Liveness probe, either direction.
    Ping {},
    Pong {},
    /// Server→client: current ring-buffer sequence. Sent on attach and
    /// every 10 s; clients cache it for `?resume=`.
    Seq { seq: u64 },
    /// Server→client: the session exited. Sent at most once, right before
    /// the socket closes normally.
    Exit {
        #[serde(default)]
        code: Option<i32>,
        #[serde(default)]
        signal: Option<String>,
    },
}

/// A decoded bridge frame.
#[derive(Debug, Clone, PartialEq)]
pub enum WsFrame {
    Control(ControlFrame),
    Data(Bytes),
}

#[derive(Debug, thiserror::Error)]
pub enum WsFrameError {
    #[error("empty websocket frame")]
    Empty,
    #[error("unknown frame tag {0:#04x}")]
    UnknownTag(u8),
    #[error("bad control frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a control frame as a tagged binary message.
pub fn encode_control(frame: &ControlFrame) -> Vec<u8> {
    let mut out = vec![FRAME_CONTROL];
    // ControlFrame serialization cannot fail: all payloads are plain data.
    out.extend_from_slice(&serde_json::to_vec(frame).expect("control frame serializes"));
    out
}

/// Encode raw terminal bytes as a tagged binary message.
pub fn encode_data(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + bytes.len());
    out.push(FRAME_DATA);
    out.extend_from_slice(bytes);
    out
}

/// Decode a tagged binary message.
pub fn decode_frame(raw: &[u8]) -> Result<WsFrame, WsFrameError> {
    let (&tag, body) = raw.split_first().ok_or(WsFrameError::Empty)?;
    match tag {
        FRAME_CONTROL => Ok(WsFrame::Control(serde_json::from_slice(body)?)),
        FRAME_DATA => Ok(WsFrame::Data(Bytes::copy_from_slice(body))),
        other => Err(WsFrameError::UnknownTag(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_frames_round_trip() {
        for frame in [
            ControlFrame::Resize { cols: 120, rows: 40 },
            ControlFrame::Ping {},
            ControlFrame::Seq { seq: 991 },
            ControlFrame::Exit { code: Some(0), signal: None },
        ] {
            let decoded = decode_frame(&encode_control(&frame)).unwrap();
            assert_eq!(decoded, WsFrame::Control(frame));
        }
    }

    #[test]
    fn data_frames_round_trip() {
        let decoded = decode_frame(&encode_data(b"ls -la\r")).unwrap();
        assert_eq!(decoded, WsFrame::Data(Bytes::from_static(b"ls -la\r")));
    }

    #[test]
    fn control_wire_shape_is_type_payload() {
        let raw = encode_control(&ControlFrame::Seq { seq: 5 });
        let json: serde_json::Value = serde_json::from_slice(&raw[1..]).unwrap();
        assert_eq!(json["type"], "seq");
        assert_eq!(json["payload"]["seq"], 5);
    }

    #[test]
    fn bad_tags_are_rejected() {
        assert!(matches!(decode_frame(&[0x7f, 1, 2]), Err(WsFrameError::UnknownTag(0x7f))));
        assert!(matches!(decode_frame(&[]), Err(WsFrameError::Empty)));
    }
}

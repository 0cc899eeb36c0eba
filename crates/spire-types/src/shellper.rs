//! Wire protocol between the daemon and a shellper holder process.
//!
//! Frames travel over a Unix-domain socket, length-prefixed (u32 BE over
//! the tagged body) with a 1-byte tag: `0x00` control (UTF-8 JSON, unknown
//! fields tolerated for forward compatibility) or `0x01` raw terminal
//! bytes. Data frames carry PTY output holder→client and PTY input
//! client→holder; everything else is a control frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on a single frame body; a holder never needs to ship more
/// than its scrollback in one frame.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

const TAG_CONTROL: u8 = 0x00;
const TAG_DATA: u8 = 0x01;

/// Auto-restart policy for the holder's child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicy {
    /// Restarts allowed before the holder gives up and exits.
    pub max_restarts: u32,
    /// Delay between a child exit and its respawn.
    pub delay_ms: u64,
}

/// Control frames sent by the daemon-side client to a holder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HolderControl {
    /// Resize the PTY.
    Resize { cols: u16, rows: u16 },
    /// Terminate the child. The holder clears any restart policy before
    /// signalling so the kill cannot race an auto-respawn.
    Kill {},
    /// Claim an existing holder after a daemon restart. `expected_pid` and
    /// `expected_start_time` act as a capability: a recycled pid will not
    /// match the start time and the holder answers `stale`.
    Reconnect {
        expected_pid: u32,
        expected_start_time: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        restart_policy: Option<RestartPolicy>,
    },
}

/// Control frames sent by a holder to its client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HolderEvent {
    /// Sent first on every accepted connection.
    Meta {
        pid: u32,
        start_time: u64,
        socket_path: String,
    },
    /// The child exited (and no restart is pending).
    Exit {
        #[serde(default)]
        code: Option<i32>,
        #[serde(default)]
        signal: Option<String>,
    },
    /// A `reconnect` carried coordinates that do not match this holder.
    Stale {},
}

/// A decoded shellper frame, either direction.
#[derive(Debug, Clone, PartialEq)]
pub enum ShellperFrame {
    /// JSON control payload, kept raw so either side can parse it into
    /// its own control enum.
    Control(Bytes),
    /// Raw terminal bytes.
    Data(Bytes),
}

impl ShellperFrame {
    /// Build a control frame from any serializable control message.
    pub fn control<T: Serialize>(msg: &T) -> Result<Self, serde_json::Error> {
        Ok(ShellperFrame::Control(Bytes::from(serde_json::to_vec(msg)?)))
    }

    pub fn data(bytes: impl Into<Bytes>) -> Self {
        ShellperFrame::Data(bytes.into())
    }

    /// Parse a control frame body. Unknown JSON fields are ignored, which
    /// is what lets old daemons talk to newer holders and vice versa.
    pub fn parse_control<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        match self {
            ShellperFrame::Control(body) => {
                serde_json::from_slice(body).map_err(CodecError::Json)
            }
            ShellperFrame::Data(_) => Err(CodecError::NotControl),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {0} bytes exceeds limit")]
    Oversized(usize),
    #[error("unknown frame tag {0:#04x}")]
    UnknownTag(u8),
    #[error("empty frame")]
    Empty,
    #[error("control frame is not valid json: {0}")]
    Json(#[source] serde_json::Error),
    #[error("expected a control frame, got data")]
    NotControl,
}

/// Length-prefixed codec for [`ShellperFrame`]s.
#[derive(Debug, Default)]
pub struct ShellperCodec;

impl Decoder for ShellperCodec {
    type Item = ShellperFrame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(CodecError::Oversized(len));
        }
        if len == 0 {
            return Err(CodecError::Empty);
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        let mut body = src.split_to(len);
        let tag = body.split_to(1)[0];
        let payload = body.freeze();
        match tag {
            TAG_CONTROL => Ok(Some(ShellperFrame::Control(payload))),
            TAG_DATA => Ok(Some(ShellperFrame::Data(payload))),
            other => Err(CodecError::UnknownTag(other)),
        }
    }
}

impl Encoder<ShellperFrame> for ShellperCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: ShellperFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (tag, payload) = match frame {
            ShellperFrame::Control(b) => (TAG_CONTROL, b),
            ShellperFrame::Data(b) => (TAG_DATA, b),
        };
        let len = payload.len() + 1;
        if len > MAX_FRAME_LEN {
            return Err(CodecError::Oversized(len));
        }
        dst.reserve(4 + len);
        dst.put_u32(len as u32);
        dst.put_u8(tag);
        dst.put_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: ShellperFrame) -> ShellperFrame {
        let mut codec = ShellperCodec;
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn data_frames_survive_the_codec() {
        let decoded = round_trip(ShellperFrame::data(&b"hello\x1b[0m"[..]));
        assert_eq!(decoded, ShellperFrame::Data(Bytes::from_static(b"hello\x1b[0m")));
    }

    #[test]
    fn control_frames_parse_back() {
        let msg = HolderControl::Reconnect {
            expected_pid: 4242,
            expected_start_time: 1_700_000_000,
            restart_policy: Some(RestartPolicy { max_restarts: 3, delay_ms: 500 }),
        };
        let decoded = round_trip(ShellperFrame::control(&msg).unwrap());
        assert_eq!(decoded.parse_control::<HolderControl>().unwrap(), msg);
    }

    #[test]
    fn unknown_control_fields_are_tolerated() {
        let json = br#"{"type":"meta","pid":7,"start_time":9,"socket_path":"/s","future_field":true}"#;
        let frame = ShellperFrame::Control(Bytes::from_static(json));
        let meta = frame.parse_control::<HolderEvent>().unwrap();
        assert_eq!(
            meta,
            HolderEvent::Meta { pid: 7, start_time: 9, socket_path: "/s".to_string() }
        );
    }

    #[test]
    fn partial_reads_yield_none_until_complete() {
        let mut codec = ShellperCodec;
        let mut full = BytesMut::new();
        codec.encode(ShellperFrame::data(&b"abc"[..]), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[3..]);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut codec = ShellperCodec;
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_LEN + 1) as u32);
        buf.put_u8(0x01);
        assert!(matches!(codec.decode(&mut buf), Err(CodecError::Oversized(_))));
    }
}

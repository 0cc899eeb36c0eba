//! Shared types for the spire daemon, shellper holder, and CLI.
//!
//! Everything that crosses a process or socket boundary lives here so the
//! daemon, the holder binary, and the CLI agree on one wire vocabulary:
//! - `[project:]agent` addresses and their resolution errors
//! - the shellper socket protocol (length-prefixed, tagged frames)
//! - the hybrid binary WebSocket framing for terminal bridges
//! - HTTP API request/response bodies and stable error codes

pub mod address;
pub mod api;
pub mod message;
pub mod shellper;
pub mod ws;

pub use address::{parse_address, Address, ResolveErrorKind, RoleKind};
pub use shellper::{HolderControl, HolderEvent, RestartPolicy, ShellperCodec, ShellperFrame};
pub use ws::{ControlFrame, WsFrame, FRAME_CONTROL, FRAME_DATA};

/// Decode a base64url workspace path segment (no padding).
pub fn decode_workspace_segment(segment: &str) -> Result<String, base64::DecodeError> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(segment)?;
    String::from_utf8(bytes).map_err(|_| base64::DecodeError::InvalidByte(0, 0))
}

/// Encode a workspace path as a base64url segment (no padding).
pub fn encode_workspace_segment(path: &str) -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(path.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_segment_round_trip() {
        let paths = ["/home/dev/proj", "/tmp/a b/c", "/weird/päth"];
        for p in paths {
            assert_eq!(decode_workspace_segment(&encode_workspace_segment(p)).unwrap(), p);
        }
    }
}

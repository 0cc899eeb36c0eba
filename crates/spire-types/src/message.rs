//! Structured frames broadcast on the message-bus WebSocket channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One side of a delivered message, as resolved by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEndpoint {
    /// Workspace basename.
    pub project: String,
    /// Agent name within the workspace (role key or `architect`).
    pub agent: String,
}

/// Delivery options echoed into bus frames so subscribers can tell a raw
/// write from a formatted message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default)]
    pub raw: bool,
    #[serde(default)]
    pub no_enter: bool,
    #[serde(default)]
    pub interrupt: bool,
}

/// Frames pushed to `/ws/messages` subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusFrame {
    Message {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<MessageEndpoint>,
        to: MessageEndpoint,
        content: String,
        metadata: MessageMetadata,
        timestamp: DateTime<Utc>,
    },
}

impl BusFrame {
    /// True if this frame involves the given project on either end.
    pub fn touches_project(&self, project: &str) -> bool {
        let BusFrame::Message { from, to, .. } = self;
        to.project == project || from.as_ref().is_some_and(|f| f.project == project)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(from_project: Option<&str>, to_project: &str) -> BusFrame {
        BusFrame::Message {
            from: from_project.map(|p| MessageEndpoint {
                project: p.to_string(),
                agent: "builder-x-1".to_string(),
            }),
            to: MessageEndpoint { project: to_project.to_string(), agent: "architect".to_string() },
            content: "done".to_string(),
            metadata: MessageMetadata::default(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn project_filter_matches_either_end() {
        assert!(frame(Some("alpha"), "beta").touches_project("alpha"));
        assert!(frame(Some("alpha"), "beta").touches_project("beta"));
        assert!(!frame(Some("alpha"), "beta").touches_project("gamma"));
        assert!(!frame(None, "beta").touches_project("alpha"));
    }

    #[test]
    fn wire_shape_has_message_type_tag() {
        let json = serde_json::to_value(frame(None, "beta")).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["to"]["project"], "beta");
        assert!(json.get("from").is_none());
    }
}

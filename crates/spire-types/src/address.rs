//! Symbolic `[project:]agent` addresses.
//!
//! Addresses are what peer tools use to name a terminal without knowing its
//! id: `myproj:architect`, `builder-bugfix-296`, or just `3` (a numeric tail
//! matched against builder keys). Parsing is lossless and case-folding; the
//! actual lookup against live terminals happens in the daemon's resolver.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Parsed form of a `[project:]agent` target string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// Workspace basename, lowercased. `None` means "use the caller's
    /// workspace context".
    pub project: Option<String>,
    /// Agent name, lowercased: `architect`/`arch`, a role key, or a
    /// numeric tail.
    pub agent: String,
}

impl Address {
    pub fn new(project: Option<&str>, agent: &str) -> Self {
        Self {
            project: project.map(|p| p.to_lowercase()),
            agent: agent.to_lowercase(),
        }
    }

    /// True if the agent names the architect role.
    pub fn is_architect(&self) -> bool {
        self.agent == "architect" || self.agent == "arch"
    }

    /// The agent with leading zeros stripped, if it is purely numeric.
    /// Used for tail-matching `builder-bugfix-003` against `3`.
    pub fn numeric_agent(&self) -> Option<String> {
        numeric_key(&self.agent)
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.project {
            Some(p) => write!(f, "{}:{}", p, self.agent),
            None => write!(f, "{}", self.agent),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("empty target address")]
    Empty,
    #[error("address {0:?} has an empty agent part")]
    EmptyAgent(String),
}

/// Parse a `[project:]agent` string. Splits on the first `:`; both halves
/// are lowercased; an empty project half means "unset".
pub fn parse_address(s: &str) -> Result<Address, AddressError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(AddressError::Empty);
    }
    let (project, agent) = match s.split_once(':') {
        Some((p, a)) => {
            let p = p.trim();
            (if p.is_empty() { None } else { Some(p) }, a.trim())
        }
        None => (None, s),
    };
    if agent.is_empty() {
        return Err(AddressError::EmptyAgent(s.to_string()));
    }
    Ok(Address::new(project, agent))
}

/// Strip leading zeros from a purely-numeric key (`"007"` → `"7"`,
/// `"0"` → `"0"`). Returns `None` for non-numeric input.
pub fn numeric_key(s: &str) -> Option<String> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let stripped = s.trim_start_matches('0');
    Some(if stripped.is_empty() { "0".to_string() } else { stripped.to_string() })
}

/// The three kinds of interactive session a workspace can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleKind {
    Architect,
    Builder,
    Shell,
}

impl RoleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleKind::Architect => "architect",
            RoleKind::Builder => "builder",
            RoleKind::Shell => "shell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "architect" => Some(RoleKind::Architect),
            "builder" => Some(RoleKind::Builder),
            "shell" => Some(RoleKind::Shell),
            _ => None,
        }
    }
}

impl std::fmt::Display for RoleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an address failed to resolve to a live terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolveErrorKind {
    /// No workspace or agent matched.
    NotFound,
    /// More than one workspace or agent matched.
    Ambiguous,
    /// The address had no project and the caller supplied no workspace.
    NoContext,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_project_and_agent() {
        let a = parse_address("MyProj:Architect").unwrap();
        assert_eq!(a.project.as_deref(), Some("myproj"));
        assert_eq!(a.agent, "architect");
        assert!(a.is_architect());
    }

    #[test]
    fn parses_bare_agent() {
        let a = parse_address("builder-bugfix-296").unwrap();
        assert_eq!(a.project, None);
        assert_eq!(a.agent, "builder-bugfix-296");
        assert!(!a.is_architect());
    }

    #[test]
    fn empty_project_half_means_unset() {
        let a = parse_address(":shell-1").unwrap();
        assert_eq!(a.project, None);
        assert_eq!(a.agent, "shell-1");
    }

    #[test]
    fn rejects_empty_agent() {
        assert!(parse_address("proj:").is_err());
        assert!(parse_address("").is_err());
        assert!(parse_address("   ").is_err());
    }

    #[test]
    fn format_parse_round_trip() {
        for (project, agent) in [(Some("myproj"), "architect"), (None, "shell-2"), (Some("a"), "7")] {
            let a = Address::new(project, agent);
            assert_eq!(parse_address(&a.to_string()).unwrap(), a);
        }
    }

    #[test]
    fn numeric_keys_strip_leading_zeros() {
        assert_eq!(numeric_key("007"), Some("7".to_string()));
        assert_eq!(numeric_key("0"), Some("0".to_string()));
        assert_eq!(numeric_key("296"), Some("296".to_string()));
        assert_eq!(numeric_key("bugfix"), None);
        assert_eq!(numeric_key(""), None);
    }
}

//! Address resolution: `[project:]agent` → a live terminal id.
//!
//! Resolution is a pure function of the registry contents; the same
//! entries and inputs always produce the same answer.

use crate::registry::WorkspaceEntry;
use crate::paths::workspace_basename;
use spire_types::address::{Address, ResolveErrorKind};
use spire_types::RoleKind;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A successfully resolved target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub terminal_id: String,
    pub workspace: PathBuf,
    /// The canonical agent name (`architect` or the matched role key).
    pub agent: String,
    pub role: RoleKind,
}

/// A failed resolution with enough detail for a useful HTTP error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveFailure {
    pub kind: ResolveErrorKind,
    pub message: String,
    pub candidates: Vec<String>,
}

impl ResolveFailure {
    fn not_found(message: impl Into<String>, candidates: Vec<String>) -> Self {
        Self { kind: ResolveErrorKind::NotFound, message: message.into(), candidates }
    }

    fn ambiguous(message: impl Into<String>, candidates: Vec<String>) -> Self {
        Self { kind: ResolveErrorKind::Ambiguous, message: message.into(), candidates }
    }
}

/// Resolve a parsed address against the registry.
///
/// With a project, workspaces are matched by lowercased basename; without
/// one the fallback workspace is required. Within the workspace the agent
/// is matched as architect, then exact role key (builders before shells),
/// then numeric tail against builder keys.
pub fn resolve_target(
    entries: &HashMap<PathBuf, WorkspaceEntry>,
    address: &Address,
    fallback_workspace: Option<&Path>,
) -> Result<ResolvedTarget, ResolveFailure> {
    let workspace = match &address.project {
        Some(project) => {
            let matches: Vec<&PathBuf> =
                entries.keys().filter(|path| workspace_basename(path) == *project).collect();
            match matches.len() {
                0 => {
                    return Err(ResolveFailure::not_found(
                        format!("no active workspace named {:?}", project),
                        entries.keys().map(|p| workspace_basename(p)).collect(),
                    ))
                }
                1 => matches[0].clone(),
                _ => {
                    return Err(ResolveFailure::ambiguous(
                        format!("workspace name {:?} matches several paths", project),
                        matches.iter().map(|p| p.display().to_string()).collect(),
                    ))
                }
            }
        }
        None => match fallback_workspace {
            Some(path) => path.to_path_buf(),
            None => {
                return Err(ResolveFailure {
                    kind: ResolveErrorKind::NoContext,
                    message: format!(
                        "target {:?} has no project and no workspace context was given",
                        address.agent
                    ),
                    candidates: Vec::new(),
                })
            }
        },
    };

    let Some(entry) = entries.get(&workspace) else {
        return Err(ResolveFailure::not_found(
            format!("workspace {} has no active terminals", workspace.display()),
            Vec::new(),
        ));
    };

    if address.is_architect() {
        return match &entry.architect {
            Some(id) => Ok(ResolvedTarget {
                terminal_id: id.clone(),
                workspace,
                agent: "architect".to_string(),
                role: RoleKind::Architect,
            }),
            None => Err(ResolveFailure::not_found(
                format!("workspace {} has no architect terminal", workspace.display()),
                all_keys(entry),
            )),
        };
    }

    if let Some(id) = entry.builders.get(&address.agent) {
        return Ok(ResolvedTarget {
            terminal_id: id.clone(),
            workspace,
            agent: address.agent.clone(),
            role: RoleKind::Builder,
        });
    }
    if let Some(id) = entry.shells.get(&address.agent) {
        return Ok(ResolvedTarget {
            terminal_id: id.clone(),
            workspace,
            agent: address.agent.clone(),
            role: RoleKind::Shell,
        });
    }

    if let Some(stripped) = address.numeric_agent() {
        let suffix = format!("-{}", stripped);
        let matches: Vec<(&String, &String)> =
            entry.builders.iter().filter(|(key, _)| key.ends_with(&suffix)).collect();
        match matches.len() {
            1 => {
                let (key, id) = matches[0];
                return Ok(ResolvedTarget {
                    terminal_id: id.clone(),
                    workspace,
                    agent: key.clone(),
                    role: RoleKind::Builder,
                });
            }
            n if n >= 2 => {
                return Err(ResolveFailure::ambiguous(
                    format!("agent {:?} matches several builders", address.agent),
                    matches.into_iter().map(|(key, _)| key.clone()).collect(),
                ))
            }
            _ => {}
        }
    }

    Err(ResolveFailure::not_found(
        format!("no agent {:?} in workspace {}", address.agent, workspace.display()),
        all_keys(entry),
    ))
}

fn all_keys(entry: &WorkspaceEntry) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    if entry.architect.is_some() {
        keys.push("architect".to_string());
    }
    keys.extend(entry.builders.keys().cloned());
    keys.extend(entry.shells.keys().cloned());
    keys
}

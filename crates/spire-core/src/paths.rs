//! Workspace path handling and small OS helpers.

use crate::error::SpireError;
use std::path::{Path, PathBuf};

/// Resolve a workspace path through realpath so symlinked spellings of the
/// same directory collapse to one registry key.
pub fn canonicalize_workspace(path: &Path) -> Result<PathBuf, SpireError> {
    std::fs::canonicalize(path).map_err(|e| {
        SpireError::InvalidParams(format!("workspace {} is not accessible: {}", path.display(), e))
    })
}

/// True when a path lives under the OS temp root (or its realpath twin).
/// Temp workspaces may exist in memory but are never persisted.
pub fn is_temp_path(path: &Path) -> bool {
    let mut roots = vec![std::env::temp_dir()];
    if let Ok(real) = std::fs::canonicalize(std::env::temp_dir()) {
        roots.push(real);
    }
    // macOS resolves /tmp to /private/tmp; cover both spellings.
    roots.push(PathBuf::from("/tmp"));
    roots.push(PathBuf::from("/private/tmp"));
    roots.push(PathBuf::from("/var/folders"));
    roots.push(PathBuf::from("/private/var/folders"));
    roots.iter().any(|root| path.starts_with(root))
}

/// Lowercased basename of a workspace path, the "project" half of an
/// address.
pub fn workspace_basename(path: &Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().to_lowercase()).unwrap_or_default()
}

/// Probe whether a pid is alive (signal 0).
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// Ask a process to terminate.
#[cfg(unix)]
pub fn send_sigterm(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
}

#[cfg(unix)]
pub fn send_sigkill(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
}

/// SIGTERM a PTY child's whole process group (the child is its session
/// leader), falling back to the single pid.
#[cfg(unix)]
pub fn send_sigterm_group(pid: u32) {
    unsafe {
        if libc::killpg(pid as i32, libc::SIGTERM) != 0 {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
}

#[cfg(unix)]
pub fn send_sigkill_group(pid: u32) {
    unsafe {
        if libc::killpg(pid as i32, libc::SIGKILL) != 0 {
            libc::kill(pid as i32, libc::SIGKILL);
        }
    }
}

/// Compare two secrets without leaking the mismatch position through
/// timing. Length differences still fold into the result.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let mut diff = (a.len() ^ b.len()) as u8;
    let n = a.len().min(b.len());
    for i in 0..n {
        diff |= a[i] ^ b[i];
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_dirs_are_detected() {
        assert!(is_temp_path(&std::env::temp_dir().join("spire-x")));
        assert!(is_temp_path(Path::new("/tmp/session")));
        assert!(!is_temp_path(Path::new("/home/dev/project")));
    }

    #[test]
    fn basename_lowercases() {
        assert_eq!(workspace_basename(Path::new("/home/dev/MyProj")), "myproj");
        assert_eq!(workspace_basename(Path::new("/")), "");
    }

    #[test]
    fn constant_time_eq_behaves() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secret2"));
        assert!(!constant_time_eq(b"secret", b"Secret"));
        assert!(!constant_time_eq(b"", b"x"));
        assert!(constant_time_eq(b"", b""));
    }
}

//! Git HEAD/dirty snapshotting for the turn loop's `gitinfo` messages
//! (spec: before/after a turn, if the repo's state changed, persist a
//! `gitinfo` message so the UI can show it without it ever reaching the
//! model's context).

use std::path::Path;
use tokio::process::Command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitSnapshot {
    pub head_sha: Option<String>,
    pub dirty: bool,
}

/// `None` if `cwd` is not inside a git repository (or `git` isn't on
/// `PATH`); a snapshot with `head_sha: None` if it's a repo with no
/// commits yet.
pub async fn snapshot(cwd: &Path) -> Option<GitSnapshot> {
    let head = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(cwd)
        .output()
        .await
        .ok()?;

    if !head.status.success() {
        // Either not a repo, or a repo with no commits; `git status`
        // still distinguishes the two.
        let status = Command::new("git")
            .args(["status", "--porcelain"])
            .current_dir(cwd)
            .output()
            .await
            .ok()?;
        if !status.status.success() {
            return None;
        }
        return Some(GitSnapshot {
            head_sha: None,
            dirty: !status.stdout.is_empty(),
        });
    }

    let head_sha = String::from_utf8_lossy(&head.stdout).trim().to_string();

    let status = Command::new("git")
        .args(["status", "--porcelain"])
        .current_dir(cwd)
        .output()
        .await
        .ok()?;
    let dirty = status.status.success() && !status.stdout.is_empty();

    Some(GitSnapshot {
        head_sha: Some(head_sha),
        dirty,
    })
}

/// A short human-readable summary for the `gitinfo` message's display text.
pub fn summarize(before: Option<&GitSnapshot>, after: &GitSnapshot) -> String {
    let short = |sha: &str| sha.get(..7).unwrap_or(sha).to_string();
    let head = after.head_sha.as_deref().map(short).unwrap_or_else(|| "(no commits)".to_string());
    let dirty_note = if after.dirty { "working tree dirty" } else { "working tree clean" };

    match before {
        Some(b) if b.head_sha != after.head_sha => {
            format!("HEAD moved to {head}, {dirty_note}")
        }
        _ => format!("HEAD at {head}, {dirty_note}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summarize_mentions_dirty_state() {
        let after = GitSnapshot { head_sha: Some("abcdef0123".to_string()), dirty: true };
        let summary = summarize(None, &after);
        assert!(summary.contains("abcdef0"));
        assert!(summary.contains("dirty"));
    }

    #[test]
    fn summarize_notes_head_move() {
        let before = GitSnapshot { head_sha: Some("aaaaaaa111".to_string()), dirty: false };
        let after = GitSnapshot { head_sha: Some("bbbbbbb222".to_string()), dirty: false };
        let summary = summarize(Some(&before), &after);
        assert!(summary.contains("moved"));
    }
}

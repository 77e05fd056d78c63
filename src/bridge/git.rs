//! Git checkpoints for documentation changes
//!
//! Every apply and rollback becomes a commit in the documentation
//! repository. Metadata is written as `Key: value` trailers.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info};

use super::VersionControl;

pub struct GitVersionControl {
    repo_dir: PathBuf,
}

impl GitVersionControl {
    /// Use the repository at `repo_dir`, initialising one if needed
    pub async fn open(repo_dir: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(&repo_dir)
            .await
            .with_context(|| format!("Failed to create {}", repo_dir.display()))?;
        let vcs = Self { repo_dir };

        if vcs.git(&["rev-parse", "--is-inside-work-tree"]).await.is_err() {
            vcs.git(&["init", "--quiet"]).await?;
            info!("Initialised documentation repository at {}", vcs.repo_dir.display());
        }
        if vcs.git(&["config", "user.email"]).await.is_err() {
            vcs.git(&["config", "user.name", "creative-evolve"]).await?;
            vcs.git(&["config", "user.email", "creative-evolve@localhost"]).await?;
        }
        Ok(vcs)
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_dir)
            .output()
            .await
            .context("Failed to run git")?;

        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Commit message body with one trailer per metadata entry
pub fn format_message(message: &str, metadata: &BTreeMap<String, String>) -> String {
    let mut text = message.trim().to_string();
    if !metadata.is_empty() {
        text.push_str("\n\n");
        let trailers: Vec<String> = metadata
            .iter()
            .map(|(key, value)| format!("{}: {}", key, value.replace('\n', " ")))
            .collect();
        text.push_str(&trailers.join("\n"));
    }
    text
}

#[async_trait::async_trait]
impl VersionControl for GitVersionControl {
    async fn commit(&self, message: &str, metadata: &BTreeMap<String, String>) -> Result<String> {
        self.git(&["add", "--all", "--", "."]).await?;
        let full_message = format_message(message, metadata);
        self.git(&["commit", "--quiet", "--allow-empty", "-m", &full_message]).await?;
        let id = self.git(&["rev-parse", "HEAD"]).await?;
        debug!(commit = %id, "Documentation checkpoint");
        Ok(id)
    }

    async fn revert(&self, commit_id: &str) -> Result<()> {
        self.git(&["revert", "--no-edit", commit_id]).await?;
        info!("Reverted documentation commit {}", commit_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[test]
    fn test_format_message_trailers() {
        let mut metadata = BTreeMap::new();
        metadata.insert("Tool".to_string(), "apply_fill".to_string());
        metadata.insert("Improvement-Id".to_string(), "IMP-1".to_string());
        let text = format_message("Apply improvement IMP-1", &metadata);
        assert_eq!(text, "Apply improvement IMP-1\n\nImprovement-Id: IMP-1\nTool: apply_fill");
    }

    #[tokio::test]
    async fn test_commit_and_revert() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let vcs = GitVersionControl::open(dir.path().to_path_buf()).await.unwrap();
        let file = dir.path().join("apply_fill.md");

        std::fs::write(&file, "v1\n").unwrap();
        vcs.commit("first", &BTreeMap::new()).await.unwrap();
        std::fs::write(&file, "v2\n").unwrap();
        let second = vcs.commit("second", &BTreeMap::new()).await.unwrap();
        assert_eq!(second.len(), 40);

        vcs.revert(&second).await.unwrap();
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "v1\n");
    }
}

use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;

use anyhow::{Context, bail};
use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;

use crate::error::DeployError;

/// File that must sit at the root of a cloned repository.
pub const BUILD_DESCRIPTOR: &str = "Dockerfile";

static REPO_URL: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| {
    Regex::new(r"^https://github\.com/([A-Za-z0-9_.-]+)/([A-Za-z0-9_.-]+?)(?:\.git)?$")
});

/// Accepts `https://github.com/<owner>/<repo>` with an optional `.git`.
/// Names are ASCII and never made of dots alone.
pub fn validate_url(url: &str) -> Result<(), DeployError> {
    let valid = REPO_URL
        .as_ref()
        .ok()
        .and_then(|pattern| pattern.captures(url))
        .is_some_and(|caps| {
            caps.iter()
                .skip(1)
                .flatten()
                .all(|name| !name.as_str().chars().all(|c| c == '.'))
        });
    if valid {
        Ok(())
    } else {
        Err(DeployError::InvalidUrl {
            url: url.to_string(),
        })
    }
}

/// Fetches a repository's contents into an existing, empty directory.
#[async_trait]
pub trait RepoFetcher: Send + Sync {
    async fn fetch(&self, url: &str, dest: &Path) -> anyhow::Result<()>;
}

/// Shallow clone through the `git` binary.
#[derive(Debug, Default, Clone)]
pub struct GitCli;

#[async_trait]
impl RepoFetcher for GitCli {
    async fn fetch(&self, url: &str, dest: &Path) -> anyhow::Result<()> {
        let output = Command::new("git")
            .args(["clone", "--depth", "1", "--", url])
            .arg(dest)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .context("failed to spawn git")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "git clone exited with {}: {}",
                output.status,
                stderr.trim()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_and_dot_git_urls() {
        assert!(validate_url("https://github.com/acme/web-app").is_ok());
        assert!(validate_url("https://github.com/acme/web_app.v2.git").is_ok());
    }

    #[test]
    fn rejects_other_shapes() {
        for url in [
            "http://github.com/acme/app",
            "https://gitlab.com/acme/app",
            "https://github.com/acme",
            "https://github.com/acme/app/tree/main",
            "https://github.com/acme/app; rm -rf /",
            "git@github.com:acme/app.git",
            "https://github.com/../app",
            "https://github.com/acme/..",
            "https://github.com/./app",
            "https://github.com/acme/...git",
            "https://github.com/acmé/app",
            "https://github.com/acme/приложение",
            "",
        ] {
            assert!(
                matches!(validate_url(url), Err(DeployError::InvalidUrl { .. })),
                "{url} should be rejected"
            );
        }
    }
}

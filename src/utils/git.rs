//! Thin async wrapper around the `git` executable.

use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;

use regex::RegexSet;
use tokio::process::Command;

use crate::error::{AppError, Result};

/// Runs git subcommands for one bucket.
///
/// Children are killed when the returned future is dropped, so a cancelled
/// crawl does not leave a clone running in the background.
#[derive(Debug, Clone)]
pub struct Git {
    program: String,
}

impl Git {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Run `git <args>` (in `dir` when given) and return stdout.
    ///
    /// A non-zero exit is classified with [`classify_failure`].
    pub async fn run(&self, bucket_id: &str, dir: Option<&Path>, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }

        log::debug!("[{}] git {}", bucket_id, args.join(" "));
        let output = cmd.output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(bucket_id, args, stderr.trim()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn transient_patterns() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        RegexSet::new([
            r"(?i)could not resolve host",
            r"(?i)connection (timed out|reset|refused)",
            r"(?i)operation timed out",
            r"(?i)early eof",
            r"(?i)rpc failed",
            r"(?i)remote end hung up",
            r"(?i)returned error: (429|5\d\d)",
            r"(?i)gnutls_handshake|ssl_read|ssl_connect",
        ])
        .unwrap_or_else(|_| RegexSet::empty())
    })
}

/// Map git's stderr to the error taxonomy.
///
/// Network hiccups are transient; everything else (missing repository or
/// branch, revoked access, corrupt clone) makes the bucket unavailable.
pub fn classify_failure(bucket_id: &str, args: &[&str], stderr: &str) -> AppError {
    let command = args.first().copied().unwrap_or("git");
    let message = format!("git {command} failed: {stderr}");
    if transient_patterns().is_match(stderr) {
        AppError::transient(format!("[{bucket_id}] {message}"))
    } else {
        AppError::unavailable(bucket_id, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_failures_are_transient() {
        for stderr in [
            "fatal: unable to access 'https://github.com/a/b/': Could not resolve host: github.com",
            "error: RPC failed; curl 56 OpenSSL SSL_read: Connection was reset",
            "fatal: early EOF",
            "fatal: unable to access 'x': The requested URL returned error: 502",
        ] {
            assert!(
                classify_failure("a/b", &["clone"], stderr).is_transient(),
                "{stderr}"
            );
        }
    }

    #[test]
    fn test_missing_repo_or_branch_is_unavailable() {
        for stderr in [
            "remote: Repository not found.\nfatal: repository 'https://github.com/a/b/' not found",
            "warning: Could not find remote branch dev to clone.\nfatal: Remote branch dev not found in upstream origin",
            "fatal: could not read Username for 'https://github.com': terminal prompts disabled",
        ] {
            let err = classify_failure("a/b", &["clone"], stderr);
            assert!(matches!(err, AppError::CrawlUnavailable { .. }), "{stderr}");
        }
    }
}

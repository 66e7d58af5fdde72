//! Shell command execution for test and qa stages

use std::path::Path;
use std::time::Duration;

/// Result of running a stage command
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandResult {
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }

    /// Tail of the combined output, for report excerpts
    pub fn log_excerpt(&self, max_chars: usize) -> String {
        let combined = if self.stderr.trim().is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        };
        let trimmed = combined.trim();
        if trimmed.len() <= max_chars {
            trimmed.to_string()
        } else {
            let start = trimmed.len() - max_chars;
            // Snap to a char boundary
            let start = (start..trimmed.len()).find(|i| trimmed.is_char_boundary(*i)).unwrap_or(start);
            format!("...{}", &trimmed[start..])
        }
    }
}

/// Run a shell command in a working directory with a timeout
pub async fn run_command(command: &str, workdir: &Path, timeout: Duration) -> eyre::Result<CommandResult> {
    let start = std::time::Instant::now();

    let output = tokio::time::timeout(
        timeout,
        tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(workdir)
            .output(),
    )
    .await
    .map_err(|_| eyre::eyre!("Command timed out after {:?}: {}", timeout, command))??;

    Ok(CommandResult {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_command_success() {
        let temp = tempdir().unwrap();
        let result = run_command("echo ok", temp.path(), Duration::from_secs(30)).await.unwrap();

        assert_eq!(result.exit_code, 0);
        assert!(result.passed());
        assert!(result.stdout.contains("ok"));
    }

    #[tokio::test]
    async fn test_command_failure() {
        let temp = tempdir().unwrap();
        let result = run_command("exit 3", temp.path(), Duration::from_secs(30)).await.unwrap();

        assert_eq!(result.exit_code, 3);
        assert!(!result.passed());
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let temp = tempdir().unwrap();
        let result = run_command("sleep 10", temp.path(), Duration::from_millis(100)).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_log_excerpt_truncation() {
        let result = CommandResult {
            exit_code: 1,
            stdout: "x".repeat(100),
            stderr: String::new(),
            duration_ms: 1,
        };
        let excerpt = result.log_excerpt(10);
        assert!(excerpt.starts_with("..."));
        assert_eq!(excerpt.len(), 13);
    }
}

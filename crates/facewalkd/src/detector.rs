//! Face detector contract and the external-program implementation.

use async_trait::async_trait;
use facewalk_core::Detection;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("failed to start detector {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("detector I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("detector exited with {status}: {stderr}")]
    Exit {
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("detector output is not a detection list: {0}")]
    Decode(#[from] serde_json::Error),
}

#[async_trait]
pub trait Detector: Send + Sync {
    /// Detect every face in one encoded image.
    async fn detect(&self, image: &[u8]) -> Result<Vec<Detection>, DetectError>;
}

/// Runs a program per image: encoded bytes on stdin, a JSON array of
/// detections on stdout.
pub struct CommandDetector {
    program: String,
    args: Vec<String>,
}

impl CommandDetector {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a whitespace-separated command line. Returns `None` when empty.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl Detector for CommandDetector {
    async fn detect(&self, image: &[u8]) -> Result<Vec<Detection>, DetectError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DetectError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        // Feed stdin concurrently so a chatty child cannot deadlock on a full stdout pipe.
        let stdin = child.stdin.take();
        let bytes = image.to_vec();
        let feeder = tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&bytes).await?;
                stdin.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        });

        let output = child.wait_with_output().await?;
        if let Ok(Err(e)) = feeder.await {
            tracing::debug!(program = %self.program, error = %e, "detector closed stdin early");
        }

        if !output.status.success() {
            return Err(DetectError::Exit {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> CommandDetector {
        CommandDetector::new("sh", vec!["-c".into(), script.into()])
    }

    #[test]
    fn test_from_command_line() {
        let d = CommandDetector::from_command_line("  /usr/bin/detect --model small ").unwrap();
        assert_eq!(d.program(), "/usr/bin/detect");
        assert_eq!(d.args, vec!["--model", "small"]);
        assert!(CommandDetector::from_command_line("   ").is_none());
    }

    #[tokio::test]
    async fn test_parses_detections() {
        let d = shell(
            r#"cat > /dev/null; echo '[{"imageWidth":100,"imageHeight":100,"box":{"x":10,"y":10,"width":20,"height":20},"alignedBox":{"x":12,"y":12,"width":16,"height":16},"score":0.9,"embedding":[0.1,0.2]}]'"#,
        );
        let detections = d.detect(b"image bytes").await.unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].embedding, vec![0.1, 0.2]);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_error() {
        let d = shell("cat > /dev/null; echo 'model missing' >&2; exit 3");
        match d.detect(b"x").await {
            Err(DetectError::Exit { stderr, .. }) => assert_eq!(stderr, "model missing"),
            other => panic!("expected exit error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_garbage_output_is_error() {
        let d = shell("cat > /dev/null; echo nope");
        assert!(matches!(d.detect(b"x").await, Err(DetectError::Decode(_))));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let d = CommandDetector::new("/nonexistent/facewalk-detector", vec![]);
        assert!(matches!(d.detect(b"x").await, Err(DetectError::Spawn { .. })));
    }
}

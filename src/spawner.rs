//! Compiler subprocess spawning.
//!
//! The session only needs a pair of byte streams and (optionally) a child
//! process handle; how those are produced is behind [`CompilerSpawner`] so
//! tests can substitute an in-process compiler.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

/// Byte streams connecting the host to one compiler process.
pub struct CompilerIo {
    /// Compiler → host stream (the subprocess's stdout).
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Host → compiler stream (the subprocess's stdin).
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    /// Present when the connection is backed by a real subprocess.
    pub child: Option<Child>,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different compiler spawn strategies.
pub trait CompilerSpawner: Send + Sync {
    fn spawn(&self) -> Result<CompilerIo, SpawnError>;
}

/// Spawns the Dart Sass binary in embedded mode.
///
/// stdin/stdout carry the protocol; stderr is inherited. The child is killed
/// if the session is dropped without a clean close.
pub struct EmbeddedSassSpawner {
    binary: PathBuf,
}

impl EmbeddedSassSpawner {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &PathBuf {
        &self.binary
    }
}

impl Default for EmbeddedSassSpawner {
    fn default() -> Self {
        Self::new("sass")
    }
}

impl CompilerSpawner for EmbeddedSassSpawner {
    fn spawn(&self) -> Result<CompilerIo, SpawnError> {
        let mut child = Command::new(&self.binary)
            .arg("--embedded")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("stdout not captured".to_string()))?;

        tracing::debug!(binary = %self.binary.display(), "spawned embedded compiler");

        Ok(CompilerIo {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            child: Some(child),
        })
    }
}

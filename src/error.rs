//! Error taxonomy for the host.

use crate::bridge::protocol::CompileFailure;

/// Errors surfaced by [`crate::Transpiler`] operations.
///
/// `Compile` is scoped to one call and leaves the session healthy. `Protocol`
/// and `ConnectionClosed` are fatal to the session: every outstanding call
/// fails with them and the session must be replaced. The invalid-state
/// variants are local and synchronous.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// The compiler rejected this call's source.
    #[error("compile failed: {0}")]
    Compile(CompileFailure),

    /// Malformed or unexpected traffic on the connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The subprocess exited or its streams closed.
    #[error("connection to the compiler is closed")]
    ConnectionClosed,

    /// The compiler subprocess could not be started.
    #[error("failed to start compiler: {0}")]
    Spawn(String),

    /// Execute or version called while the session is not running.
    #[error("session is not running")]
    NotRunning,

    /// Close called more than once.
    #[error("session already closed")]
    AlreadyClosed,
}

impl Error {
    /// True for failures scoped to a single compile call.
    pub fn is_compile_failure(&self) -> bool {
        matches!(self, Self::Compile(_))
    }
}

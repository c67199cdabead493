//! sass-embedded-host: concurrent client for an embedded Sass compiler subprocess.
//!
//! One [`Transpiler`] wraps one long-lived compiler process and may be shared
//! by arbitrarily many concurrent callers; compile calls are multiplexed over
//! the single connection and correlated back by compile id.

pub mod bridge;

mod error;
mod importer;
mod session;
mod spawner;
mod transpiler;

#[cfg(test)]
mod fake_compiler;

pub use bridge::protocol::{
    CompileFailure, CompileId, LogLevel, OutputStyle, SourceSyntax, VersionInfo,
};
pub use error::Error;
pub use importer::{ImportError, ImportResolver};
pub use spawner::{CompilerIo, CompilerSpawner, EmbeddedSassSpawner, SpawnError};
pub use transpiler::{CompileArgs, CompileOutput, Options, Transpiler};

//! Wire protocol types for host-compiler communication.
//!
//! Every envelope is an internally tagged JSON object. Inbound envelopes
//! carry the compile id of the call they belong to, except process-level
//! protocol errors, which may carry none and are fatal to the whole session.

use serde::{Deserialize, Serialize};

/// Identifier correlating frames to one in-flight compile call.
///
/// Allocated from a per-session counter; never reused while the call is
/// still outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompileId(u32);

impl CompileId {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for CompileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the compiler should format emitted CSS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStyle {
    #[default]
    Expanded,
    Compressed,
}

/// Syntax the source text is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceSyntax {
    #[default]
    Scss,
    /// Indentation-based Sass syntax.
    Indented,
    Css,
}

/// Severity of a compiler log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Warning,
    Deprecation,
}

/// Messages from host to compiler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    CompileRequest {
        id: CompileId,
        source: String,
        syntax: SourceSyntax,
        style: OutputStyle,
        #[serde(skip_serializing_if = "Option::is_none")]
        precision: Option<u32>,
        source_map: bool,
        /// Whether the host has an import resolver registered for this call.
        importer: bool,
    },

    CanonicalizeResponse {
        id: CompileId,
        request_id: u32,
        /// Canonical URL; absent means "not handled" and the compiler falls
        /// back to its own resolution.
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    ImportResponse {
        id: CompileId,
        request_id: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        contents: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    VersionRequest {
        id: CompileId,
    },
}

/// Messages from compiler to host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    CompileResponse {
        id: CompileId,
        outcome: CompileOutcome,
    },

    /// Mid-compile callback: resolve an import URL as written in the source.
    CanonicalizeRequest {
        id: CompileId,
        request_id: u32,
        url: String,
    },

    /// Mid-compile callback: load the contents of a canonicalized URL.
    ImportRequest {
        id: CompileId,
        request_id: u32,
        url: String,
    },

    VersionResponse {
        id: CompileId,
        compiler_version: String,
        protocol_version: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        implementation: Option<String>,
    },

    LogEvent {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<CompileId>,
        level: LogLevel,
        message: String,
    },

    /// Malformed or unexpected traffic. Fatal to the session; an absent id
    /// means the failure is not attributable to any one call.
    ProtocolError {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<CompileId>,
        message: String,
    },
}

/// Terminal result of one compile call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CompileOutcome {
    Success(CompileSuccess),
    Failure(CompileFailure),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileSuccess {
    pub css: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_map: Option<String>,
}

/// Compiler-reported failure for one call (bad syntax, unresolved import, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileFailure {
    pub message: String,
    /// Source span the compiler attributes the failure to, when it has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
}

impl CompileFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            span: None,
        }
    }
}

impl std::fmt::Display for CompileFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.span {
            Some(span) => write!(f, "{} at {}", self.message, span),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Compiler identity reported by a version response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub compiler_version: String,
    pub protocol_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub implementation: Option<String>,
}

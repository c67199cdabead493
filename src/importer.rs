//! Import resolution bridge.
//!
//! The compiler calls back into the host mid-compile to resolve `@import`/
//! `@use` URLs. The resolver runs synchronously on the receive loop: a
//! resolver that blocks stalls delivery for every outstanding compile call,
//! since there is one receive loop per session.

use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::bridge::protocol::{CompileId, OutboundMessage};

/// Caller-supplied capability resolving import URLs to canonical URLs and to
/// source text. Registered per compile call; invoked only for callbacks whose
/// compile id matches that call.
pub trait ImportResolver: Send + Sync {
    /// Resolve an import URL as written in the source. `None` means "not
    /// handled": the compiler falls back to its own resolution.
    fn canonicalize(&self, url: &str) -> Option<String>;

    /// Load the contents of a previously canonicalized URL.
    fn load(&self, canonical_url: &str) -> Result<String, ImportError>;
}

/// Failure loading an import's contents.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ImportError {
    message: String,
}

impl ImportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Build the reply to a canonicalize callback.
///
/// Resolver failures degrade to an error reply for this call only; they are
/// never allowed to take the session down.
pub(crate) fn canonicalize_reply(
    resolver: Option<&dyn ImportResolver>,
    id: CompileId,
    request_id: u32,
    url: &str,
) -> OutboundMessage {
    let (canonical, error) = match resolver {
        None => (None, None),
        Some(resolver) => match catch_unwind(AssertUnwindSafe(|| resolver.canonicalize(url))) {
            Ok(None) => (None, None),
            Ok(Some(canonical)) if is_well_formed(&canonical) => (Some(canonical), None),
            Ok(Some(canonical)) => {
                tracing::warn!(%id, %url, returned = %canonical, "resolver returned malformed canonical url");
                (
                    None,
                    Some(format!("resolver returned malformed canonical url {:?}", canonical)),
                )
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::warn!(%id, %url, %message, "resolver panicked during canonicalize");
                (None, Some(format!("canonicalize panicked: {}", message)))
            }
        },
    };

    OutboundMessage::CanonicalizeResponse {
        id,
        request_id,
        url: canonical,
        error,
    }
}

/// Build the reply to an import callback.
pub(crate) fn import_reply(
    resolver: Option<&dyn ImportResolver>,
    id: CompileId,
    request_id: u32,
    url: &str,
) -> OutboundMessage {
    let (contents, error) = match resolver {
        None => (
            None,
            Some(format!("no import resolver registered for {}", url)),
        ),
        Some(resolver) => match catch_unwind(AssertUnwindSafe(|| resolver.load(url))) {
            Ok(Ok(contents)) => (Some(contents), None),
            Ok(Err(e)) => (None, Some(e.to_string())),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::warn!(%id, %url, %message, "resolver panicked during load");
                (None, Some(format!("load panicked: {}", message)))
            }
        },
    };

    OutboundMessage::ImportResponse {
        id,
        request_id,
        contents,
        error,
    }
}

/// Canonical URLs travel back through the protocol verbatim; reject anything
/// that cannot survive that trip.
fn is_well_formed(url: &str) -> bool {
    !url.is_empty() && !url.chars().any(|c| c.is_whitespace() || c.is_control())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

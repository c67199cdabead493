//! Wire protocol between the host and the embedded compiler.
//!
//! # Architecture
//!
//! - **protocol**: Message envelopes (OutboundMessage/InboundMessage) tagged
//!   with the originating compile id
//! - **codec**: length-prefixed JSON framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;

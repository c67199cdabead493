//! Scripted in-process compiler for tests.
//!
//! Speaks the compiler side of the wire protocol over an in-memory duplex
//! stream. Compilation is a stand-in, not Sass: imports go through the real
//! canonicalize/import round trip and the loaded contents are spliced into
//! the source, undefined `$variables` fail the call, and the (optionally
//! whitespace-stripped) source comes back as the CSS. Scripted entries
//! override exact sources for scenario tests.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{
    CompileFailure, CompileId, CompileOutcome, CompileSuccess, InboundMessage, LogLevel,
    OutboundMessage, OutputStyle,
};
use crate::spawner::{CompilerIo, CompilerSpawner, SpawnError};

const FAKE_PROTOCOL_VERSION: &str = "1.0.0";

pub(crate) fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Clone)]
pub(crate) struct FakeCompiler {
    scripted: Vec<(String, CompileOutcome)>,
    hold: usize,
    silent: bool,
    stray_response: bool,
    poison_message: Option<String>,
    log_event: Option<(LogLevel, String)>,
    compiler_version: String,
}

impl FakeCompiler {
    pub(crate) fn new() -> Self {
        Self {
            scripted: Vec::new(),
            hold: 0,
            silent: false,
            stray_response: false,
            poison_message: None,
            log_event: None,
            compiler_version: "1.62.0".to_string(),
        }
    }

    /// Canned response for an exact source match.
    pub(crate) fn script(mut self, source: impl Into<String>, outcome: CompileOutcome) -> Self {
        self.scripted.push((source.into(), outcome));
        self
    }

    pub(crate) fn script_css(self, source: impl Into<String>, css: impl Into<String>) -> Self {
        self.script(
            source,
            CompileOutcome::Success(CompileSuccess {
                css: css.into(),
                source_map: None,
            }),
        )
    }

    /// Buffer the first `n` compile responses, then send them in reverse
    /// arrival order.
    pub(crate) fn hold_responses(mut self, n: usize) -> Self {
        self.hold = n;
        self
    }

    /// Never answer compile requests.
    pub(crate) fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    /// Send a compile response for an id nobody allocated before the first
    /// real response.
    pub(crate) fn stray_response(mut self) -> Self {
        self.stray_response = true;
        self
    }

    /// Answer the first compile request with a protocol error.
    pub(crate) fn poison(mut self, message: impl Into<String>) -> Self {
        self.poison_message = Some(message.into());
        self
    }

    /// Emit a log event before each compile response.
    pub(crate) fn log(mut self, level: LogLevel, message: impl Into<String>) -> Self {
        self.log_event = Some((level, message.into()));
        self
    }

    pub(crate) fn compiler_version(mut self, version: impl Into<String>) -> Self {
        self.compiler_version = version.into();
        self
    }

    pub(crate) fn spawner(self) -> Arc<dyn CompilerSpawner> {
        Arc::new(FakeSpawner { config: self })
    }
}

struct FakeSpawner {
    config: FakeCompiler,
}

impl CompilerSpawner for FakeSpawner {
    fn spawn(&self) -> Result<CompilerIo, SpawnError> {
        let (host_writer, fake_reader) = tokio::io::duplex(1 << 20);
        let (fake_writer, host_reader) = tokio::io::duplex(1 << 20);
        tokio::spawn(run(self.config.clone(), fake_reader, fake_writer));
        Ok(CompilerIo {
            reader: Box::new(host_reader),
            writer: Box::new(host_writer),
            child: None,
        })
    }
}

type FakeReader = FramedRead<DuplexStream, JsonCodec<OutboundMessage>>;
type FakeWriter = FramedWrite<DuplexStream, JsonCodec<InboundMessage>>;

async fn run(config: FakeCompiler, read: DuplexStream, write: DuplexStream) {
    let mut reader: FakeReader = FramedRead::new(read, JsonCodec::new());
    let mut writer: FakeWriter = FramedWrite::new(write, JsonCodec::new());
    let mut backlog: VecDeque<OutboundMessage> = VecDeque::new();
    let mut held: Vec<InboundMessage> = Vec::new();
    let mut poison = config.poison_message.clone();
    let mut stray = config.stray_response;

    loop {
        let message = match backlog.pop_front() {
            Some(m) => m,
            None => match reader.next().await {
                Some(Ok(m)) => m,
                Some(Err(_)) | None => break,
            },
        };

        match message {
            OutboundMessage::CompileRequest {
                id,
                source,
                style,
                source_map,
                importer,
                ..
            } => {
                if stray {
                    stray = false;
                    let outcome = CompileOutcome::Success(CompileSuccess {
                        css: String::new(),
                        source_map: None,
                    });
                    if writer
                        .send(InboundMessage::CompileResponse {
                            id: CompileId::new(9999),
                            outcome,
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                if let Some(message) = poison.take() {
                    let _ = writer
                        .send(InboundMessage::ProtocolError { id: None, message })
                        .await;
                    continue;
                }
                if let Some((level, text)) = &config.log_event {
                    let _ = writer
                        .send(InboundMessage::LogEvent {
                            id: Some(id),
                            level: *level,
                            message: text.clone(),
                        })
                        .await;
                }

                let outcome = compile(
                    &config,
                    &mut reader,
                    &mut writer,
                    &mut backlog,
                    id,
                    &source,
                    style,
                    source_map,
                    importer,
                )
                .await;

                if config.silent {
                    continue;
                }
                let response = InboundMessage::CompileResponse { id, outcome };
                if config.hold > 0 {
                    held.push(response);
                    if held.len() >= config.hold {
                        for msg in held.drain(..).rev() {
                            if writer.send(msg).await.is_err() {
                                return;
                            }
                        }
                    }
                } else if writer.send(response).await.is_err() {
                    break;
                }
            }

            OutboundMessage::VersionRequest { id } => {
                if writer
                    .send(InboundMessage::VersionResponse {
                        id,
                        compiler_version: config.compiler_version.clone(),
                        protocol_version: FAKE_PROTOCOL_VERSION.to_string(),
                        implementation: Some("fake".to_string()),
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }

            // Replies are consumed inside compile(); one arriving here means
            // a broken test script.
            OutboundMessage::CanonicalizeResponse { .. } | OutboundMessage::ImportResponse { .. } => {
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn compile(
    config: &FakeCompiler,
    reader: &mut FakeReader,
    writer: &mut FakeWriter,
    backlog: &mut VecDeque<OutboundMessage>,
    id: CompileId,
    source: &str,
    style: OutputStyle,
    source_map: bool,
    importer: bool,
) -> CompileOutcome {
    if let Some(outcome) = config
        .scripted
        .iter()
        .find(|(s, _)| s == source)
        .map(|(_, o)| o.clone())
    {
        return outcome;
    }

    let mut resolved = String::new();
    let mut request_id = 0u32;
    for line in source.lines() {
        let url = match import_target(line) {
            Some(url) => url,
            None => {
                resolved.push_str(line);
                resolved.push('\n');
                continue;
            }
        };

        if !importer {
            return failure(format!("Can't find stylesheet to import: {:?}", url));
        }

        request_id += 1;
        if writer
            .send(InboundMessage::CanonicalizeRequest {
                id,
                request_id,
                url: url.clone(),
            })
            .await
            .is_err()
        {
            return failure("host went away");
        }
        let canonical = match await_reply(reader, backlog, request_id).await {
            Some(OutboundMessage::CanonicalizeResponse {
                url: Some(canonical),
                error: None,
                ..
            }) => canonical,
            Some(OutboundMessage::CanonicalizeResponse { error: Some(e), .. }) => return failure(e),
            Some(OutboundMessage::CanonicalizeResponse { .. }) => {
                return failure(format!("Can't find stylesheet to import: {:?}", url));
            }
            _ => return failure("host went away"),
        };

        request_id += 1;
        if writer
            .send(InboundMessage::ImportRequest {
                id,
                request_id,
                url: canonical,
            })
            .await
            .is_err()
        {
            return failure("host went away");
        }
        match await_reply(reader, backlog, request_id).await {
            Some(OutboundMessage::ImportResponse {
                contents: Some(contents),
                error: None,
                ..
            }) => {
                resolved.push_str(&contents);
                if !contents.ends_with('\n') {
                    resolved.push('\n');
                }
            }
            Some(OutboundMessage::ImportResponse { error: Some(e), .. }) => return failure(e),
            _ => return failure("host went away"),
        }
    }

    if let Some(name) = undefined_variable(&resolved) {
        return failure(format!("Undefined variable: ${}", name));
    }

    let css = match style {
        OutputStyle::Compressed => compress(&resolved),
        OutputStyle::Expanded => resolved.trim().to_string(),
    };
    CompileOutcome::Success(CompileSuccess {
        css,
        source_map: source_map.then(|| r#"{"version":3,"sources":["stdin"]}"#.to_string()),
    })
}

/// Read until the reply matching `request_id` arrives, queueing any compile
/// or version requests that interleave.
async fn await_reply(
    reader: &mut FakeReader,
    backlog: &mut VecDeque<OutboundMessage>,
    request_id: u32,
) -> Option<OutboundMessage> {
    loop {
        let message = match reader.next().await {
            Some(Ok(message)) => message,
            _ => return None,
        };
        let is_matching_reply = match &message {
            OutboundMessage::CanonicalizeResponse {
                request_id: rid, ..
            }
            | OutboundMessage::ImportResponse {
                request_id: rid, ..
            } => *rid == request_id,
            _ => false,
        };
        if is_matching_reply {
            return Some(message);
        }
        if matches!(
            message,
            OutboundMessage::CompileRequest { .. } | OutboundMessage::VersionRequest { .. }
        ) {
            backlog.push_back(message);
        }
    }
}

fn failure(message: impl Into<String>) -> CompileOutcome {
    CompileOutcome::Failure(CompileFailure::new(message))
}

fn import_target(line: &str) -> Option<String> {
    let trimmed = line.trim();
    let rest = trimmed
        .strip_prefix("@import ")
        .or_else(|| trimmed.strip_prefix("@use "))?;
    let first = rest.find('"')?;
    let rest = &rest[first + 1..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

fn undefined_variable(source: &str) -> Option<String> {
    let mut declared: HashSet<String> = HashSet::new();
    let mut usages: Vec<String> = Vec::new();

    for (pos, _) in source.match_indices('$') {
        let rest = &source[pos + 1..];
        let name: String = rest
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        if name.is_empty() {
            continue;
        }
        let after = &rest[name.len()..];
        if after.trim_start().starts_with(':') {
            declared.insert(name);
        } else {
            usages.push(name);
        }
    }

    usages.into_iter().find(|name| !declared.contains(name))
}

fn compress(source: &str) -> String {
    let stripped: String = source.chars().filter(|c| !c.is_whitespace()).collect();
    stripped.replace(";}", "}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_target_parses_import_and_use() {
        assert_eq!(import_target("@import \"colors\";"), Some("colors".to_string()));
        assert_eq!(import_target("  @use \"sass:math\""), Some("sass:math".to_string()));
        assert_eq!(import_target("div { color: red; }"), None);
    }

    #[test]
    fn undefined_variable_finds_undeclared_usage() {
        assert_eq!(
            undefined_variable("div { color: $white; }"),
            Some("white".to_string())
        );
        assert_eq!(
            undefined_variable("$white: #ffff;\ndiv { color: $white; }"),
            None
        );
    }

    #[test]
    fn compress_strips_non_semantic_whitespace() {
        assert_eq!(compress("div { color: #ccc; }\n"), "div{color:#ccc}");
    }
}

//! Session dispatcher - owns the framed connection and the receive loop.
//!
//! One session per subprocess. Concurrent compile calls multiplex over the
//! single connection: each call registers a completion slot under a fresh
//! compile id, and the receive loop routes inbound frames back by id.
//! Canonicalize/import callbacks re-enter the send path from the receive loop
//! itself, so a resolver that blocks stalls every outstanding call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{InboundCodec, JsonCodec};
use crate::bridge::protocol::{
    CompileId, CompileOutcome, CompileSuccess, InboundMessage, LogLevel, OutboundMessage,
    OutputStyle, SourceSyntax, VersionInfo,
};
use crate::error::Error;
use crate::importer::{self, ImportResolver};
use crate::spawner::CompilerIo;

type MessageReader = FramedRead<Box<dyn AsyncRead + Send + Unpin>, InboundCodec>;
type MessageWriter = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, JsonCodec<OutboundMessage>>;

/// Write half of the connection. Taken (and thereby closed) on shutdown;
/// locked per frame so concurrent sends never interleave.
type SharedWriter = Arc<tokio::sync::Mutex<Option<MessageWriter>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    Idle,
    Running,
    Closing,
    Closed,
}

/// Per-call request payload; the session allocates the compile id.
#[derive(Debug, Clone)]
pub(crate) struct CompileRequest {
    pub source: String,
    pub syntax: SourceSyntax,
    pub style: OutputStyle,
    pub precision: Option<u32>,
    pub source_map: bool,
}

enum Completion {
    Compile(oneshot::Sender<Result<CompileSuccess, Error>>),
    Version(oneshot::Sender<Result<VersionInfo, Error>>),
}

impl Completion {
    fn fail(self, error: Error) {
        match self {
            Completion::Compile(tx) => {
                let _ = tx.send(Err(error));
            }
            Completion::Version(tx) => {
                let _ = tx.send(Err(error));
            }
        }
    }
}

struct PendingCall {
    resolver: Option<Arc<dyn ImportResolver>>,
    completion: Completion,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the facade-facing methods and the receive loop.
///
/// Lock order: `state` before `calls`. Registration checks the state while
/// holding its lock, and `fail_all` flips the state before draining, so a
/// call can never be registered into a session that already failed.
struct Registry {
    state: StdMutex<SessionState>,
    calls: StdMutex<HashMap<CompileId, PendingCall>>,
}

impl Registry {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: StdMutex::new(SessionState::Idle),
            calls: StdMutex::new(HashMap::new()),
        })
    }

    fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    fn set_running(&self) {
        *lock(&self.state) = SessionState::Running;
    }

    fn begin_close(&self) {
        let mut state = lock(&self.state);
        if matches!(*state, SessionState::Idle | SessionState::Running) {
            *state = SessionState::Closing;
        }
    }

    fn register(&self, id: CompileId, call: PendingCall) -> Result<(), Error> {
        let state = lock(&self.state);
        if *state != SessionState::Running {
            return Err(Error::NotRunning);
        }
        lock(&self.calls).insert(id, call);
        Ok(())
    }

    fn remove(&self, id: CompileId) -> Option<PendingCall> {
        lock(&self.calls).remove(&id)
    }

    fn resolver_for(&self, id: CompileId) -> Option<Arc<dyn ImportResolver>> {
        lock(&self.calls).get(&id).and_then(|c| c.resolver.clone())
    }

    /// Moves the session to `Closed` and fails every outstanding call.
    fn fail_all(&self, error: &Error) {
        let mut state = lock(&self.state);
        *state = SessionState::Closed;
        let drained: Vec<PendingCall> = lock(&self.calls).drain().map(|(_, call)| call).collect();
        drop(state);

        for call in drained {
            call.completion.fail(error.clone());
        }
    }
}

pub(crate) struct Session {
    registry: Arc<Registry>,
    writer: SharedWriter,
    next_id: AtomicU32,
    child: tokio::sync::Mutex<Option<Child>>,
    receive_loop: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    close_called: AtomicBool,
}

impl Session {
    /// Opens a session over the given compiler connection and launches the
    /// receive loop.
    pub(crate) fn open(io: CompilerIo) -> Arc<Self> {
        let registry = Registry::new();
        let reader: MessageReader = FramedRead::new(io.reader, InboundCodec::new());
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(Some(FramedWrite::new(
            io.writer,
            JsonCodec::new(),
        ))));

        registry.set_running();
        let handle = tokio::spawn(receive_loop(
            reader,
            Arc::clone(&writer),
            Arc::clone(&registry),
        ));

        Arc::new(Self {
            registry,
            writer,
            next_id: AtomicU32::new(1),
            child: tokio::sync::Mutex::new(io.child),
            receive_loop: tokio::sync::Mutex::new(Some(handle)),
            close_called: AtomicBool::new(false),
        })
    }

    pub(crate) async fn compile(
        &self,
        request: CompileRequest,
        resolver: Option<Arc<dyn ImportResolver>>,
    ) -> Result<CompileSuccess, Error> {
        let id = self.allocate_id();
        let importer_registered = resolver.is_some();
        let (tx, rx) = oneshot::channel();
        self.registry.register(
            id,
            PendingCall {
                resolver,
                completion: Completion::Compile(tx),
            },
        )?;
        tracing::debug!(%id, importer = importer_registered, "submitting compile call");

        let message = OutboundMessage::CompileRequest {
            id,
            source: request.source,
            syntax: request.syntax,
            style: request.style,
            precision: request.precision,
            source_map: request.source_map,
            importer: importer_registered,
        };
        if let Err(e) = self.send(message).await {
            self.registry.remove(id);
            return Err(e);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionClosed),
        }
    }

    pub(crate) async fn version(&self) -> Result<VersionInfo, Error> {
        let id = self.allocate_id();
        let (tx, rx) = oneshot::channel();
        self.registry.register(
            id,
            PendingCall {
                resolver: None,
                completion: Completion::Version(tx),
            },
        )?;

        if let Err(e) = self.send(OutboundMessage::VersionRequest { id }).await {
            self.registry.remove(id);
            return Err(e);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionClosed),
        }
    }

    /// Shuts the session down. Outstanding calls complete with a
    /// connection-closed error once the receive loop observes stream closure.
    pub(crate) async fn close(&self) -> Result<(), Error> {
        if self.close_called.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyClosed);
        }
        self.registry.begin_close();

        // Dropping the write half closes the compiler's stdin, which is the
        // shutdown signal for the subprocess.
        self.writer.lock().await.take();

        if let Some(handle) = self.receive_loop.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "receive loop task failed");
            }
        }
        debug_assert_eq!(self.registry.state(), SessionState::Closed);

        if let Some(mut child) = self.child.lock().await.take() {
            match child.wait().await {
                Ok(status) => tracing::debug!(%status, "compiler exited"),
                Err(e) => tracing::warn!(error = %e, "failed to wait for compiler"),
            }
        }

        tracing::info!("session closed");
        Ok(())
    }

    fn allocate_id(&self) -> CompileId {
        CompileId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    async fn send(&self, message: OutboundMessage) -> Result<(), Error> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(sink) => sink.send(message).await.map_err(|e| {
                tracing::error!(error = %e, "failed to write frame");
                Error::ConnectionClosed
            }),
            None => Err(Error::ConnectionClosed),
        }
    }
}

async fn receive_loop(mut reader: MessageReader, writer: SharedWriter, registry: Arc<Registry>) {
    let failure = loop {
        match reader.next().await {
            Some(Ok(message)) => {
                if let Some(fatal) = handle_message(message, &writer, &registry).await {
                    break fatal;
                }
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "failed to read frame");
                break Error::ConnectionClosed;
            }
            None => break Error::ConnectionClosed,
        }
    };

    registry.fail_all(&failure);
    tracing::debug!("receive loop exiting");
}

/// Routes one inbound envelope. Returns the session-fatal error, if any.
async fn handle_message(
    message: InboundMessage,
    writer: &SharedWriter,
    registry: &Arc<Registry>,
) -> Option<Error> {
    match message {
        InboundMessage::CompileResponse { id, outcome } => match registry.remove(id) {
            Some(PendingCall {
                completion: Completion::Compile(tx),
                ..
            }) => {
                let result = match outcome {
                    CompileOutcome::Success(success) => Ok(success),
                    CompileOutcome::Failure(failure) => Err(Error::Compile(failure)),
                };
                if tx.send(result).is_err() {
                    tracing::warn!(%id, "caller went away before compile delivery");
                }
                None
            }
            Some(call) => {
                let error = Error::Protocol(format!("compile response for non-compile call {}", id));
                call.completion.fail(error.clone());
                Some(error)
            }
            None => Some(Error::Protocol(format!(
                "compile response for unknown call {}",
                id
            ))),
        },

        InboundMessage::VersionResponse {
            id,
            compiler_version,
            protocol_version,
            implementation,
        } => match registry.remove(id) {
            Some(PendingCall {
                completion: Completion::Version(tx),
                ..
            }) => {
                let info = VersionInfo {
                    compiler_version,
                    protocol_version,
                    implementation,
                };
                if tx.send(Ok(info)).is_err() {
                    tracing::warn!(%id, "caller went away before version delivery");
                }
                None
            }
            Some(call) => {
                let error = Error::Protocol(format!("version response for non-version call {}", id));
                call.completion.fail(error.clone());
                Some(error)
            }
            None => Some(Error::Protocol(format!(
                "version response for unknown call {}",
                id
            ))),
        },

        // The call stays registered: it is still outstanding until its
        // compile response arrives.
        InboundMessage::CanonicalizeRequest { id, request_id, url } => {
            let resolver = registry.resolver_for(id);
            let reply = importer::canonicalize_reply(resolver.as_deref(), id, request_id, &url);
            send_reply(writer, reply).await
        }

        InboundMessage::ImportRequest { id, request_id, url } => {
            let resolver = registry.resolver_for(id);
            let reply = importer::import_reply(resolver.as_deref(), id, request_id, &url);
            send_reply(writer, reply).await
        }

        InboundMessage::LogEvent { id, level, message } => {
            forward_log(id, level, &message);
            None
        }

        InboundMessage::ProtocolError { id, message } => {
            tracing::error!(compile_id = id.map(|i| i.as_u32()), %message, "compiler reported protocol error");
            Some(Error::Protocol(message))
        }
    }
}

async fn send_reply(writer: &SharedWriter, reply: OutboundMessage) -> Option<Error> {
    let mut guard = writer.lock().await;
    match guard.as_mut() {
        Some(sink) => match sink.send(reply).await {
            Ok(()) => None,
            Err(e) => {
                tracing::error!(error = %e, "failed to send import reply");
                Some(Error::ConnectionClosed)
            }
        },
        None => Some(Error::ConnectionClosed),
    }
}

fn forward_log(id: Option<CompileId>, level: LogLevel, message: &str) {
    let compile_id = id.map(|i| i.as_u32());
    match level {
        LogLevel::Debug => {
            tracing::debug!(target: "sass_embedded_host::compiler", compile_id, "{}", message)
        }
        LogLevel::Warning => {
            tracing::warn!(target: "sass_embedded_host::compiler", compile_id, "{}", message)
        }
        LogLevel::Deprecation => {
            tracing::warn!(target: "sass_embedded_host::compiler", compile_id, deprecation = true, "{}", message)
        }
    }
}

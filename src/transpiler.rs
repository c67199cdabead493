//! Client facade - start a compiler session, execute compile calls, close.
//!
//! One `Transpiler` wraps exactly one session and may be shared by
//! arbitrarily many concurrent callers; handles are cheap to clone.

use std::path::PathBuf;
use std::sync::Arc;

use crate::bridge::protocol::{OutputStyle, SourceSyntax, VersionInfo};
use crate::error::Error;
use crate::importer::ImportResolver;
use crate::session::{CompileRequest, Session};
use crate::spawner::{CompilerSpawner, EmbeddedSassSpawner};

/// Binary resolved through PATH when no compiler path is configured.
const DEFAULT_COMPILER: &str = "sass";

/// Session-wide configuration and per-call defaults.
#[derive(Clone, Default)]
pub struct Options {
    compiler_path: Option<PathBuf>,
    output_style: OutputStyle,
    precision: Option<u32>,
    import_resolver: Option<Arc<dyn ImportResolver>>,
    spawner: Option<Arc<dyn CompilerSpawner>>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Path to the embedded compiler binary.
    pub fn with_compiler_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.compiler_path = Some(path.into());
        self
    }

    /// Default output style for calls that do not override it.
    pub fn with_output_style(mut self, style: OutputStyle) -> Self {
        self.output_style = style;
        self
    }

    /// Numeric precision hint passed through to the compiler.
    pub fn with_precision(mut self, precision: u32) -> Self {
        self.precision = Some(precision);
        self
    }

    /// Default import resolver for calls that do not supply their own.
    pub fn with_import_resolver(mut self, resolver: Arc<dyn ImportResolver>) -> Self {
        self.import_resolver = Some(resolver);
        self
    }

    /// Replace how the compiler connection is produced (tests, custom
    /// launchers).
    pub fn with_spawner(mut self, spawner: Arc<dyn CompilerSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }
}

/// One compile call's arguments.
#[derive(Clone)]
pub struct CompileArgs {
    source: String,
    output_style: Option<OutputStyle>,
    source_syntax: SourceSyntax,
    enable_source_map: bool,
    import_resolver: Option<Arc<dyn ImportResolver>>,
}

impl CompileArgs {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            output_style: None,
            source_syntax: SourceSyntax::default(),
            enable_source_map: false,
            import_resolver: None,
        }
    }

    pub fn with_output_style(mut self, style: OutputStyle) -> Self {
        self.output_style = Some(style);
        self
    }

    pub fn with_source_syntax(mut self, syntax: SourceSyntax) -> Self {
        self.source_syntax = syntax;
        self
    }

    pub fn with_source_map(mut self, enable: bool) -> Self {
        self.enable_source_map = enable;
        self
    }

    /// Per-call resolver; overrides the session default.
    pub fn with_import_resolver(mut self, resolver: Arc<dyn ImportResolver>) -> Self {
        self.import_resolver = Some(resolver);
        self
    }
}

/// Successful compile result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOutput {
    pub css: String,
    pub source_map: Option<String>,
}

/// Handle to one compiler session.
#[derive(Clone)]
pub struct Transpiler {
    session: Arc<Session>,
    options: Arc<Options>,
}

impl std::fmt::Debug for Transpiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transpiler").finish_non_exhaustive()
    }
}

impl Transpiler {
    /// Spawn the compiler subprocess and start the session's receive loop.
    pub async fn start(options: Options) -> Result<Self, Error> {
        let io = match &options.spawner {
            Some(spawner) => spawner.spawn(),
            None => {
                let binary = options
                    .compiler_path
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_COMPILER));
                EmbeddedSassSpawner::new(binary).spawn()
            }
        }
        .map_err(|e| Error::Spawn(e.to_string()))?;

        let session = Session::open(io);
        tracing::info!("compiler session started");

        Ok(Self {
            session,
            options: Arc::new(options),
        })
    }

    /// Compile one source text. Blocks until this call's terminal response
    /// arrives; concurrent calls are independent.
    pub async fn execute(&self, args: CompileArgs) -> Result<CompileOutput, Error> {
        let resolver = args
            .import_resolver
            .or_else(|| self.options.import_resolver.clone());

        let request = CompileRequest {
            source: args.source,
            syntax: args.source_syntax,
            style: args.output_style.unwrap_or(self.options.output_style),
            precision: self.options.precision,
            source_map: args.enable_source_map,
        };

        let success = self.session.compile(request, resolver).await?;
        Ok(CompileOutput {
            css: success.css,
            source_map: success.source_map,
        })
    }

    /// Report the compiler's version information.
    pub async fn version(&self) -> Result<VersionInfo, Error> {
        self.session.version().await
    }

    /// Shut the session down. Outstanding calls fail with a
    /// connection-closed error; calling close twice fails with AlreadyClosed.
    pub async fn close(&self) -> Result<(), Error> {
        self.session.close().await
    }
}

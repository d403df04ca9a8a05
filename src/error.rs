//! Error taxonomy for the link/archive core (C10).
//!
//! The source this crate is modeled after used a process-wide error
//! callback; that is re-architected here as an explicit [`ErrorSink`]
//! passed into each job, so jobs stay isolated and testable (see
//! `SPEC_FULL.md` §3, Design Notes §9).

use std::fmt;

/// Stable error kind identifiers (spec §7).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("out of memory")]
    OutOfMemory,
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("I/O error: {0}")]
    FileIO(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("invalid magic number")]
    InvalidMagic,
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u16),
    #[error("corrupt header: {0}")]
    CorruptHeader(String),
    #[error("invalid section: {0}")]
    InvalidSection(String),
    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),
    #[error("invalid relocation: {0}")]
    InvalidRelocation(String),
    #[error("symbol not found: {0}")]
    SymbolNotFound(String),
    #[error("duplicate symbol: {0}")]
    DuplicateSymbol(String),
    #[error("circular dependency: {0}")]
    CircularDependency(String),
    #[error("relocation failed at input {input}, section {section}, offset {offset}: {reason}")]
    RelocationFailed {
        input: usize,
        section: usize,
        offset: u32,
        reason: String,
    },
    #[error("section alignment violation: {0}")]
    SectionAlignment(String),
    #[error("output too large")]
    OutputTooLarge,
    #[error("archive corrupt: {0}")]
    ArchiveCorrupt(String),
    #[error("member not found: {0}")]
    MemberNotFound(String),
    #[error("compression failed: {0}")]
    CompressionFailed(String),
    #[error("decompression failed: {0}")]
    DecompressionFailed(String),
    #[error("system limit exceeded: {0}")]
    SystemLimit(String),
    #[error("internal error: {0}")]
    Internal(String),
    /// Composite kind: the link driver collects every unresolved
    /// reference before failing (spec §7) rather than stopping at the
    /// first. Not a new taxonomy entry — a thin wrapper around
    /// [`Error::SymbolNotFound`] occurrences.
    #[error("{} unresolved symbol(s)", .0.len())]
    Unresolved(Vec<Error>),
}

/// Severity of a reported error/diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Fatal,
}

impl Error {
    /// Severity assigned to this error kind. `OutOfMemory` and
    /// `Internal` are always fatal (spec §7); everything else is
    /// `Error` severity by default in this core (callers may choose to
    /// downgrade/upgrade when presenting diagnostics).
    pub fn severity(&self) -> Severity {
        match self {
            Error::OutOfMemory | Error::Internal(_) => Severity::Fatal,
            _ => Severity::Error,
        }
    }

    /// True for kinds that must abort the job immediately rather than
    /// be collected for batch reporting (spec §7).
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Source location captured alongside an [`Error`] for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: &'static str,
    pub line: u32,
    pub function: &'static str,
}

/// Context carried alongside a propagated error: kind, severity, a
/// human message, the source location it was raised at, and an
/// optional cause chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    pub kind: Error,
    pub severity: Severity,
    pub message: String,
    pub location: SourceLocation,
    pub caused_by: Option<Box<ErrorContext>>,
}

impl ErrorContext {
    pub fn new(kind: Error, message: impl Into<String>, location: SourceLocation) -> Self {
        let severity = kind.severity();
        Self {
            kind,
            severity,
            message: message.into(),
            location,
            caused_by: None,
        }
    }

    pub fn caused_by(mut self, cause: ErrorContext) -> Self {
        self.caused_by = Some(Box::new(cause));
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}:{} in {}): {}",
            self.kind, self.location.file, self.location.line, self.location.function, self.message
        )?;
        if let Some(cause) = &self.caused_by {
            write!(f, "\n  caused by: {cause}")?;
        }
        Ok(())
    }
}

/// Captures a [`SourceLocation`] at the call site.
#[macro_export]
macro_rules! here {
    () => {
        $crate::error::SourceLocation {
            file: file!(),
            line: line!(),
            function: "",
        }
    };
}

/// Explicit error sink a job reports diagnostics to, replacing the
/// source's process-wide callback (Design Notes §9). Jobs remain
/// isolated: nothing is shared between two jobs using different sinks.
pub trait ErrorSink {
    fn report(&mut self, context: ErrorContext);
}

/// A sink that simply accumulates every reported context, useful for
/// batch diagnostics (the link driver's resolution pass, spec §7).
#[derive(Debug, Default)]
pub struct CollectingSink {
    pub contexts: Vec<ErrorContext>,
}

impl ErrorSink for CollectingSink {
    fn report(&mut self, context: ErrorContext) {
        self.contexts.push(context);
    }
}

/// A sink that discards everything reported to it.
#[derive(Debug, Default)]
pub struct NullSink;

impl ErrorSink for NullSink {
    fn report(&mut self, _context: ErrorContext) {}
}

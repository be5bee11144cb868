use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy surfaced to the tool layer. Every variant maps to a
/// stable `kind()` string carried in tool error payloads.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no language server is configured for {}", .path.display())]
    UnsupportedLanguage { path: PathBuf },

    #[error("language server failed to start: {0}")]
    StartupFailed(String),

    #[error("language server is not running: {0}")]
    ServerDown(String),

    #[error("language server transport closed")]
    TransportClosed,

    #[error("language server error {code}: {message}")]
    Lsp { code: i64, message: String },

    #[error("request timed out: {method}")]
    Timeout { method: String },

    #[error("the language server does not support rename")]
    RenameNotSupported,

    #[error("rename rejected: {0}")]
    RenameInvalid(String),

    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("name path '{name_path}' matched {count} symbols; narrow the query")]
    AmbiguousSymbol { name_path: String, count: usize },

    #[error("{} changed on disk since the symbol was resolved", .path.display())]
    EditConflict { path: PathBuf },

    #[error(
        "multi-file edit halted: {} file(s) written, {} pending: {message}",
        .completed.len(),
        .pending.len()
    )]
    PartialEdit {
        completed: Vec<PathBuf>,
        pending: Vec<PathBuf>,
        message: String,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn kind(&self) -> &'static str {
        match self {
            Error::UnsupportedLanguage { .. } => "unsupported_language",
            Error::StartupFailed(_) => "startup_failed",
            Error::ServerDown(_) => "server_down",
            Error::TransportClosed => "transport_closed",
            Error::Lsp { .. } => "lsp_error",
            Error::Timeout { .. } => "timeout",
            Error::RenameNotSupported => "rename_not_supported",
            Error::RenameInvalid(_) => "rename_invalid",
            Error::SymbolNotFound(_) => "symbol_not_found",
            Error::AmbiguousSymbol { .. } => "ambiguous_symbol",
            Error::EditConflict { .. } => "edit_conflict",
            Error::PartialEdit { .. } => "partial_edit",
            Error::InvalidInput(_) => "invalid_input",
            Error::Other(_) => "internal",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Other(err.into())
    }
}

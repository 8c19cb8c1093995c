//! Error types for pool construction

/// Errors from account discovery.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing accounts file {path}: {message}")]
    Parse { path: String, message: String },
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

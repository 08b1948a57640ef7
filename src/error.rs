use std::io;

/// The error taxonomy from the wire protocol: auth, not-found (folded into
/// `FileStat::exists` rather than surfaced here), path-invalid,
/// transient-io, network, version-mismatch and protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum HsyncError {
    #[error("token not match")]
    Auth,

    #[error("wrong file name: {0}")]
    PathInvalid(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("network error: {0}")]
    Network(String),

    #[error("server version [{server}] != client version [{client}]")]
    VersionMismatch { client: String, server: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, HsyncError>;

//! The error taxonomy shared by the daemon session loop and the client
//! stub: validation, not-found, resource exhaustion, protocol violations,
//! transport failures, and startup failures.
//!
//! Request-level variants (`Invalid`, `NotFound`, `Exhausted`, `Protocol`)
//! are turned into a `REP` reply by the daemon and do not end the session.
//! Transport variants (`PeerShutdown`, `Io`, `Nix`) do.

#[derive(thiserror::Error, Debug)]
pub enum EscrowError {
    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("not found")]
    NotFound,

    #[error("resource exhausted: {0}")]
    Exhausted(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("peer shut down")]
    PeerShutdown,

    #[error("startup failed: {0}")]
    Startup(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("syscall failed: {0}")]
    Nix(#[from] nix::Error),
}

impl EscrowError {
    /// True if this error terminates the current session rather than
    /// producing a `REP` reply and continuing.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            EscrowError::PeerShutdown | EscrowError::Io(_) | EscrowError::Nix(_)
        )
    }

    /// Negated POSIX-like return code, as carried on the wire in a `REP`
    /// frame's `rc` field. Only meaningful for request-level errors.
    pub fn rc(&self) -> i16 {
        match self {
            EscrowError::Invalid(_) => -22,   // EINVAL
            EscrowError::NotFound => -2,      // ENOENT
            EscrowError::Exhausted(_) => -12, // ENOMEM
            EscrowError::Protocol(_) => -71,  // EPROTO
            EscrowError::Startup(_) => -1,    // EPERM-ish, CLI-only
            EscrowError::PeerShutdown | EscrowError::Io(_) | EscrowError::Nix(_) => -5, // EIO
        }
    }
}

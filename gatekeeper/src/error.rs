//! Typed errors for the tunnel and store layers.
//!
//! Kernel map plumbing and the binary's top level use `anyhow`; these enums
//! cover the pieces whose callers need to tell failures apart.

use std::io;
use std::process::ExitStatus;

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("netlink: {0}")]
    Netlink(#[from] rtnetlink::Error),

    #[error("link {0} not found")]
    LinkNotFound(String),

    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("{command} exited with {status}: {stderr}")]
    Command {
        command: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("invalid {what}: {value}")]
    Invalid { what: &'static str, value: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TunnelError {
    pub fn invalid(what: &'static str, value: impl Into<String>) -> Self {
        TunnelError::Invalid {
            what,
            value: value.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("telemetry writer has stopped")]
    WriterGone,

    #[error("failed to spawn telemetry writer: {0}")]
    Spawn(#[source] io::Error),

    #[error("malformed {what} in row {row}: {value}")]
    Malformed {
        what: &'static str,
        row: i64,
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_display_names_the_field() {
        let err = TunnelError::invalid("public key", "abc");
        assert_eq!(err.to_string(), "invalid public key: abc");
    }

    #[test]
    fn from_rusqlite_produces_sqlite_variant() {
        let err: StoreError = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, StoreError::Sqlite(_)));
        assert!(err.to_string().starts_with("sqlite: "));
    }

    #[test]
    fn from_io_produces_io_variant() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "no wg");
        let err: TunnelError = io_err.into();
        assert!(matches!(err, TunnelError::Io(_)));
    }
}

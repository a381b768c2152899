//! Lifecycle and address errors surfaced to callers.
//!
//! Per-connection failures never take this path; they are reported to the
//! service as `on_closed`.

use std::io;

use thiserror::Error;

/// Structured server error with a kind and, for aggregated listen
/// failures, an appendable message chain.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server already running")]
    AlreadyRunning,

    #[error("server not initialized")]
    Uninitialized,

    #[error("invalid options: {0}")]
    Options(String),

    #[error("failed to start {stage}: {source}")]
    StartFailed {
        stage: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("address resolution failed for {addr}: {source}")]
    Resolve {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("listen failed: {}", messages.join("; "))]
    Listen { messages: Vec<String> },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ServerError {
    pub(crate) fn start_failed(
        stage: &'static str,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ServerError::StartFailed {
            stage,
            source: Box::new(source),
        }
    }

    /// Fold one more per-address failure into an aggregated listen error.
    pub(crate) fn append(self, msg: String) -> Self {
        match self {
            ServerError::Listen { mut messages } => {
                messages.push(msg);
                ServerError::Listen { messages }
            }
            other => ServerError::Listen {
                messages: vec![other.to_string(), msg],
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_errors_aggregate() {
        let err = ServerError::Listen {
            messages: vec!["127.0.0.1:80: permission denied".to_string()],
        };
        let err = err.append("[::1]:80: permission denied".to_string());
        let text = err.to_string();
        assert!(text.contains("127.0.0.1:80"));
        assert!(text.contains("[::1]:80"));
    }

    #[test]
    fn start_failed_carries_stage_and_source() {
        let err = ServerError::start_failed("dispatch", io::Error::other("spawn failed"));
        assert!(err.to_string().contains("dispatch"));
        assert!(std::error::Error::source(&err).is_some());
    }
}

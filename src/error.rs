//! Failure taxonomy for work done against a backend.
//!
//! Every variant is `Clone` so that one failed connection attempt can be
//! handed to every caller that was waiting on it, and so that errors can be
//! carried inside scheduler messages.

use crate::model::{BackendName, PaneId, ResourceKind};
use std::time::Duration;

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum BackendError {
    /// The backend could not be reached or failed its health probe.
    #[error("cannot connect to {backend}: {message}")]
    Connection {
        backend: BackendName,
        message: String,
    },

    /// Connected, but listing a resource kind failed.
    #[error("failed to list {kind} on {backend}: {message}")]
    Fetch {
        backend: BackendName,
        kind: ResourceKind,
        message: String,
    },

    /// A live log stream could not be opened or ended abnormally.
    #[error("log stream for {pane} failed: {message}")]
    Stream { pane: PaneId, message: String },

    /// A connect or fetch did not finish within its deadline.
    #[error("{operation} on {backend} timed out after {}s", after.as_secs())]
    Timeout {
        backend: BackendName,
        operation: &'static str,
        after: Duration,
    },
}

impl BackendError {
    pub fn connection(backend: &BackendName, error: &anyhow::Error) -> Self {
        Self::Connection {
            backend: backend.clone(),
            message: compact_error(error),
        }
    }

    pub fn fetch(backend: &BackendName, kind: ResourceKind, error: &anyhow::Error) -> Self {
        Self::Fetch {
            backend: backend.clone(),
            kind,
            message: compact_error(error),
        }
    }

    /// Human message without the backend/kind prefix, as shown next to the
    /// backend it belongs to.
    pub fn summary(&self) -> String {
        match self {
            Self::Connection { message, .. }
            | Self::Fetch { message, .. }
            | Self::Stream { message, .. } => message.clone(),
            Self::Timeout {
                operation, after, ..
            } => format!("{operation} timed out after {}s", after.as_secs()),
        }
    }
}

pub fn compact_error(error: &anyhow::Error) -> String {
    let mut out = Vec::new();
    for (index, cause) in error.chain().enumerate() {
        if index == 0 {
            out.push(cause.to_string());
        } else if index <= 2 {
            out.push(format!("caused by: {cause}"));
        } else {
            break;
        }
    }

    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::{BackendError, compact_error};
    use crate::model::{BackendName, PaneId, ResourceKind};
    use anyhow::Context;
    use std::time::Duration;

    #[test]
    fn summary_drops_backend_prefix() {
        let err = BackendError::Fetch {
            backend: BackendName::new("alpha"),
            kind: ResourceKind::Pods,
            message: "permission denied".to_string(),
        };
        assert_eq!(err.summary(), "permission denied");
        assert_eq!(
            err.to_string(),
            "failed to list Pods on alpha: permission denied"
        );
    }

    #[test]
    fn timeout_display_mentions_operation() {
        let err = BackendError::Timeout {
            backend: BackendName::new("beta"),
            operation: "connect",
            after: Duration::from_secs(10),
        };
        assert_eq!(err.to_string(), "connect on beta timed out after 10s");
        assert_eq!(err.summary(), "connect timed out after 10s");
    }

    #[test]
    fn stream_errors_name_the_pane() {
        let err = BackendError::Stream {
            pane: PaneId(1),
            message: "eof".to_string(),
        };
        assert_eq!(err.to_string(), "log stream for pane 1 failed: eof");
    }

    #[test]
    fn compact_error_keeps_two_causes() {
        let error = Err::<(), _>(anyhow::anyhow!("root"))
            .context("middle")
            .context("outer")
            .context("top")
            .expect_err("error chain");
        let compact = compact_error(&error);
        assert_eq!(compact, "top\ncaused by: outer\ncaused by: middle");
    }

    #[test]
    fn connection_constructor_flattens_chain() {
        let error = anyhow::anyhow!("tls handshake failed");
        let err = BackendError::connection(&BackendName::new("alpha"), &error);
        assert_eq!(err.summary(), "tls handshake failed");
    }

    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<BackendError>();
        }
    };
}

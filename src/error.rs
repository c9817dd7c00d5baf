use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Durable store error: {0}")]
    Store(#[from] StoreError),

    #[error("Job context store error: {0}")]
    Context(#[from] ContextStoreError),

    #[error("Stage gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Batch not found: {0}")]
    BatchNotFound(String),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("durable store unavailable: {0}")]
    Unavailable(String),

    #[error("record already exists: {0}")]
    Duplicate(String),

    #[error("record not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum ContextStoreError {
    #[error("job context store unavailable: {0}")]
    Unavailable(String),

    #[error("job context could not be encoded: {0}")]
    Encoding(String),
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to enqueue on topic {topic}: {reason}")]
    Enqueue { topic: String, reason: String },

    #[error("gateway channel closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification endpoint returned status {status}: {message}")]
    Endpoint { status: u16, message: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

/// Classifies a stage failure for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    /// Permanent rejection (bad input, missing definition, business rule).
    Terminal,
    /// Infrastructure failure (timeout, unreachable worker or downstream API).
    Transient,
}

impl FailureKind {
    /// Map a worker status code onto a failure class. `None` means success.
    ///
    /// 408, 429 and 5xx are transient; any other 4xx is terminal. Codes outside
    /// the HTTP ranges count as transient.
    pub fn from_status_code(code: u16) -> Option<Self> {
        match code {
            200..=299 => None,
            408 | 429 => Some(FailureKind::Transient),
            400..=499 => Some(FailureKind::Terminal),
            _ => Some(FailureKind::Transient),
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::Transient)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Terminal => write!(f, "Terminal"),
            FailureKind::Transient => write!(f, "Transient"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_codes_have_no_failure_kind() {
        assert_eq!(FailureKind::from_status_code(200), None);
        assert_eq!(FailureKind::from_status_code(204), None);
    }

    #[test]
    fn bad_request_is_terminal() {
        assert_eq!(FailureKind::from_status_code(400), Some(FailureKind::Terminal));
        assert_eq!(FailureKind::from_status_code(404), Some(FailureKind::Terminal));
        assert_eq!(FailureKind::from_status_code(422), Some(FailureKind::Terminal));
    }

    #[test]
    fn timeouts_and_server_errors_are_transient() {
        for code in [408, 429, 500, 502, 503, 504, 0, 999] {
            assert_eq!(
                FailureKind::from_status_code(code),
                Some(FailureKind::Transient),
                "code {code}"
            );
        }
    }

    #[test]
    fn engine_error_display() {
        let err = EngineError::from(GatewayError::Enqueue {
            topic: "batch_queued".into(),
            reason: "broker down".into(),
        });
        assert_eq!(
            err.to_string(),
            "Stage gateway error: failed to enqueue on topic batch_queued: broker down"
        );
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<EngineError>();
    }
}

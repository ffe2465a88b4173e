use thiserror::Error;

#[derive(Debug, Error)]
pub enum LLMError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("missing API key: set the {0} environment variable")]
    MissingApiKey(String),

    #[error("invalid response from provider: {0}")]
    InvalidResponse(&'static str),

    #[error("transient provider failure: {0}")]
    Transient(String),

    #[error("fatal provider failure: {0}")]
    Fatal(String),

    #[error("provider call timed out after {0} ms")]
    Timeout(u64),

    #[error("malformed model response: {0}")]
    MalformedResponse(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid tool arguments: {0}")]
    InvalidToolArguments(String),

    #[error("tool {tool} failed: {message}")]
    ToolExecution { tool: String, message: String },
}

/// How the runner should treat a failed adapter call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Retried up to the configured limit, then recorded as a turn failure.
    Transient,
    /// Aborts the trial.
    Fatal,
    /// Counted against the trial; aborts only when repeated past the threshold.
    Malformed,
}

impl LLMError {
    pub fn class(&self) -> FailureClass {
        match self {
            LLMError::Transient(_) | LLMError::Timeout(_) => FailureClass::Transient,
            LLMError::Http(err) if err.is_timeout() || err.is_connect() || err.is_request() => {
                FailureClass::Transient
            }
            LLMError::MalformedResponse(_)
            | LLMError::InvalidResponse(_)
            | LLMError::Serialization(_) => FailureClass::Malformed,
            _ => FailureClass::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == FailureClass::Transient
    }

    /// Maps an HTTP status onto the failure taxonomy.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            408 | 409 | 429 | 500..=599 => LLMError::Transient(format!("status {status}: {message}")),
            401 | 403 => LLMError::Fatal(format!("status {status}: {message}")),
            _ => LLMError::Provider(format!("status {status}: {message}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_onto_failure_classes() {
        assert!(LLMError::from_status(429, "slow down").is_transient());
        assert!(LLMError::from_status(503, "unavailable").is_transient());
        assert_eq!(LLMError::from_status(401, "bad key").class(), FailureClass::Fatal);
        assert_eq!(LLMError::from_status(404, "missing").class(), FailureClass::Fatal);
    }

    #[test]
    fn malformed_is_its_own_class() {
        let err = LLMError::MalformedResponse("not json".into());
        assert_eq!(err.class(), FailureClass::Malformed);
        assert!(!err.is_transient());
    }
}

//! Error types for crun
//!
//! 엔진, 드라이버, CLI 가 공유하는 단일 에러 타입

use std::time::Duration;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Control-plane error codes that mean "slow down and try again"
const THROTTLING_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "TooManyRequestsException",
];

/// crun 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // 설정 관련
    // ========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Validation error: {0}")]
    Validation(String),

    // ========================================================================
    // Control plane
    // ========================================================================
    /// An error reported by a control-plane service, keyed by its error code
    #[error("{service} error {code}: {message}")]
    Api {
        service: String,
        code: String,
        message: String,
    },

    /// The named stack does not exist (update / describe fallbacks)
    #[error("Stack not found: {0}")]
    StackNotFound(String),

    /// Convergence or poll deadline expired
    #[error("Timed out after {after:?}: {operation}")]
    Timeout { operation: String, after: Duration },

    /// One or more task instances were rejected at launch
    #[error("{}", .0.join("\n"))]
    Launch(Vec<String>),

    // ========================================================================
    // Logs
    // ========================================================================
    /// A resource (log group, log stream, task) does not exist yet
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Stream error: {0}")]
    Stream(String),

    // ========================================================================
    // Local runtime
    // ========================================================================
    #[error("Docker error: {0}")]
    Docker(String),

    // ========================================================================
    // 실행 관련
    // ========================================================================
    #[error("Cancelled")]
    Cancelled,

    // ========================================================================
    // 외부 에러 변환
    // ========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    // ========================================================================
    // 기타
    // ========================================================================
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// 재시도 가능한 에러인지 확인
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout { .. } => true,
            Error::Api { code, .. } => THROTTLING_CODES.contains(&code.as_str()),
            _ => false,
        }
    }

    /// "Not yet available" class: drives retry loops instead of failing them
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) | Error::StackNotFound(_) => true,
            Error::Api { code, .. } => code == "ResourceNotFoundException",
            _ => false,
        }
    }

    /// 사용자에게 보여줄 수 있는 에러인지 확인
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::InvalidInput(_)
                | Error::Validation(_)
                | Error::NotFound(_)
                | Error::StackNotFound(_)
                | Error::Launch(_)
                | Error::Cancelled
        )
    }

    /// Control-plane error code, if any
    pub fn code(&self) -> Option<&str> {
        match self {
            Error::Api { code, .. } => Some(code),
            _ => None,
        }
    }

    /// API 에러 생성 헬퍼
    pub fn api(
        service: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Api {
            service: service.into(),
            code: code.into(),
            message: message.into(),
        }
    }

    /// Timeout 에러 생성 헬퍼
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Joins per-instance launch failures as `"<reason>: <detail>"` lines
    pub fn launch_failures<I, R, D>(failures: I) -> Self
    where
        I: IntoIterator<Item = (R, D)>,
        R: AsRef<str>,
        D: AsRef<str>,
    {
        Error::Launch(
            failures
                .into_iter()
                .map(|(reason, detail)| format!("{}: {}", reason.as_ref(), detail.as_ref()))
                .collect(),
        )
    }

    /// Joins several errors into one, preserving every message
    pub fn join(errors: Vec<Error>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.into_iter().next(),
            _ => Some(Error::Internal(
                errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("\n"),
            )),
        }
    }
}

// ============================================================================
// From 구현 (추가 변환)
// ============================================================================

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_failures_are_joined() {
        let err = Error::launch_failures(vec![
            ("capacity exceeded", "no FARGATE capacity in us-west-2a"),
            ("RESOURCE:MEMORY", "insufficient memory"),
        ]);
        assert_eq!(
            err.to_string(),
            "capacity exceeded: no FARGATE capacity in us-west-2a\nRESOURCE:MEMORY: insufficient memory"
        );
        assert!(err.is_user_facing());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::api("ecs", "ThrottlingException", "slow down").is_retryable());
        assert!(!Error::api("cloudformation", "ValidationError", "bad template").is_retryable());
        assert!(Error::timeout("create stack crun", Duration::from_secs(180)).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn test_not_found_classification() {
        assert!(Error::NotFound("log group".into()).is_not_found());
        assert!(Error::api("logs", "ResourceNotFoundException", "gone").is_not_found());
        assert!(!Error::Stream("broken pipe".into()).is_not_found());
    }

    #[test]
    fn test_join() {
        assert!(Error::join(vec![]).is_none());
        let single = Error::join(vec![Error::Cancelled]).unwrap();
        assert!(matches!(single, Error::Cancelled));
        let joined = Error::join(vec![Error::Stream("a".into()), Error::Stream("b".into())])
            .unwrap()
            .to_string();
        assert!(joined.contains("Stream error: a"));
        assert!(joined.contains("Stream error: b"));
    }
}

//! Aggregation error types
//!
//! Error codes:
//! - AERO_PIPELINE_UNSUPPORTED_STAGE (FALLBACK)
//! - AERO_EXPR_UNSUPPORTED (FALLBACK)
//! - AERO_EXPR_ARITY (ERROR)
//! - AERO_EXPR_TYPE_MISMATCH (ERROR)
//! - AERO_EXPR_INVALID (ERROR)
//! - AERO_PIPELINE_INVALID (ERROR)
//! - AERO_STORAGE_FAILED (ERROR)
//! - AERO_CLEANUP_FAILED (WARN)
//!
//! FALLBACK errors never reach a caller: every tier boundary converts them into
//! a [`FallbackSignal`] and the next tier takes over. ERROR codes are fatal and
//! surface unchanged. WARN codes are logged and swallowed.

use std::fmt;

use crate::storage::StoreError;

/// Severity levels for aggregation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The current tier cannot run this; a slower tier can
    Fallback,
    /// Logged only, never returned to the caller
    Warn,
    /// No tier can recover; returned to the caller
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Fallback => write!(f, "FALLBACK"),
            Severity::Warn => write!(f, "WARN"),
            Severity::Error => write!(f, "ERROR"),
        }
    }
}

/// Aggregation error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationErrorCode {
    /// Stage kind not supported by the current tier
    AeroPipelineUnsupportedStage,
    /// Expression not supported by the current tier
    AeroExprUnsupported,
    /// Operator called with the wrong number of arguments
    AeroExprArity,
    /// Operator called with an argument of the wrong type
    AeroExprTypeMismatch,
    /// Malformed expression (unknown operator, bad variable, bad shape)
    AeroExprInvalid,
    /// Malformed pipeline or stage definition
    AeroPipelineInvalid,
    /// Storage collaborator failure
    AeroStorageFailed,
    /// Temporary relation or scope could not be released
    AeroCleanupFailed,
}

impl AggregationErrorCode {
    /// Returns the string code
    pub fn code(&self) -> &'static str {
        match self {
            AggregationErrorCode::AeroPipelineUnsupportedStage => "AERO_PIPELINE_UNSUPPORTED_STAGE",
            AggregationErrorCode::AeroExprUnsupported => "AERO_EXPR_UNSUPPORTED",
            AggregationErrorCode::AeroExprArity => "AERO_EXPR_ARITY",
            AggregationErrorCode::AeroExprTypeMismatch => "AERO_EXPR_TYPE_MISMATCH",
            AggregationErrorCode::AeroExprInvalid => "AERO_EXPR_INVALID",
            AggregationErrorCode::AeroPipelineInvalid => "AERO_PIPELINE_INVALID",
            AggregationErrorCode::AeroStorageFailed => "AERO_STORAGE_FAILED",
            AggregationErrorCode::AeroCleanupFailed => "AERO_CLEANUP_FAILED",
        }
    }

    /// Parses a string code back into an error code
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "AERO_PIPELINE_UNSUPPORTED_STAGE" => Some(AggregationErrorCode::AeroPipelineUnsupportedStage),
            "AERO_EXPR_UNSUPPORTED" => Some(AggregationErrorCode::AeroExprUnsupported),
            "AERO_EXPR_ARITY" => Some(AggregationErrorCode::AeroExprArity),
            "AERO_EXPR_TYPE_MISMATCH" => Some(AggregationErrorCode::AeroExprTypeMismatch),
            "AERO_EXPR_INVALID" => Some(AggregationErrorCode::AeroExprInvalid),
            "AERO_PIPELINE_INVALID" => Some(AggregationErrorCode::AeroPipelineInvalid),
            "AERO_STORAGE_FAILED" => Some(AggregationErrorCode::AeroStorageFailed),
            "AERO_CLEANUP_FAILED" => Some(AggregationErrorCode::AeroCleanupFailed),
            _ => None,
        }
    }

    /// Returns the severity level for this error
    pub fn severity(&self) -> Severity {
        match self {
            AggregationErrorCode::AeroPipelineUnsupportedStage
            | AggregationErrorCode::AeroExprUnsupported => Severity::Fallback,
            AggregationErrorCode::AeroCleanupFailed => Severity::Warn,
            _ => Severity::Error,
        }
    }
}

impl fmt::Display for AggregationErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Aggregation error with full context
#[derive(Debug)]
pub struct AggregationError {
    /// Error code
    code: AggregationErrorCode,
    /// Human-readable message
    message: String,
    /// Underlying storage error, if any
    source: Option<StoreError>,
}

impl AggregationError {
    /// Create an unsupported stage error (non-fatal)
    pub fn unsupported_stage(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            code: AggregationErrorCode::AeroPipelineUnsupportedStage,
            message: format!("{}: {}", stage.into(), reason.into()),
            source: None,
        }
    }

    /// Create an unsupported expression error (non-fatal)
    pub fn unsupported_expression(reason: impl Into<String>) -> Self {
        Self {
            code: AggregationErrorCode::AeroExprUnsupported,
            message: reason.into(),
            source: None,
        }
    }

    /// Create an arity error
    pub fn arity(operator: &str, expected: impl fmt::Display, actual: usize) -> Self {
        Self {
            code: AggregationErrorCode::AeroExprArity,
            message: format!("{} expects {} argument(s), got {}", operator, expected, actual),
            source: None,
        }
    }

    /// Create a type mismatch error
    pub fn type_mismatch(operator: &str, reason: impl Into<String>) -> Self {
        Self {
            code: AggregationErrorCode::AeroExprTypeMismatch,
            message: format!("{}: {}", operator, reason.into()),
            source: None,
        }
    }

    /// Create an invalid expression error
    pub fn invalid_expression(reason: impl Into<String>) -> Self {
        Self {
            code: AggregationErrorCode::AeroExprInvalid,
            message: reason.into(),
            source: None,
        }
    }

    /// Create an invalid pipeline error
    pub fn invalid_pipeline(reason: impl Into<String>) -> Self {
        Self {
            code: AggregationErrorCode::AeroPipelineInvalid,
            message: reason.into(),
            source: None,
        }
    }

    /// Create a storage error
    pub fn storage(source: StoreError) -> Self {
        Self {
            code: AggregationErrorCode::AeroStorageFailed,
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a cleanup failure
    pub fn cleanup_failed(reason: impl Into<String>) -> Self {
        Self {
            code: AggregationErrorCode::AeroCleanupFailed,
            message: reason.into(),
            source: None,
        }
    }

    /// Returns the error code
    pub fn code(&self) -> AggregationErrorCode {
        self.code
    }

    /// Returns the severity level
    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    /// Returns the error message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns whether a slower tier may retry the work
    pub fn is_fallback(&self) -> bool {
        self.severity() == Severity::Fallback
    }

    /// Returns whether this error must reach the caller
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Error
    }
}

impl fmt::Display for AggregationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.code.severity(),
            self.code.code(),
            self.message
        )
    }
}

impl std::error::Error for AggregationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<StoreError> for AggregationError {
    fn from(err: StoreError) -> Self {
        // Type errors raised from inside SQL keep their expression code
        if let StoreError::Raised { code, message } = &err {
            if let Some(code) = AggregationErrorCode::from_code(code) {
                return Self {
                    code,
                    message: message.clone(),
                    source: None,
                };
            }
        }
        Self::storage(err)
    }
}

/// Result type for aggregation operations
pub type AggregationResult<T> = Result<T, AggregationError>;

/// Why a tier declined to run a pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackSignal {
    /// Code of the non-fatal error that triggered the fallback
    code: AggregationErrorCode,
    /// Human-readable reason
    reason: String,
}

impl FallbackSignal {
    /// Create a signal with the given reason
    pub fn new(code: AggregationErrorCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Signal raised when a pipeline has more stages than the SQL tier allows
    pub fn stage_limit(stages: usize, max: usize) -> Self {
        Self::new(
            AggregationErrorCode::AeroPipelineUnsupportedStage,
            format!("pipeline has {} stages, SQL tier limit is {}", stages, max),
        )
    }

    /// Returns the triggering code
    pub fn code(&self) -> AggregationErrorCode {
        self.code
    }

    /// Returns the reason
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl fmt::Display for FallbackSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.reason)
    }
}

/// Outcome of a failed tier attempt
#[derive(Debug)]
pub enum TierError {
    /// The tier cannot run the pipeline; try the next one
    Fallback(FallbackSignal),
    /// The pipeline cannot run on any tier
    Fatal(AggregationError),
}

impl TierError {
    /// Returns the fallback signal, if this is one
    pub fn as_fallback(&self) -> Option<&FallbackSignal> {
        match self {
            TierError::Fallback(signal) => Some(signal),
            TierError::Fatal(_) => None,
        }
    }
}

impl From<AggregationError> for TierError {
    fn from(err: AggregationError) -> Self {
        if err.is_fallback() {
            TierError::Fallback(FallbackSignal::new(err.code, err.message))
        } else {
            TierError::Fatal(err)
        }
    }
}

impl From<FallbackSignal> for TierError {
    fn from(signal: FallbackSignal) -> Self {
        TierError::Fallback(signal)
    }
}

impl From<StoreError> for TierError {
    fn from(err: StoreError) -> Self {
        // Engine limits are not data errors; a slower tier can still run
        if err.is_limit() {
            return TierError::Fallback(FallbackSignal::new(
                AggregationErrorCode::AeroPipelineUnsupportedStage,
                err.to_string(),
            ));
        }
        TierError::from(AggregationError::from(err))
    }
}

impl fmt::Display for TierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TierError::Fallback(signal) => write!(f, "[FALLBACK] {}", signal),
            TierError::Fatal(err) => write!(f, "{}", err),
        }
    }
}

/// Result type for a single tier attempt
pub type TierResult<T> = Result<T, TierError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_round_trip() {
        let codes = [
            AggregationErrorCode::AeroPipelineUnsupportedStage,
            AggregationErrorCode::AeroExprUnsupported,
            AggregationErrorCode::AeroExprArity,
            AggregationErrorCode::AeroExprTypeMismatch,
            AggregationErrorCode::AeroExprInvalid,
            AggregationErrorCode::AeroPipelineInvalid,
            AggregationErrorCode::AeroStorageFailed,
            AggregationErrorCode::AeroCleanupFailed,
        ];
        for code in codes {
            assert_eq!(AggregationErrorCode::from_code(code.code()), Some(code));
        }
    }

    #[test]
    fn test_unsupported_is_fallback() {
        let err = AggregationError::unsupported_expression("$map");
        assert!(err.is_fallback());
        assert!(!err.is_fatal());

        let err = AggregationError::unsupported_stage("$facet", "nested");
        assert!(err.is_fallback());
    }

    #[test]
    fn test_arity_and_type_are_fatal() {
        assert!(AggregationError::arity("$divide", 2, 3).is_fatal());
        assert!(AggregationError::type_mismatch("$add", "string operand").is_fatal());
        assert!(AggregationError::invalid_pipeline("bad stage").is_fatal());
    }

    #[test]
    fn test_cleanup_is_warn() {
        let err = AggregationError::cleanup_failed("drop failed");
        assert_eq!(err.severity(), Severity::Warn);
        assert!(!err.is_fatal());
        assert!(!err.is_fallback());
    }

    #[test]
    fn test_tier_error_classification() {
        let tier: TierError = AggregationError::unsupported_expression("$filter").into();
        assert!(tier.as_fallback().is_some());

        let tier: TierError = AggregationError::type_mismatch("$add", "x").into();
        assert!(matches!(tier, TierError::Fatal(_)));
    }

    #[test]
    fn test_raised_store_error_keeps_code() {
        let store = StoreError::Raised {
            code: "AERO_EXPR_TYPE_MISMATCH".into(),
            message: "$add: non-numeric operand".into(),
        };
        let err = AggregationError::from(store);
        assert_eq!(err.code(), AggregationErrorCode::AeroExprTypeMismatch);
    }

    #[test]
    fn test_error_display() {
        let err = AggregationError::arity("$cond", 3, 2);
        let display = format!("{}", err);
        assert!(display.contains("AERO_EXPR_ARITY"));
        assert!(display.contains("ERROR"));
        assert!(display.contains("$cond"));
    }
}

/// Unified error types for the TuneTrail serving plane
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Main error type for the API
#[derive(Error, Debug)]
pub enum ApiError {
    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Request body or parameter validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Authorization header present but not parseable as either credential
    #[error("Malformed credential")]
    MalformedCredential,

    /// Credential did not resolve to any principal
    #[error("Unknown credential")]
    UnknownCredential,

    /// API key has been revoked
    #[error("Credential revoked")]
    RevokedCredential,

    /// Session token or API key past its expiry
    #[error("Credential expired")]
    ExpiredCredential,

    /// Caller IP not in the key's allowlist
    #[error("IP address not allowed")]
    IpNotAllowed,

    /// Principal lacks a required scope
    #[error("Insufficient scope: requires {required}")]
    ScopeInsufficient { required: String },

    /// Operation requires a higher plan
    #[error("Plan upgrade required")]
    PlanUpgradeRequired {
        current_plan: String,
        required_plans: Vec<String>,
        feature_description: String,
    },

    /// Named feature flag not included in the plan
    #[error("Feature not in plan: {feature}")]
    FeatureNotInPlan { feature: String, current_plan: String },

    /// A metered quota bucket is exhausted for the current window
    #[error("Quota exceeded for {bucket}")]
    QuotaExceeded { bucket: String, retry_after_secs: i64 },

    /// Client sequence number regressed within a session
    #[error("Stale event: expected sequence > {last_seq}")]
    StaleEvent { last_seq: i64 },

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Conflict errors (e.g., duplicate email)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Recommendation engine unreachable and no stale entry to serve
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Internal server errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error envelope returned to clients. Clients branch on `error`, not `message`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upgrade_url: Option<String>,
}

pub const UPGRADE_URL: &str = "https://tunetrail.app/pricing";

impl ApiError {
    /// Stable kind string; part of the public contract.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "VALIDATION_FAILED",
            ApiError::MalformedCredential => "MALFORMED_CREDENTIAL",
            ApiError::UnknownCredential => "UNKNOWN_CREDENTIAL",
            ApiError::RevokedCredential => "REVOKED_CREDENTIAL",
            ApiError::ExpiredCredential => "EXPIRED_CREDENTIAL",
            ApiError::IpNotAllowed => "IP_NOT_ALLOWED",
            ApiError::ScopeInsufficient { .. } => "SCOPE_INSUFFICIENT",
            ApiError::PlanUpgradeRequired { .. } => "PLAN_UPGRADE_REQUIRED",
            ApiError::FeatureNotInPlan { .. } => "FEATURE_NOT_IN_PLAN",
            ApiError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            ApiError::StaleEvent { .. } => "STALE_EVENT",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            ApiError::Database(_) | ApiError::Internal(_) | ApiError::Io(_) => "INTERNAL",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::MalformedCredential
            | ApiError::UnknownCredential
            | ApiError::RevokedCredential
            | ApiError::ExpiredCredential => StatusCode::UNAUTHORIZED,
            ApiError::IpNotAllowed | ApiError::ScopeInsufficient { .. } => StatusCode::FORBIDDEN,
            ApiError::PlanUpgradeRequired { .. } | ApiError::FeatureNotInPlan { .. } => {
                StatusCode::PAYMENT_REQUIRED
            }
            ApiError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::StaleEvent { .. } | ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Database(_) | ApiError::Internal(_) | ApiError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn envelope(&self) -> ErrorEnvelope {
        let mut envelope = ErrorEnvelope {
            error: self.kind().to_string(),
            message: self.to_string(),
            details: None,
            retry_after: None,
            upgrade_url: None,
        };

        match self {
            ApiError::PlanUpgradeRequired {
                current_plan,
                required_plans,
                feature_description,
            } => {
                envelope.upgrade_url = Some(UPGRADE_URL.to_string());
                envelope.details = Some(serde_json::json!({
                    "current_plan": current_plan,
                    "required_plans": required_plans,
                    "feature_description": feature_description,
                }));
            }
            ApiError::FeatureNotInPlan { feature, current_plan } => {
                envelope.upgrade_url = Some(UPGRADE_URL.to_string());
                envelope.details = Some(serde_json::json!({
                    "feature": feature,
                    "current_plan": current_plan,
                }));
            }
            ApiError::QuotaExceeded { bucket, retry_after_secs } => {
                envelope.retry_after = Some(*retry_after_secs);
                envelope.details = Some(serde_json::json!({ "bucket": bucket }));
            }
            ApiError::StaleEvent { last_seq } => {
                envelope.details = Some(serde_json::json!({ "last_seq": last_seq }));
            }
            // Don't leak internals
            ApiError::Database(_) | ApiError::Internal(_) | ApiError::Io(_) => {
                envelope.message = "Internal server error".to_string();
            }
            _ => {}
        }

        envelope
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
        }

        let envelope = self.envelope();
        let mut response = (status, Json(envelope)).into_response();

        if let ApiError::QuotaExceeded { retry_after_secs, .. } = self {
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
        }

        response
    }
}

/// Result type alias for API operations
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(ApiError::MalformedCredential.kind(), "MALFORMED_CREDENTIAL");
        assert_eq!(
            ApiError::QuotaExceeded { bucket: "api_calls_per_minute".into(), retry_after_secs: 12 }
                .kind(),
            "QUOTA_EXCEEDED"
        );
        assert_eq!(ApiError::Internal("boom".into()).kind(), "INTERNAL");
    }

    #[test]
    fn status_mapping_follows_contract() {
        assert_eq!(
            ApiError::PlanUpgradeRequired {
                current_plan: "free".into(),
                required_plans: vec!["starter".into()],
                feature_description: "Daily mixes".into(),
            }
            .status(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(ApiError::StaleEvent { last_seq: 4 }.status(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError::UpstreamUnavailable("engine timeout".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn internal_errors_do_not_leak() {
        let envelope = ApiError::Internal("connection string with password".into()).envelope();
        assert_eq!(envelope.message, "Internal server error");
    }

    #[test]
    fn quota_envelope_carries_retry_after() {
        let envelope = ApiError::QuotaExceeded {
            bucket: "audio_analysis_per_day".into(),
            retry_after_secs: 3600,
        }
        .envelope();
        assert_eq!(envelope.retry_after, Some(3600));
    }
}

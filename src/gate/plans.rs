/// Plan limit matrix and operation gating tables
///
/// Single source of truth for which operation needs which plan, feature
/// flag, scope, and quota buckets.
use crate::db::models::Plan;

/// Per-plan usage limits. `None` means unlimited.
#[derive(Debug, Clone, Copy)]
pub struct PlanLimits {
    pub api_calls_per_day: Option<i64>,
    pub audio_analysis_per_day: Option<i64>,
    pub model_training_per_month: Option<i64>,
    pub webhook_deliveries_per_month: Option<i64>,
    pub advanced_analytics: bool,
    pub usage_analytics: bool,
}

impl PlanLimits {
    pub fn for_plan(plan: Plan) -> PlanLimits {
        match plan {
            // Community self-hosted installs are not metered
            Plan::Free => PlanLimits {
                api_calls_per_day: None,
                audio_analysis_per_day: None,
                model_training_per_month: None,
                webhook_deliveries_per_month: Some(0),
                advanced_analytics: false,
                usage_analytics: false,
            },
            Plan::Starter => PlanLimits {
                api_calls_per_day: Some(10_000),
                audio_analysis_per_day: Some(100),
                model_training_per_month: Some(1),
                webhook_deliveries_per_month: Some(0),
                advanced_analytics: false,
                usage_analytics: true,
            },
            Plan::Pro => PlanLimits {
                api_calls_per_day: Some(100_000),
                audio_analysis_per_day: Some(1_000),
                model_training_per_month: Some(10),
                webhook_deliveries_per_month: Some(10_000),
                advanced_analytics: true,
                usage_analytics: true,
            },
            Plan::Enterprise => PlanLimits {
                api_calls_per_day: None,
                audio_analysis_per_day: None,
                model_training_per_month: None,
                webhook_deliveries_per_month: None,
                advanced_analytics: true,
                usage_analytics: true,
            },
        }
    }

    pub fn bucket_limit(&self, bucket: &str) -> Option<i64> {
        match bucket {
            "api_calls_per_day" => self.api_calls_per_day,
            "audio_analysis_per_day" => self.audio_analysis_per_day,
            "model_training_per_month" => self.model_training_per_month,
            "webhook_deliveries_per_month" => self.webhook_deliveries_per_month,
            _ => None,
        }
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        match feature {
            "advanced_analytics" => self.advanced_analytics,
            "usage_analytics" => self.usage_analytics,
            _ => false,
        }
    }
}

/// Fixed counting windows for quota buckets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    Minute,
    Hour,
    Day,
    Month,
}

impl Window {
    pub fn as_str(&self) -> &'static str {
        match self {
            Window::Minute => "minute",
            Window::Hour => "hour",
            Window::Day => "day",
            Window::Month => "month",
        }
    }

    /// TTL used for the backing counter key.
    pub fn ttl_secs(&self) -> u64 {
        match self {
            Window::Minute => 60,
            Window::Hour => 3_600,
            Window::Day => 86_400,
            Window::Month => 31 * 86_400,
        }
    }

    pub fn for_bucket(bucket: &str) -> Window {
        if bucket.ends_with("per_minute") {
            Window::Minute
        } else if bucket.ends_with("per_hour") {
            Window::Hour
        } else if bucket.ends_with("per_month") {
            Window::Month
        } else {
            Window::Day
        }
    }
}

/// What an operation needs before it may run.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceDescriptor {
    pub operation: &'static str,
    pub scope: Option<&'static str>,
    pub required_plans: Option<&'static [Plan]>,
    pub feature_description: &'static str,
    pub feature_flag: Option<&'static str>,
    pub quota_buckets: &'static [&'static str],
    /// Fail closed on cache outage for pro/enterprise callers.
    pub sensitive: bool,
}

pub const STARTER_PLANS: &[Plan] = &[Plan::Starter, Plan::Pro, Plan::Enterprise];
pub const PRO_PLANS: &[Plan] = &[Plan::Pro, Plan::Enterprise];

pub const RECOMMENDATIONS: ResourceDescriptor = ResourceDescriptor {
    operation: "recommendations.personal",
    scope: Some("read:recommendations"),
    required_plans: None,
    feature_description: "Personalized recommendations",
    feature_flag: None,
    quota_buckets: &["api_calls_per_day"],
    sensitive: false,
};

pub const SIMILAR_TRACKS: ResourceDescriptor = ResourceDescriptor {
    operation: "recommendations.similar",
    scope: Some("read:recommendations"),
    required_plans: None,
    feature_description: "Similar-track lookup",
    feature_flag: None,
    quota_buckets: &["api_calls_per_day"],
    sensitive: false,
};

pub const DAILY_MIX: ResourceDescriptor = ResourceDescriptor {
    operation: "recommendations.daily_mix",
    scope: Some("read:recommendations"),
    required_plans: Some(STARTER_PLANS),
    feature_description: "Daily mixes",
    feature_flag: None,
    quota_buckets: &["api_calls_per_day"],
    sensitive: false,
};

pub const RADIO: ResourceDescriptor = ResourceDescriptor {
    operation: "recommendations.radio",
    scope: Some("read:recommendations"),
    required_plans: Some(STARTER_PLANS),
    feature_description: "Radio stations",
    feature_flag: None,
    quota_buckets: &["api_calls_per_day"],
    sensitive: false,
};

pub const TASTE_PROFILE: ResourceDescriptor = ResourceDescriptor {
    operation: "recommendations.taste_profile",
    scope: Some("read:recommendations"),
    required_plans: Some(PRO_PLANS),
    feature_description: "Taste profile analysis",
    feature_flag: None,
    quota_buckets: &["api_calls_per_day"],
    sensitive: true,
};

pub const FEEDBACK: ResourceDescriptor = ResourceDescriptor {
    operation: "recommendations.feedback",
    scope: Some("write:interactions"),
    required_plans: None,
    feature_description: "Recommendation feedback",
    feature_flag: None,
    quota_buckets: &["api_calls_per_day"],
    sensitive: false,
};

pub const AUDIO_ANALYZE: ResourceDescriptor = ResourceDescriptor {
    operation: "audio.analyze",
    scope: Some("write:audio"),
    required_plans: None,
    feature_description: "Audio analysis",
    feature_flag: None,
    quota_buckets: &["api_calls_per_day", "audio_analysis_per_day"],
    sensitive: true,
};

pub const INTERACTIONS_WRITE: ResourceDescriptor = ResourceDescriptor {
    operation: "interactions.write",
    scope: Some("write:interactions"),
    required_plans: None,
    feature_description: "Interaction ingestion",
    feature_flag: None,
    quota_buckets: &["api_calls_per_day"],
    sensitive: false,
};

pub const SESSIONS_WRITE: ResourceDescriptor = ResourceDescriptor {
    operation: "sessions.write",
    scope: Some("write:sessions"),
    required_plans: None,
    feature_description: "Listening sessions",
    feature_flag: None,
    quota_buckets: &["api_calls_per_day"],
    sensitive: false,
};

pub const SESSIONS_READ: ResourceDescriptor = ResourceDescriptor {
    operation: "sessions.read",
    scope: Some("read:sessions"),
    required_plans: None,
    feature_description: "Listening sessions",
    feature_flag: None,
    quota_buckets: &["api_calls_per_day"],
    sensitive: false,
};

pub const TELEMETRY_WRITE: ResourceDescriptor = ResourceDescriptor {
    operation: "telemetry.write",
    scope: Some("write:interactions"),
    required_plans: None,
    feature_description: "Telemetry ingestion",
    feature_flag: None,
    quota_buckets: &["api_calls_per_day"],
    sensitive: false,
};

pub const KEYS_MANAGE: ResourceDescriptor = ResourceDescriptor {
    operation: "api_keys.manage",
    scope: Some("manage:keys"),
    required_plans: None,
    feature_description: "API key management",
    feature_flag: None,
    quota_buckets: &[],
    sensitive: false,
};

pub const KEYS_USAGE: ResourceDescriptor = ResourceDescriptor {
    operation: "api_keys.usage",
    scope: Some("read:usage"),
    required_plans: Some(STARTER_PLANS),
    feature_description: "API key usage analytics",
    feature_flag: Some("usage_analytics"),
    quota_buckets: &[],
    sensitive: false,
};

/// Scopes implied by a session token, per role.
pub fn role_scopes(role: crate::db::models::Role) -> Vec<String> {
    use crate::db::models::Role;
    match role {
        Role::Admin | Role::Owner => vec!["*".to_string()],
        Role::User => [
            "read:recommendations",
            "read:sessions",
            "write:sessions",
            "write:interactions",
            "write:audio",
            "manage:keys",
            "read:usage",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect(),
    }
}

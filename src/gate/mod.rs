/// Quota & rate gate
///
/// Three layers evaluated in order: plan gate, feature gate, fixed-window
/// quota counters on the cache. All windows for an operation must pass.

pub mod plans;
pub mod public;

use crate::auth::{AuthMethod, Principal};
use crate::cache::{keys, Cache};
use crate::clock::SharedClock;
use crate::db::models::Plan;
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use plans::{PlanLimits, ResourceDescriptor, Window};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Advisory rate-limit values for the most-constrained active window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub limit: i64,
    pub remaining: i64,
    pub reset_unix: i64,
}

pub struct QuotaGate {
    cache: Arc<dyn Cache>,
    clock: SharedClock,
}

impl QuotaGate {
    pub fn new(cache: Arc<dyn Cache>, clock: SharedClock) -> Self {
        Self { cache, clock }
    }

    /// Evaluate every gate layer. `Ok(Some(info))` carries header values when
    /// at least one metered window applied.
    pub async fn check(
        &self,
        principal: &Principal,
        descriptor: &ResourceDescriptor,
    ) -> ApiResult<Option<RateLimitInfo>> {
        // (a) plan gate
        if let Some(required) = descriptor.required_plans {
            if !required.contains(&principal.plan) {
                metrics::GATE_DENIALS_TOTAL.with_label_values(&["plan"]).inc();
                return Err(ApiError::PlanUpgradeRequired {
                    current_plan: principal.plan.as_str().to_string(),
                    required_plans: required.iter().map(|p| p.as_str().to_string()).collect(),
                    feature_description: descriptor.feature_description.to_string(),
                });
            }
        }

        // (b) feature gate; org-level overrides beat the plan default
        if let Some(feature) = descriptor.feature_flag {
            let enabled = principal
                .feature_overrides
                .get(feature)
                .copied()
                .unwrap_or_else(|| PlanLimits::for_plan(principal.plan).has_feature(feature));
            if !enabled {
                metrics::GATE_DENIALS_TOTAL.with_label_values(&["feature"]).inc();
                return Err(ApiError::FeatureNotInPlan {
                    feature: feature.to_string(),
                    current_plan: principal.plan.as_str().to_string(),
                });
            }
        }

        // (c) quota gate
        let now = self.clock.now();
        let limits = PlanLimits::for_plan(principal.plan);
        let mut most_constrained: Option<RateLimitInfo> = None;

        for bucket in descriptor.quota_buckets {
            let live_limit = limits.bucket_limit(bucket);
            let window = Window::for_bucket(bucket);
            let info = self
                .count_window(
                    principal,
                    descriptor,
                    bucket,
                    principal.org_id,
                    window,
                    live_limit,
                    now,
                )
                .await?;
            merge_constrained(&mut most_constrained, info);
        }

        // API-key carriers additionally meter their own per-window limits
        if principal.auth_method == AuthMethod::ApiKey {
            if let Some(key_limits) = &principal.key_limits {
                let key_id = principal.key_id.unwrap_or(principal.user_id);
                let windows = [
                    ("api_key_per_minute", Window::Minute, key_limits.per_minute),
                    ("api_key_per_hour", Window::Hour, key_limits.per_hour),
                    ("api_key_per_day", Window::Day, key_limits.per_day),
                ];
                for (bucket, window, limit) in windows {
                    let info = self
                        .count_window(
                            principal,
                            descriptor,
                            bucket,
                            key_id,
                            window,
                            Some(limit),
                            now,
                        )
                        .await?;
                    merge_constrained(&mut most_constrained, info);
                }
            }
        }

        Ok(most_constrained)
    }

    #[allow(clippy::too_many_arguments)]
    async fn count_window(
        &self,
        principal: &Principal,
        descriptor: &ResourceDescriptor,
        bucket: &str,
        scope_id: Uuid,
        window: Window,
        live_limit: Option<i64>,
        now: DateTime<Utc>,
    ) -> ApiResult<Option<RateLimitInfo>> {
        let quantum = window_quantum(window, now);
        let key = keys::quota(bucket, scope_id, window.as_str(), quantum);
        let limit_key = keys::quota_limit(bucket, scope_id, window.as_str(), quantum);
        let ttl = Duration::from_secs(window.ttl_secs());
        let reset = window_reset(window, now);

        // The limit judged against is the one recorded when this window's
        // counter was created; a plan change mid-window takes effect at the
        // next boundary, and already-consumed quota is never refunded.
        let Some(limit) = self.window_limit(&limit_key, live_limit, ttl).await else {
            return Ok(None);
        };

        let count = match self.cache.incr(&key, 1, ttl).await {
            Ok(count) => count,
            Err(e) => {
                // Cache outage: free/starter fail open, premium sensitive
                // operations fail closed.
                if descriptor.sensitive && principal.plan >= Plan::Pro {
                    return Err(ApiError::UpstreamUnavailable(
                        "quota backend unavailable".to_string(),
                    ));
                }
                tracing::warn!(bucket, error = %e, "quota cache unavailable; admitting request");
                metrics::QUOTA_FAIL_OPEN_TOTAL.inc();
                return Ok(None);
            }
        };

        if count > limit {
            metrics::GATE_DENIALS_TOTAL.with_label_values(&["quota"]).inc();
            let retry_after_secs = (reset - now).num_seconds().max(0);
            return Err(ApiError::QuotaExceeded {
                bucket: bucket.to_string(),
                retry_after_secs,
            });
        }

        Ok(Some(RateLimitInfo {
            limit,
            remaining: (limit - count).max(0),
            reset_unix: reset.timestamp(),
        }))
    }

    /// Resolve the limit in force for the open window. The first caller of
    /// a window stamps the live limit next to the counter; everyone after
    /// reads the stamp. Snapshot-infrastructure failures fall back to the
    /// live limit and leave outage policy to the counter increment.
    async fn window_limit(
        &self,
        limit_key: &str,
        live_limit: Option<i64>,
        ttl: Duration,
    ) -> Option<i64> {
        match live_limit {
            Some(live) => {
                match self
                    .cache
                    .compare_and_swap(limit_key, None, &live.to_string(), Some(ttl))
                    .await
                {
                    Ok(true) => Some(live),
                    Ok(false) => match self.cache.get(limit_key).await {
                        Ok(Some(raw)) => raw.parse().ok().or(Some(live)),
                        _ => Some(live),
                    },
                    Err(_) => Some(live),
                }
            }
            // Unlimited under the live plan, but a metered window that is
            // already open keeps its recorded limit until the boundary.
            None => match self.cache.get(limit_key).await {
                Ok(Some(raw)) => raw.parse().ok(),
                _ => None,
            },
        }
    }
}

fn merge_constrained(current: &mut Option<RateLimitInfo>, candidate: Option<RateLimitInfo>) {
    if let Some(info) = candidate {
        match current {
            Some(existing) if existing.remaining <= info.remaining => {}
            _ => *current = Some(info),
        }
    }
}

/// Window-aligned counter quantum.
fn window_quantum(window: Window, now: DateTime<Utc>) -> i64 {
    let ts = now.timestamp();
    match window {
        Window::Minute => ts / 60,
        Window::Hour => ts / 3_600,
        Window::Day => ts / 86_400,
        Window::Month => (now.year() as i64) * 12 + now.month0() as i64,
    }
}

/// Start of the next window; quotas reset here.
fn window_reset(window: Window, now: DateTime<Utc>) -> DateTime<Utc> {
    let ts = now.timestamp();
    match window {
        Window::Minute => Utc.timestamp_opt((ts / 60 + 1) * 60, 0).unwrap(),
        Window::Hour => Utc.timestamp_opt((ts / 3_600 + 1) * 3_600, 0).unwrap(),
        Window::Day => Utc.timestamp_opt((ts / 86_400 + 1) * 86_400, 0).unwrap(),
        Window::Month => {
            let (year, month) = if now.month() == 12 {
                (now.year() + 1, 1)
            } else {
                (now.year(), now.month() + 1)
            };
            Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).unwrap()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::KeyLimits;
    use crate::cache::MemoryCache;
    use crate::clock::ManualClock;
    use chrono::Duration as ChronoDuration;
    use std::collections::HashMap;

    fn principal(plan: Plan) -> Principal {
        Principal {
            user_id: Uuid::from_u128(1),
            org_id: Uuid::from_u128(2),
            plan,
            scopes: vec!["*".to_string()],
            auth_method: AuthMethod::SessionToken,
            key_id: None,
            key_limits: None,
            feature_overrides: HashMap::new(),
        }
    }

    fn gate_at(now: DateTime<Utc>) -> (QuotaGate, Arc<MemoryCache>) {
        let cache = Arc::new(MemoryCache::new());
        let clock = Arc::new(ManualClock::new(now));
        (QuotaGate::new(cache.clone(), clock), cache)
    }

    #[tokio::test]
    async fn plan_gate_denies_free_caller() {
        let now = Utc.with_ymd_and_hms(2025, 7, 1, 10, 0, 0).unwrap();
        let (gate, _) = gate_at(now);

        let err = gate
            .check(&principal(Plan::Free), &plans::DAILY_MIX)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "PLAN_UPGRADE_REQUIRED");
    }

    #[tokio::test]
    async fn feature_override_unlocks_gated_feature() {
        let now = Utc.with_ymd_and_hms(2025, 7, 1, 10, 0, 0).unwrap();
        let (gate, _) = gate_at(now);

        let mut caller = principal(Plan::Starter);
        // usage_analytics is on for starter; advanced_analytics is not
        let descriptor = ResourceDescriptor {
            operation: "analytics.read",
            feature_flag: Some("advanced_analytics"),
            feature_description: "Advanced analytics",
            ..Default::default()
        };
        assert!(gate.check(&caller, &descriptor).await.is_err());

        caller.feature_overrides.insert("advanced_analytics".to_string(), true);
        assert!(gate.check(&caller, &descriptor).await.is_ok());
    }

    #[tokio::test]
    async fn quota_denies_exactly_once_past_limit() {
        let now = Utc.with_ymd_and_hms(2025, 7, 1, 10, 0, 0).unwrap();
        let (gate, _) = gate_at(now);
        let caller = principal(Plan::Starter);

        // audio_analysis_per_day = 100 for starter
        for _ in 0..100 {
            gate.check(&caller, &plans::AUDIO_ANALYZE).await.unwrap();
        }
        let err = gate.check(&caller, &plans::AUDIO_ANALYZE).await.unwrap_err();
        assert_eq!(err.kind(), "QUOTA_EXCEEDED");
    }

    #[tokio::test]
    async fn retry_after_is_seconds_to_window_boundary() {
        // 23:50 UTC: next UTC midnight is 600 seconds away
        let now = Utc.with_ymd_and_hms(2025, 7, 1, 23, 50, 0).unwrap();
        let (gate, _) = gate_at(now);
        let caller = principal(Plan::Starter);

        for _ in 0..100 {
            gate.check(&caller, &plans::AUDIO_ANALYZE).await.unwrap();
        }
        match gate.check(&caller, &plans::AUDIO_ANALYZE).await.unwrap_err() {
            ApiError::QuotaExceeded { retry_after_secs, .. } => {
                assert_eq!(retry_after_secs, 600);
            }
            other => panic!("expected quota denial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn downgrade_mid_window_keeps_window_start_limit() {
        let start = Utc.with_ymd_and_hms(2025, 7, 1, 10, 0, 0).unwrap();
        let cache = Arc::new(MemoryCache::new());
        let clock = Arc::new(ManualClock::new(start));
        let gate = QuotaGate::new(cache, clock.clone());

        // Pro consumes well past the starter cap inside the day
        let pro = principal(Plan::Pro);
        for _ in 0..150 {
            gate.check(&pro, &plans::AUDIO_ANALYZE).await.unwrap();
        }

        // The downgrade lands mid-window: the caller is judged against the
        // limit recorded at window start, not the new one
        let starter = principal(Plan::Starter);
        let info = gate
            .check(&starter, &plans::AUDIO_ANALYZE)
            .await
            .unwrap()
            .expect("metered window");
        assert_eq!(info.limit, 1_000);
        assert_eq!(info.remaining, 1_000 - 151);

        // Next UTC day the starter limit takes over from a fresh counter
        clock.advance(ChronoDuration::days(1));
        for _ in 0..100 {
            gate.check(&starter, &plans::AUDIO_ANALYZE).await.unwrap();
        }
        let err = gate.check(&starter, &plans::AUDIO_ANALYZE).await.unwrap_err();
        assert_eq!(err.kind(), "QUOTA_EXCEEDED");
    }

    #[tokio::test]
    async fn upgrade_to_unlimited_mid_window_keeps_recorded_limit() {
        let start = Utc.with_ymd_and_hms(2025, 7, 1, 10, 0, 0).unwrap();
        let cache = Arc::new(MemoryCache::new());
        let clock = Arc::new(ManualClock::new(start));
        let gate = QuotaGate::new(cache, clock.clone());

        // Exhaust the starter audio quota
        let starter = principal(Plan::Starter);
        for _ in 0..100 {
            gate.check(&starter, &plans::AUDIO_ANALYZE).await.unwrap();
        }

        // Enterprise is unlimited, but the open window keeps its limit
        let enterprise = principal(Plan::Enterprise);
        let err = gate
            .check(&enterprise, &plans::AUDIO_ANALYZE)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "QUOTA_EXCEEDED");

        // The boundary clears it
        clock.advance(ChronoDuration::days(1));
        let info = gate.check(&enterprise, &plans::AUDIO_ANALYZE).await.unwrap();
        assert!(info.is_none());
    }

    #[tokio::test]
    async fn unlimited_buckets_pass_without_headers() {
        let now = Utc.with_ymd_and_hms(2025, 7, 1, 10, 0, 0).unwrap();
        let (gate, _) = gate_at(now);

        let info = gate
            .check(&principal(Plan::Enterprise), &plans::AUDIO_ANALYZE)
            .await
            .unwrap();
        assert!(info.is_none());
    }

    #[tokio::test]
    async fn api_key_windows_report_most_constrained() {
        let now = Utc.with_ymd_and_hms(2025, 7, 1, 10, 0, 0).unwrap();
        let (gate, _) = gate_at(now);

        let mut caller = principal(Plan::Enterprise);
        caller.auth_method = AuthMethod::ApiKey;
        caller.key_id = Some(Uuid::from_u128(9));
        caller.key_limits = Some(KeyLimits { per_minute: 3, per_hour: 100, per_day: 1000 });

        let info = gate
            .check(&caller, &plans::RECOMMENDATIONS)
            .await
            .unwrap()
            .expect("key windows apply");
        assert_eq!(info.limit, 3);
        assert_eq!(info.remaining, 2);

        gate.check(&caller, &plans::RECOMMENDATIONS).await.unwrap();
        gate.check(&caller, &plans::RECOMMENDATIONS).await.unwrap();
        let err = gate.check(&caller, &plans::RECOMMENDATIONS).await.unwrap_err();
        assert_eq!(err.kind(), "QUOTA_EXCEEDED");
    }

    #[tokio::test]
    async fn new_window_resets_the_counter() {
        let start = Utc.with_ymd_and_hms(2025, 7, 1, 10, 0, 30).unwrap();
        let cache = Arc::new(MemoryCache::new());
        let clock = Arc::new(ManualClock::new(start));
        let gate = QuotaGate::new(cache, clock.clone());

        let mut caller = principal(Plan::Enterprise);
        caller.auth_method = AuthMethod::ApiKey;
        caller.key_id = Some(Uuid::from_u128(9));
        caller.key_limits = Some(KeyLimits { per_minute: 1, per_hour: 1_000, per_day: 10_000 });

        gate.check(&caller, &plans::RECOMMENDATIONS).await.unwrap();
        assert!(gate.check(&caller, &plans::RECOMMENDATIONS).await.is_err());

        clock.advance(ChronoDuration::seconds(30));
        assert!(gate.check(&caller, &plans::RECOMMENDATIONS).await.is_ok());
    }

    #[test]
    fn month_reset_rolls_over_december() {
        let now = Utc.with_ymd_and_hms(2025, 12, 15, 8, 0, 0).unwrap();
        let reset = window_reset(Window::Month, now);
        assert_eq!(reset, Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
    }
}

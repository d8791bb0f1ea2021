/// Interaction ingestion: the validated write path for play/skip/like and
/// related telemetry, plus the recommendation feedback loop.
use crate::auth::Principal;
use crate::cache::{keys as cache_keys, Cache};
use crate::clock::{SharedClock, SharedIdGen};
use crate::db::models::{
    ContentView, DeviceType, Interaction, InteractionSource, InteractionType, PlayerEvent,
    SearchQuery,
};
use crate::error::{ApiError, ApiResult};
use crate::repo::Repository;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Plays shorter than half the track may be skips; longer "skips" are plays.
const SKIP_MAX_RATIO: f64 = 0.5;
/// Completions require at least 80% of the track.
const COMPLETE_MIN_RATIO: f64 = 0.8;
/// Durations above twice the track length are clock skew, not listening.
const DURATION_SKEW_FACTOR: i64 = 2;

/// Client-submitted interaction event
#[derive(Debug, Clone, Deserialize)]
pub struct IngestEvent {
    pub track_id: Uuid,
    #[serde(rename = "type")]
    pub interaction_type: InteractionType,
    pub play_duration_ms: Option<i64>,
    pub position_ms: Option<i64>,
    pub source: InteractionSource,
    pub source_id: Option<Uuid>,
    pub session_id: Option<Uuid>,
    pub recommendation_id: Option<Uuid>,
    pub device_type: Option<DeviceType>,
    pub skip_reason: Option<String>,
    pub mood: Option<String>,
    pub activity: Option<String>,
    /// Monotonic per-session sequence number for ordering enforcement
    pub client_seq: Option<i64>,
    #[serde(default)]
    pub extensions: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub id: Uuid,
    /// Type actually recorded; may differ from the submitted one
    pub recorded_type: InteractionType,
    pub downgraded: bool,
}

#[derive(Debug, Serialize)]
pub struct BatchResult {
    pub accepted: usize,
    pub outcomes: Vec<IngestOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<BatchFailure>,
}

#[derive(Debug, Serialize)]
pub struct BatchFailure {
    pub index: usize,
    pub error: String,
    pub message: String,
}

/// Feedback signals on a served recommendation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackSignal {
    Accept,
    Reject,
    Played,
    Saved,
    Dismissed,
}

impl FeedbackSignal {
    /// Interaction recorded for the signal, and which impression flags flip.
    fn mapping(&self) -> (InteractionType, bool, bool, bool) {
        match self {
            FeedbackSignal::Played => (InteractionType::Play, true, true, false),
            FeedbackSignal::Saved => (InteractionType::Save, true, false, true),
            FeedbackSignal::Accept => (InteractionType::Like, true, false, true),
            FeedbackSignal::Reject => (InteractionType::Dislike, false, false, false),
            FeedbackSignal::Dismissed => (InteractionType::Skip, false, false, false),
        }
    }
}

#[derive(Clone)]
pub struct InteractionIngestor {
    repo: Repository,
    cache: Arc<dyn Cache>,
    clock: SharedClock,
    ids: SharedIdGen,
}

impl InteractionIngestor {
    pub fn new(
        repo: Repository,
        cache: Arc<dyn Cache>,
        clock: SharedClock,
        ids: SharedIdGen,
    ) -> Self {
        Self { repo, cache, clock, ids }
    }

    /// Validate and persist one event. Soft problems auto-downgrade the
    /// type; hard problems reject the event.
    pub async fn ingest(
        &self,
        principal: &Principal,
        event: IngestEvent,
    ) -> ApiResult<IngestOutcome> {
        let track = self
            .repo
            .get_track(event.track_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("Track not found".to_string()))?;

        if let Some(duration) = event.play_duration_ms {
            if duration < 0 {
                return Err(ApiError::Validation(
                    "play_duration_ms must be non-negative".to_string(),
                ));
            }
            if duration > DURATION_SKEW_FACTOR * track.duration_ms {
                return Err(ApiError::Validation(format!(
                    "play_duration_ms {} exceeds twice the track duration",
                    duration
                )));
            }
        }

        if let Some(session_id) = event.session_id {
            let session = self
                .repo
                .get_session(session_id)
                .await?
                .ok_or_else(|| ApiError::NotFound("Session not found".to_string()))?;
            if session.user_id != principal.user_id {
                return Err(ApiError::NotFound("Session not found".to_string()));
            }

            if let Some(seq) = event.client_seq {
                self.enforce_sequence(session_id, seq).await?;
            }
        }

        // Auto-downgrades
        let (recorded_type, downgraded, completion_override) =
            resolve_type(&event, track.duration_ms);

        // The recommendation loop: a referenced impression must belong to
        // the caller, and its flags flip at most once.
        if let Some(recommendation_id) = event.recommendation_id {
            let impressions = self
                .repo
                .impressions_for_recommendation(recommendation_id, principal.user_id)
                .await?;
            if impressions.is_empty() {
                return Err(ApiError::NotFound("Recommendation not found".to_string()));
            }

            let played = matches!(
                recorded_type,
                InteractionType::Play | InteractionType::Complete
            );
            let liked = matches!(recorded_type, InteractionType::Like | InteractionType::Save);
            self.repo
                .mark_impression_flags(
                    recommendation_id,
                    principal.user_id,
                    Some(event.track_id),
                    true,
                    played,
                    liked,
                )
                .await?;
        }

        let record = Interaction {
            id: self.ids.mint(),
            user_id: principal.user_id,
            track_id: event.track_id,
            session_id: event.session_id,
            interaction_type: recorded_type,
            play_duration_ms: event.play_duration_ms,
            position_ms: event.position_ms,
            source: event.source,
            source_id: event.source_id,
            recommendation_id: event.recommendation_id,
            device_type: event.device_type,
            skip_reason: event.skip_reason,
            mood: event.mood,
            activity: event.activity,
            completion_override,
            client_seq: event.client_seq,
            extensions: event.extensions.unwrap_or(Value::Null),
            created_at: self.clock.now(),
        };

        self.repo.insert_interaction(&record).await?;

        Ok(IngestOutcome { id: record.id, recorded_type, downgraded })
    }

    /// In-order batch ingestion: stops at the first hard error, soft
    /// downgrades do not stop the batch.
    pub async fn ingest_batch(
        &self,
        principal: &Principal,
        events: Vec<IngestEvent>,
    ) -> ApiResult<BatchResult> {
        if events.is_empty() {
            return Err(ApiError::Validation("Batch cannot be empty".to_string()));
        }
        if events.len() > 500 {
            return Err(ApiError::Validation("Batch limited to 500 events".to_string()));
        }

        let mut outcomes = Vec::with_capacity(events.len());
        for (index, event) in events.into_iter().enumerate() {
            match self.ingest(principal, event).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    return Ok(BatchResult {
                        accepted: outcomes.len(),
                        outcomes,
                        failure: Some(BatchFailure {
                            index,
                            error: e.kind().to_string(),
                            message: e.to_string(),
                        }),
                    });
                }
            }
        }

        Ok(BatchResult { accepted: outcomes.len(), outcomes, failure: None })
    }

    /// Close the loop on a served recommendation. Idempotent per
    /// (recommendation, signal): repeats return the original interaction.
    pub async fn record_feedback(
        &self,
        principal: &Principal,
        recommendation_id: Uuid,
        signal: FeedbackSignal,
        reason: Option<String>,
    ) -> ApiResult<IngestOutcome> {
        let impressions = self
            .repo
            .impressions_for_recommendation(recommendation_id, principal.user_id)
            .await?;
        let first = impressions
            .first()
            .ok_or_else(|| ApiError::NotFound("Recommendation not found".to_string()))?;

        let (interaction_type, clicked, played, liked) = signal.mapping();

        if let Some(existing) = self
            .repo
            .find_feedback_interaction(principal.user_id, recommendation_id, interaction_type)
            .await?
        {
            return Ok(IngestOutcome {
                id: existing,
                recorded_type: interaction_type,
                downgraded: false,
            });
        }

        if clicked || played || liked {
            self.repo
                .mark_impression_flags(
                    recommendation_id,
                    principal.user_id,
                    None,
                    clicked,
                    played,
                    liked,
                )
                .await?;
        }

        let record = Interaction {
            id: self.ids.mint(),
            user_id: principal.user_id,
            track_id: first.track_id,
            session_id: None,
            interaction_type,
            play_duration_ms: None,
            position_ms: None,
            source: InteractionSource::Recommendations,
            source_id: None,
            recommendation_id: Some(recommendation_id),
            device_type: None,
            skip_reason: None,
            mood: None,
            activity: None,
            completion_override: None,
            client_seq: None,
            extensions: reason
                .map(|r| serde_json::json!({ "reason": r }))
                .unwrap_or(Value::Null),
            created_at: self.clock.now(),
        };

        self.repo.insert_interaction(&record).await?;

        Ok(IngestOutcome { id: record.id, recorded_type: interaction_type, downgraded: false })
    }

    // ========== Telemetry records ==========

    pub async fn record_search(
        &self,
        principal: &Principal,
        record: SearchQueryInput,
    ) -> ApiResult<Uuid> {
        if record.query.is_empty() || record.query.len() > 500 {
            return Err(ApiError::Validation(
                "query must be between 1 and 500 characters".to_string(),
            ));
        }

        let row = SearchQuery {
            id: self.ids.mint(),
            user_id: principal.user_id,
            query: record.query,
            search_type: record.search_type,
            results_count: record.results_count.max(0),
            clicked_result_id: record.clicked_result_id,
            clicked_position: record.clicked_position,
            session_id: record.session_id,
            device_type: record.device_type,
            created_at: self.clock.now(),
        };
        self.repo.insert_search_query(&row).await?;
        Ok(row.id)
    }

    pub async fn record_view(
        &self,
        principal: &Principal,
        record: ContentViewInput,
    ) -> ApiResult<Uuid> {
        let row = ContentView {
            id: self.ids.mint(),
            user_id: principal.user_id,
            content_type: record.content_type,
            content_id: record.content_id,
            source: record.source,
            source_id: record.source_id,
            session_id: record.session_id,
            time_spent_ms: record.time_spent_ms,
            created_at: self.clock.now(),
        };
        self.repo.insert_content_view(&row).await?;
        Ok(row.id)
    }

    pub async fn record_player_event(
        &self,
        principal: &Principal,
        record: PlayerEventInput,
    ) -> ApiResult<Uuid> {
        const EVENT_TYPES: &[&str] = &[
            "seek",
            "buffer_start",
            "buffer_end",
            "error",
            "quality_change",
            "volume_change",
        ];
        if !EVENT_TYPES.contains(&record.event_type.as_str()) {
            return Err(ApiError::Validation(format!(
                "unknown player event type: {}",
                record.event_type
            )));
        }

        let row = PlayerEvent {
            id: self.ids.mint(),
            user_id: principal.user_id,
            track_id: record.track_id,
            session_id: record.session_id,
            event_type: record.event_type,
            position_ms: record.position_ms,
            seek_from_ms: record.seek_from_ms,
            seek_to_ms: record.seek_to_ms,
            buffer_duration_ms: record.buffer_duration_ms,
            error_code: record.error_code,
            extensions: record.extensions.unwrap_or(Value::Null),
            created_at: self.clock.now(),
        };
        self.repo.insert_player_event(&row).await?;
        Ok(row.id)
    }

    /// Per-session FIFO: the submitted sequence must be strictly greater
    /// than the last accepted one.
    async fn enforce_sequence(&self, session_id: Uuid, seq: i64) -> ApiResult<()> {
        let key = cache_keys::session_seq(session_id);

        // CAS loop; contention between writers of the same session is rare
        for _ in 0..4 {
            let current = self.cache.get(&key).await?;
            let last_seq = current.as_deref().and_then(|v| v.parse::<i64>().ok());

            if let Some(last) = last_seq {
                if seq <= last {
                    return Err(ApiError::StaleEvent { last_seq: last });
                }
            }

            let swapped = self
                .cache
                .compare_and_swap(&key, current.as_deref(), &seq.to_string(), None)
                .await?;
            if swapped {
                return Ok(());
            }
        }

        Err(ApiError::Internal("sequence counter contention".to_string()))
    }
}

fn resolve_type(event: &IngestEvent, track_duration_ms: i64) -> (InteractionType, bool, Option<bool>) {
    match (event.interaction_type, event.play_duration_ms) {
        (InteractionType::Complete, Some(duration))
            if (duration as f64) < COMPLETE_MIN_RATIO * track_duration_ms as f64 =>
        {
            (InteractionType::Play, true, Some(false))
        }
        (InteractionType::Complete, None) => (InteractionType::Play, true, Some(false)),
        (InteractionType::Skip, Some(duration))
            if (duration as f64) >= SKIP_MAX_RATIO * track_duration_ms as f64 =>
        {
            (InteractionType::Play, true, None)
        }
        (kind, _) => (kind, false, None),
    }
}

/// Search-query telemetry input
#[derive(Debug, Clone, Deserialize)]
pub struct SearchQueryInput {
    pub query: String,
    pub search_type: String,
    pub results_count: i64,
    pub clicked_result_id: Option<Uuid>,
    pub clicked_position: Option<i64>,
    pub session_id: Option<Uuid>,
    pub device_type: Option<DeviceType>,
}

/// Content-view telemetry input
#[derive(Debug, Clone, Deserialize)]
pub struct ContentViewInput {
    pub content_type: String,
    pub content_id: Uuid,
    pub source: Option<String>,
    pub source_id: Option<Uuid>,
    pub session_id: Option<Uuid>,
    pub time_spent_ms: Option<i64>,
}

/// Player-event telemetry input
#[derive(Debug, Clone, Deserialize)]
pub struct PlayerEventInput {
    pub track_id: Uuid,
    pub session_id: Option<Uuid>,
    pub event_type: String,
    pub position_ms: Option<i64>,
    pub seek_from_ms: Option<i64>,
    pub seek_to_ms: Option<i64>,
    pub buffer_duration_ms: Option<i64>,
    pub error_code: Option<String>,
    #[serde(default)]
    pub extensions: Option<Value>,
}

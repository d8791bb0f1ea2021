/// RecommendationEngine boundary
///
/// The engine is stateless from the dispatcher's perspective: a typed
/// request goes in, a ranked track list comes out. Calls are deadline-aware
/// and cancellable by dropping the future.
use crate::db::models::Plan;
use crate::error::{ApiError, ApiResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    UserPersonal,
    SimilarToTrack,
    DailyMix,
    RadioSeed,
    TasteProfile,
}

impl RecommendationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecommendationKind::UserPersonal => "user_personal",
            RecommendationKind::SimilarToTrack => "similar_to_track",
            RecommendationKind::DailyMix => "daily_mix",
            RecommendationKind::RadioSeed => "radio_seed",
            RecommendationKind::TasteProfile => "taste_profile",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineRequest {
    pub kind: RecommendationKind,
    pub user_id: Uuid,
    pub seed: Option<Uuid>,
    pub limit: usize,
    /// Model tier derived from the caller's plan
    pub model_tier: Plan,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredTrack {
    pub track_id: Uuid,
    pub score: f64,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineResponse {
    pub tracks: Vec<ScoredTrack>,
    pub model_type: String,
    pub model_version: Option<String>,
}

#[async_trait]
pub trait RecommendationEngine: Send + Sync {
    async fn recommend(
        &self,
        request: &EngineRequest,
        deadline: Duration,
    ) -> ApiResult<EngineResponse>;
}

/// HTTP client for the ML engine service
pub struct HttpEngine {
    client: reqwest::Client,
    base_url: String,
}

impl HttpEngine {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, kind: RecommendationKind) -> String {
        let path = match kind {
            RecommendationKind::UserPersonal => "/recommend/user",
            RecommendationKind::SimilarToTrack => "/recommend/similar",
            RecommendationKind::DailyMix => "/recommend/daily-mix",
            RecommendationKind::RadioSeed => "/recommend/radio",
            RecommendationKind::TasteProfile => "/recommend/taste-profile",
        };
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl RecommendationEngine for HttpEngine {
    async fn recommend(
        &self,
        request: &EngineRequest,
        deadline: Duration,
    ) -> ApiResult<EngineResponse> {
        let response = self
            .client
            .post(self.endpoint(request.kind))
            .timeout(deadline)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ApiError::UpstreamUnavailable("engine deadline exceeded".to_string())
                } else {
                    ApiError::UpstreamUnavailable(format!("engine unreachable: {}", e))
                }
            })?;

        if !response.status().is_success() {
            return Err(ApiError::UpstreamUnavailable(format!(
                "engine returned {}",
                response.status()
            )));
        }

        response
            .json::<EngineResponse>()
            .await
            .map_err(|e| ApiError::UpstreamUnavailable(format!("engine response malformed: {}", e)))
    }
}

/// Scripted engine for tests and engine-less local development
pub struct StaticEngine {
    responses: std::sync::Mutex<Vec<ApiResult<EngineResponse>>>,
    pub calls: std::sync::atomic::AtomicUsize,
}

impl StaticEngine {
    /// Serves the scripted responses in order; repeats the last one.
    pub fn new(responses: Vec<ApiResult<EngineResponse>>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses),
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn always(response: EngineResponse) -> Self {
        Self::new(vec![Ok(response)])
    }

    pub fn unavailable() -> Self {
        Self::new(vec![Err(ApiError::UpstreamUnavailable("engine down".to_string()))])
    }
}

#[async_trait]
impl RecommendationEngine for StaticEngine {
    async fn recommend(
        &self,
        _request: &EngineRequest,
        _deadline: Duration,
    ) -> ApiResult<EngineResponse> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let mut responses = self.responses.lock().unwrap();
        let result = if responses.len() > 1 {
            responses.remove(0)
        } else {
            match responses.first() {
                Some(Ok(response)) => Ok(response.clone()),
                Some(Err(e)) => Err(ApiError::UpstreamUnavailable(e.to_string())),
                None => Err(ApiError::UpstreamUnavailable("no scripted response".to_string())),
            }
        };
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_per_kind() {
        let engine = HttpEngine::new("http://ml-engine:8001/");
        assert_eq!(
            engine.endpoint(RecommendationKind::UserPersonal),
            "http://ml-engine:8001/recommend/user"
        );
        assert_eq!(
            engine.endpoint(RecommendationKind::TasteProfile),
            "http://ml-engine:8001/recommend/taste-profile"
        );
    }

    #[tokio::test]
    async fn static_engine_scripts_in_order() {
        let engine = StaticEngine::new(vec![
            Err(ApiError::UpstreamUnavailable("first".into())),
            Ok(EngineResponse {
                tracks: vec![],
                model_type: "cf".into(),
                model_version: None,
            }),
        ]);
        let request = EngineRequest {
            kind: RecommendationKind::UserPersonal,
            user_id: Uuid::from_u128(1),
            seed: None,
            limit: 10,
            model_tier: Plan::Free,
        };

        assert!(engine.recommend(&request, Duration::from_secs(1)).await.is_err());
        assert!(engine.recommend(&request, Duration::from_secs(1)).await.is_ok());
        assert_eq!(engine.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}

/// Entity types persisted by the repository
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Billing tier governing feature availability and quotas
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Starter,
    Pro,
    Enterprise,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Starter => "starter",
            Plan::Pro => "pro",
            Plan::Enterprise => "enterprise",
        }
    }

    /// Unknown plans (downgrade in flight) floor to `free`.
    pub fn parse_or_floor(s: &str) -> Plan {
        match s {
            "starter" => Plan::Starter,
            "pro" => Plan::Pro,
            "enterprise" => Plan::Enterprise,
            _ => Plan::Free,
        }
    }

    pub const ALL: [Plan; 4] = [Plan::Free, Plan::Starter, Plan::Pro, Plan::Enterprise];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
    Owner,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
            Role::Owner => "owner",
        }
    }

    pub fn parse(s: &str) -> Role {
        match s {
            "admin" => Role::Admin,
            "owner" => Role::Owner,
            _ => Role::User,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }

    pub fn parse(s: &str) -> Option<Environment> {
        match s {
            "development" => Some(Environment::Development),
            "staging" => Some(Environment::Staging),
            "production" => Some(Environment::Production),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub plan: Plan,
    pub max_users: i64,
    pub max_tracks: i64,
    pub feature_overrides: HashMap<String, bool>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub org_id: Uuid,
    pub email: String,
    pub username: Option<String>,
    pub password_hash: String,
    pub role: Role,
    pub is_active: bool,
    pub email_verified: bool,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Track {
    pub id: Uuid,
    pub org_id: Uuid,
    pub title: String,
    pub artist: Option<String>,
    pub genre: Option<String>,
    pub duration_ms: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ApiKey {
    pub id: Uuid,
    pub owner_user_id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    pub key_hash: String,
    pub key_prefix: String,
    pub scopes: Vec<String>,
    pub environment: Environment,
    pub limit_per_minute: i64,
    pub limit_per_hour: i64,
    pub limit_per_day: i64,
    pub ip_allowlist: Option<Vec<String>>,
    pub is_active: bool,
    pub total_requests: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub rotated_from: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    /// A key authenticates only while active, unrevoked, and unexpired.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        if !self.is_active {
            return false;
        }
        if let Some(revoked_at) = self.revoked_at {
            if revoked_at <= now {
                return false;
            }
        }
        if let Some(expires_at) = self.expires_at {
            if expires_at <= now {
                return false;
            }
        }
        true
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope || s == "*")
    }

    /// Redacted representation for reads after creation.
    pub fn redacted_key(&self) -> String {
        format!("{}\u{2022}\u{2022}\u{2022}", self.key_prefix)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEndedBy {
    Client,
    Timeout,
}

impl SessionEndedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEndedBy::Client => "client",
            SessionEndedBy::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<SessionEndedBy> {
        match s {
            "client" => Some(SessionEndedBy::Client),
            "timeout" => Some(SessionEndedBy::Timeout),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListeningSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub device_id: String,
    pub device_type: DeviceType,
    pub platform: Option<String>,
    pub context_type: Option<String>,
    pub context_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub ended_by: Option<SessionEndedBy>,
    pub last_position_ms: Option<i64>,
    pub last_track_id: Option<Uuid>,
    pub total_duration_ms: i64,
    pub tracks_played: i64,
    pub tracks_skipped: i64,
    pub completion_rate: f64,
}

impl ListeningSession {
    /// Active while not ended and within the idle window. A heartbeat exactly
    /// at the timeout boundary still counts as alive.
    pub fn is_active_at(&self, now: DateTime<Utc>, idle_timeout: chrono::Duration) -> bool {
        self.ended_at.is_none() && now - self.last_heartbeat_at <= idle_timeout
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Mobile,
    Desktop,
    Web,
    Tablet,
    Car,
    SmartSpeaker,
    Tv,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Mobile => "mobile",
            DeviceType::Desktop => "desktop",
            DeviceType::Web => "web",
            DeviceType::Tablet => "tablet",
            DeviceType::Car => "car",
            DeviceType::SmartSpeaker => "smart_speaker",
            DeviceType::Tv => "tv",
        }
    }

    pub fn parse(s: &str) -> Option<DeviceType> {
        match s {
            "mobile" => Some(DeviceType::Mobile),
            "desktop" => Some(DeviceType::Desktop),
            "web" => Some(DeviceType::Web),
            "tablet" => Some(DeviceType::Tablet),
            "car" => Some(DeviceType::Car),
            "smart_speaker" => Some(DeviceType::SmartSpeaker),
            "tv" => Some(DeviceType::Tv),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionType {
    Play,
    Skip,
    Like,
    Dislike,
    Save,
    AddToPlaylist,
    Share,
    Complete,
}

impl InteractionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionType::Play => "play",
            InteractionType::Skip => "skip",
            InteractionType::Like => "like",
            InteractionType::Dislike => "dislike",
            InteractionType::Save => "save",
            InteractionType::AddToPlaylist => "add_to_playlist",
            InteractionType::Share => "share",
            InteractionType::Complete => "complete",
        }
    }

    pub fn parse(s: &str) -> Option<InteractionType> {
        match s {
            "play" => Some(InteractionType::Play),
            "skip" => Some(InteractionType::Skip),
            "like" => Some(InteractionType::Like),
            "dislike" => Some(InteractionType::Dislike),
            "save" => Some(InteractionType::Save),
            "add_to_playlist" => Some(InteractionType::AddToPlaylist),
            "share" => Some(InteractionType::Share),
            "complete" => Some(InteractionType::Complete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionSource {
    Playlist,
    Search,
    Recommendations,
    Radio,
    ArtistPage,
    AlbumPage,
    Queue,
    Library,
}

impl InteractionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionSource::Playlist => "playlist",
            InteractionSource::Search => "search",
            InteractionSource::Recommendations => "recommendations",
            InteractionSource::Radio => "radio",
            InteractionSource::ArtistPage => "artist_page",
            InteractionSource::AlbumPage => "album_page",
            InteractionSource::Queue => "queue",
            InteractionSource::Library => "library",
        }
    }

    pub fn parse(s: &str) -> Option<InteractionSource> {
        match s {
            "playlist" => Some(InteractionSource::Playlist),
            "search" => Some(InteractionSource::Search),
            "recommendations" => Some(InteractionSource::Recommendations),
            "radio" => Some(InteractionSource::Radio),
            "artist_page" => Some(InteractionSource::ArtistPage),
            "album_page" => Some(InteractionSource::AlbumPage),
            "queue" => Some(InteractionSource::Queue),
            "library" => Some(InteractionSource::Library),
            _ => None,
        }
    }
}

/// Immutable after insert.
#[derive(Debug, Clone)]
pub struct Interaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub track_id: Uuid,
    pub session_id: Option<Uuid>,
    pub interaction_type: InteractionType,
    pub play_duration_ms: Option<i64>,
    pub position_ms: Option<i64>,
    pub source: InteractionSource,
    pub source_id: Option<Uuid>,
    pub recommendation_id: Option<Uuid>,
    pub device_type: Option<DeviceType>,
    pub skip_reason: Option<String>,
    pub mood: Option<String>,
    pub activity: Option<String>,
    pub completion_override: Option<bool>,
    pub client_seq: Option<i64>,
    pub extensions: Value,
    pub created_at: DateTime<Utc>,
}

/// Append-only; the clicked/played/liked flags flip true at most once.
#[derive(Debug, Clone)]
pub struct Impression {
    pub id: Uuid,
    pub user_id: Uuid,
    pub track_id: Uuid,
    pub recommendation_id: Uuid,
    pub model_type: String,
    pub model_version: Option<String>,
    pub score: f64,
    pub position: i64,
    pub context: Option<String>,
    pub shown_at: DateTime<Utc>,
    pub clicked: bool,
    pub played: bool,
    pub liked: bool,
}

#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub id: Uuid,
    pub user_id: Uuid,
    pub query: String,
    pub search_type: String,
    pub results_count: i64,
    pub clicked_result_id: Option<Uuid>,
    pub clicked_position: Option<i64>,
    pub session_id: Option<Uuid>,
    pub device_type: Option<DeviceType>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ContentView {
    pub id: Uuid,
    pub user_id: Uuid,
    pub content_type: String,
    pub content_id: Uuid,
    pub source: Option<String>,
    pub source_id: Option<Uuid>,
    pub session_id: Option<Uuid>,
    pub time_spent_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PlayerEvent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub track_id: Uuid,
    pub session_id: Option<Uuid>,
    pub event_type: String,
    pub position_ms: Option<i64>,
    pub seek_from_ms: Option<i64>,
    pub seek_to_ms: Option<i64>,
    pub buffer_duration_ms: Option<i64>,
    pub error_code: Option<String>,
    pub extensions: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ApiKeyUsage {
    pub id: Uuid,
    pub key_id: Uuid,
    pub endpoint: String,
    pub status_code: i64,
    pub response_time_ms: i64,
    pub created_at: DateTime<Utc>,
}

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// Lifecycle status of a single outbound call attempt.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    Queued,
    Dialing,
    InProgress,
    Completed,
    Failed,
    NoAnswer,
    Busy,
    OptedOut,
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Completed
                | CallStatus::Failed
                | CallStatus::NoAnswer
                | CallStatus::Busy
                | CallStatus::OptedOut
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Queued => "queued",
            CallStatus::Dialing => "dialing",
            CallStatus::InProgress => "in-progress",
            CallStatus::Completed => "completed",
            CallStatus::Failed => "failed",
            CallStatus::NoAnswer => "no-answer",
            CallStatus::Busy => "busy",
            CallStatus::OptedOut => "opted-out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(CallStatus::Queued),
            "dialing" => Some(CallStatus::Dialing),
            "in-progress" => Some(CallStatus::InProgress),
            "completed" => Some(CallStatus::Completed),
            "failed" => Some(CallStatus::Failed),
            "no-answer" => Some(CallStatus::NoAnswer),
            "busy" => Some(CallStatus::Busy),
            "opted-out" => Some(CallStatus::OptedOut),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Ai,
    Human,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Speaker::Ai => "ai",
            Speaker::Human => "human",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
pub enum SentimentLabel {
    Positive,
    Neutral,
    Negative,
}

impl SentimentLabel {
    /// Label for a running score.
    pub fn from_score(score: f32) -> Self {
        if score > 0.2 {
            SentimentLabel::Positive
        } else if score < -0.2 {
            SentimentLabel::Negative
        } else {
            SentimentLabel::Neutral
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SentimentLabel::Positive => "positive",
            SentimentLabel::Neutral => "neutral",
            SentimentLabel::Negative => "negative",
        }
    }
}

/// Terminal error classification recorded on a failed call.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "kebab-case")]
pub enum CallErrorKind {
    RetriesExhausted,
    ProviderFailure,
    Canceled,
}

impl CallErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallErrorKind::RetriesExhausted => "retries-exhausted",
            CallErrorKind::ProviderFailure => "provider-failure",
            CallErrorKind::Canceled => "canceled",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct CallError {
    pub kind: CallErrorKind,
    pub message: String,
}

impl CallError {
    pub fn new(kind: CallErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// An utterance within a call.  Immutable once appended to the transcript.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ConversationTurn {
    pub id: Uuid,
    pub call_id: Uuid,
    pub speaker: Speaker,
    pub content: String,
    pub timestamp: OffsetDateTime,
    pub audio_url: Option<String>,
    pub confidence: Option<f32>,
    pub sentiment: Option<f32>,
}

impl ConversationTurn {
    pub fn new(call_id: Uuid, speaker: Speaker, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            call_id,
            speaker,
            content: content.into(),
            timestamp: OffsetDateTime::now_utc(),
            audio_url: None,
            confidence: None,
            sentiment: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "kebab-case")]
pub enum CallEventKind {
    CallStarted,
    CallAnswered,
    CallEnded,
    TranscriptUpdated,
    SentimentUpdated,
    EscalationTriggered,
    OptedOut,
    RetryScheduled,
    Error,
}

/// Audit record of a state transition or external signal.  Append-only and
/// never read back by the orchestrator; decisions use live call state only.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CallEventRecord {
    pub id: Uuid,
    pub call_id: Uuid,
    pub kind: CallEventKind,
    pub timestamp: OffsetDateTime,
    pub data: serde_json::Value,
}

impl CallEventRecord {
    pub fn new(call_id: Uuid, kind: CallEventKind, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            call_id,
            kind,
            timestamp: OffsetDateTime::now_utc(),
            data,
        }
    }
}

/// One outbound call.  Owned exclusively by its session task while active.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Call {
    pub id: Uuid,
    pub campaign_id: String,
    pub contact_id: String,
    pub phone_number: String,
    pub provider_session_id: Option<String>,
    pub status: CallStatus,
    pub queued_at: OffsetDateTime,
    pub started_at: Option<OffsetDateTime>,
    pub ended_at: Option<OffsetDateTime>,
    pub duration_secs: Option<u32>,
    pub recording_url: Option<String>,
    pub sentiment_score: Option<f32>,
    pub sentiment_label: Option<SentimentLabel>,
    pub answered: bool,
    pub opted_out: bool,
    pub human_escalation: bool,
    pub attempts: u32,
    pub last_attempt_at: Option<OffsetDateTime>,
    pub next_retry_at: Option<OffsetDateTime>,
    pub error: Option<CallError>,
}

impl Call {
    pub fn new(
        campaign_id: impl Into<String>,
        contact_id: impl Into<String>,
        phone_number: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            campaign_id: campaign_id.into(),
            contact_id: contact_id.into(),
            phone_number: phone_number.into(),
            provider_session_id: None,
            status: CallStatus::Queued,
            queued_at: OffsetDateTime::now_utc(),
            started_at: None,
            ended_at: None,
            duration_secs: None,
            recording_url: None,
            sentiment_score: None,
            sentiment_label: None,
            answered: false,
            opted_out: false,
            human_escalation: false,
            attempts: 0,
            last_attempt_at: None,
            next_retry_at: None,
            error: None,
        }
    }

    pub fn apply(&mut self, patch: CallPatch) {
        if let Some(v) = patch.status {
            self.status = v;
        }
        if let Some(v) = patch.provider_session_id {
            self.provider_session_id = Some(v);
        }
        if let Some(v) = patch.started_at {
            self.started_at = Some(v);
        }
        if let Some(v) = patch.ended_at {
            self.ended_at = Some(v);
        }
        if let Some(v) = patch.duration_secs {
            self.duration_secs = Some(v);
        }
        if let Some(v) = patch.recording_url {
            self.recording_url = Some(v);
        }
        if let Some(v) = patch.sentiment_score {
            self.sentiment_score = Some(v);
        }
        if let Some(v) = patch.sentiment_label {
            self.sentiment_label = Some(v);
        }
        if let Some(v) = patch.answered {
            self.answered = v;
        }
        if let Some(v) = patch.opted_out {
            self.opted_out = v;
        }
        if let Some(v) = patch.human_escalation {
            self.human_escalation = v;
        }
        if let Some(v) = patch.attempts {
            self.attempts = v;
        }
        if let Some(v) = patch.last_attempt_at {
            self.last_attempt_at = Some(v);
        }
        if let Some(v) = patch.next_retry_at {
            self.next_retry_at = v;
        }
        if let Some(v) = patch.error {
            self.error = Some(v);
        }
    }
}

/// Partial update handed to the sink.  `None` leaves a field untouched;
/// `next_retry_at` is doubly wrapped so a schedule can be cleared.
#[derive(Default, Clone, Debug)]
pub struct CallPatch {
    pub status: Option<CallStatus>,
    pub provider_session_id: Option<String>,
    pub started_at: Option<OffsetDateTime>,
    pub ended_at: Option<OffsetDateTime>,
    pub duration_secs: Option<u32>,
    pub recording_url: Option<String>,
    pub sentiment_score: Option<f32>,
    pub sentiment_label: Option<SentimentLabel>,
    pub answered: Option<bool>,
    pub opted_out: Option<bool>,
    pub human_escalation: Option<bool>,
    pub attempts: Option<u32>,
    pub last_attempt_at: Option<OffsetDateTime>,
    pub next_retry_at: Option<Option<OffsetDateTime>>,
    pub error: Option<CallError>,
}

/// Contact view consumed by the dispatcher.  Owned by the CRUD collaborator;
/// the orchestrator only reads it and reports call results back.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Contact {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub phone_number: String,
    pub opted_out: bool,
    #[serde(default)]
    pub custom_fields: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub total_calls: u32,
    pub last_called: Option<OffsetDateTime>,
    pub last_call_status: Option<CallStatus>,
}

impl Contact {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Draft,
    Active,
    Paused,
    Completed,
    Cancelled,
}

/// Mutable campaign record as the CRUD collaborator hands it over.  The
/// dispatcher reads it once per tick and works from a snapshot thereafter.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Campaign {
    pub id: String,
    pub name: String,
    pub status: CampaignStatus,
    #[serde(default)]
    pub script: String,
    #[serde(default)]
    pub personality: String,
    #[serde(default)]
    pub goals: Vec<String>,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_voice")]
    pub voice: String,
    pub greeting_template: Option<String>,
    #[serde(default = "default_max_call_duration")]
    pub max_call_duration_secs: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u32,
    #[serde(default)]
    pub personalization_fields: Vec<String>,
    #[serde(default = "default_concurrency")]
    pub concurrency_limit: usize,
}

fn default_language() -> String {
    "en-US".to_string()
}

fn default_voice() -> String {
    "nova".to_string()
}

fn default_max_call_duration() -> u32 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_interval() -> u32 {
    3_600
}

fn default_concurrency() -> usize {
    10
}

impl Campaign {
    /// Freeze the fields needed to run calls.  In-flight calls operate only on
    /// this snapshot, so edits or pauses to the campaign cannot race them.
    pub fn snapshot(&self) -> CampaignRuntimeConfig {
        CampaignRuntimeConfig {
            campaign_id: self.id.clone(),
            script: self.script.clone(),
            personality: self.personality.clone(),
            goals: self.goals.clone(),
            language: self.language.clone(),
            voice: self.voice.clone(),
            greeting_template: self.greeting_template.clone(),
            max_call_duration_secs: self.max_call_duration_secs,
            max_retries: self.max_retries,
            retry_interval: Duration::seconds(i64::from(self.retry_interval_secs)),
            personalization_fields: self.personalization_fields.clone(),
            concurrency_limit: self.concurrency_limit,
            token_budget: crate::consts::DEFAULT_TOKEN_BUDGET,
            keep_recent_turns: crate::consts::KEEP_RECENT_TURNS,
        }
    }
}

/// Immutable dispatch-time snapshot of everything a live call needs.
#[derive(Clone, Debug)]
pub struct CampaignRuntimeConfig {
    pub campaign_id: String,
    pub script: String,
    pub personality: String,
    pub goals: Vec<String>,
    pub language: String,
    pub voice: String,
    pub greeting_template: Option<String>,
    pub max_call_duration_secs: u32,
    pub max_retries: u32,
    pub retry_interval: Duration,
    pub personalization_fields: Vec<String>,
    pub concurrency_limit: usize,
    pub token_budget: usize,
    pub keep_recent_turns: usize,
}

use crate::error::SinkError;
use crate::model::{
    Call, CallEventRecord, CallPatch, CallStatus, Contact, ConversationTurn, SentimentLabel,
};

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use std::collections::HashMap;
use std::sync::Mutex;
use time::OffsetDateTime;
use tracing::{debug, error};
use uuid::Uuid;

/// Persistence collaborator.  The orchestrator writes through this seam only;
/// analytics and the CRUD backend consume the stores on the other side.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn create_call(&self, call: Call) -> Result<(), SinkError>;
    async fn get_call(&self, id: Uuid) -> Result<Option<Call>, SinkError>;
    async fn update_call(&self, id: Uuid, patch: CallPatch) -> Result<(), SinkError>;

    /// Append-only audit log.
    async fn add_call_event(&self, event: CallEventRecord) -> Result<(), SinkError>;
    /// Append-only transcript.
    async fn add_conversation_turn(&self, turn: ConversationTurn) -> Result<(), SinkError>;
    /// Store synthesized audio for a turn; returns a reference URL.
    async fn store_turn_audio(
        &self,
        call_id: Uuid,
        turn_id: Uuid,
        bytes: Vec<u8>,
    ) -> Result<String, SinkError>;
    /// Fetch stored turn audio for playback.
    async fn turn_audio(&self, turn_id: Uuid) -> Result<Option<Vec<u8>>, SinkError>;

    async fn get_contact(&self, id: &str) -> Result<Option<Contact>, SinkError>;
    /// Contacts targeted by the campaign that have not been called yet and
    /// have not opted out.
    async fn queued_contacts(
        &self,
        campaign_id: &str,
        limit: usize,
    ) -> Result<Vec<Contact>, SinkError>;
    /// Hard compliance write: no future campaign may redial this contact.
    async fn mark_contact_opted_out(&self, contact_id: &str) -> Result<(), SinkError>;
    async fn record_contact_call_result(
        &self,
        contact_id: &str,
        status: CallStatus,
    ) -> Result<(), SinkError>;

    /// Calls whose retry schedule has come due.
    async fn calls_due_for_retry(
        &self,
        campaign_id: &str,
        now: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<Call>, SinkError>;
}

/// In-memory sink backing tests and the demo runtime; the production
/// deployment swaps in [`PgSink`] behind the same contract.
#[derive(Default)]
pub struct MemorySink {
    calls: Mutex<HashMap<Uuid, Call>>,
    events: Mutex<HashMap<Uuid, Vec<CallEventRecord>>>,
    turns: Mutex<HashMap<Uuid, Vec<ConversationTurn>>>,
    audio: Mutex<HashMap<Uuid, Vec<u8>>>,
    contacts: Mutex<HashMap<String, Contact>>,
    campaign_targets: Mutex<HashMap<String, Vec<String>>>,
    opt_out_marks: Mutex<HashMap<String, u32>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Target a contact with a campaign (setup path; the CRUD collaborator
    /// owns this relation in production).
    pub fn add_contact(&self, campaign_id: &str, contact: Contact) {
        self.campaign_targets
            .lock()
            .unwrap()
            .entry(campaign_id.to_string())
            .or_default()
            .push(contact.id.clone());
        self.contacts
            .lock()
            .unwrap()
            .insert(contact.id.clone(), contact);
    }

    pub fn events_for(&self, call_id: Uuid) -> Vec<CallEventRecord> {
        self.events
            .lock()
            .unwrap()
            .get(&call_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn turns_for(&self, call_id: Uuid) -> Vec<ConversationTurn> {
        self.turns
            .lock()
            .unwrap()
            .get(&call_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn calls_for_campaign(&self, campaign_id: &str) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.campaign_id == campaign_id)
            .cloned()
            .collect()
    }

    /// How many times a contact was marked opted out; the state machine must
    /// keep this at exactly one per opted-out call.
    pub fn opt_out_mark_count(&self, contact_id: &str) -> u32 {
        self.opt_out_marks
            .lock()
            .unwrap()
            .get(contact_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn create_call(&self, call: Call) -> Result<(), SinkError> {
        self.calls.lock().unwrap().insert(call.id, call);
        Ok(())
    }

    async fn get_call(&self, id: Uuid) -> Result<Option<Call>, SinkError> {
        Ok(self.calls.lock().unwrap().get(&id).cloned())
    }

    async fn update_call(&self, id: Uuid, patch: CallPatch) -> Result<(), SinkError> {
        let mut calls = self.calls.lock().unwrap();
        let call = calls.get_mut(&id).ok_or(SinkError::UnknownCall(id))?;
        call.apply(patch);
        Ok(())
    }

    async fn add_call_event(&self, event: CallEventRecord) -> Result<(), SinkError> {
        self.events
            .lock()
            .unwrap()
            .entry(event.call_id)
            .or_default()
            .push(event);
        Ok(())
    }

    async fn add_conversation_turn(&self, turn: ConversationTurn) -> Result<(), SinkError> {
        self.turns
            .lock()
            .unwrap()
            .entry(turn.call_id)
            .or_default()
            .push(turn);
        Ok(())
    }

    async fn store_turn_audio(
        &self,
        _call_id: Uuid,
        turn_id: Uuid,
        bytes: Vec<u8>,
    ) -> Result<String, SinkError> {
        self.audio.lock().unwrap().insert(turn_id, bytes);
        Ok(format!("memory://turn-audio/{turn_id}"))
    }

    async fn turn_audio(&self, turn_id: Uuid) -> Result<Option<Vec<u8>>, SinkError> {
        Ok(self.audio.lock().unwrap().get(&turn_id).cloned())
    }

    async fn get_contact(&self, id: &str) -> Result<Option<Contact>, SinkError> {
        Ok(self.contacts.lock().unwrap().get(id).cloned())
    }

    async fn queued_contacts(
        &self,
        campaign_id: &str,
        limit: usize,
    ) -> Result<Vec<Contact>, SinkError> {
        let targets = self.campaign_targets.lock().unwrap();
        let contacts = self.contacts.lock().unwrap();
        let calls = self.calls.lock().unwrap();
        let mut out = Vec::new();
        for contact_id in targets.get(campaign_id).into_iter().flatten() {
            if out.len() >= limit {
                break;
            }
            let Some(contact) = contacts.get(contact_id) else {
                continue;
            };
            if contact.opted_out {
                continue;
            }
            let already_called = calls
                .values()
                .any(|c| c.campaign_id == campaign_id && c.contact_id == *contact_id);
            if !already_called {
                out.push(contact.clone());
            }
        }
        Ok(out)
    }

    async fn mark_contact_opted_out(&self, contact_id: &str) -> Result<(), SinkError> {
        let mut contacts = self.contacts.lock().unwrap();
        let contact = contacts
            .get_mut(contact_id)
            .ok_or_else(|| SinkError::UnknownContact(contact_id.to_string()))?;
        contact.opted_out = true;
        *self
            .opt_out_marks
            .lock()
            .unwrap()
            .entry(contact_id.to_string())
            .or_insert(0) += 1;
        Ok(())
    }

    async fn record_contact_call_result(
        &self,
        contact_id: &str,
        status: CallStatus,
    ) -> Result<(), SinkError> {
        let mut contacts = self.contacts.lock().unwrap();
        let contact = contacts
            .get_mut(contact_id)
            .ok_or_else(|| SinkError::UnknownContact(contact_id.to_string()))?;
        contact.total_calls += 1;
        contact.last_called = Some(OffsetDateTime::now_utc());
        contact.last_call_status = Some(status);
        Ok(())
    }

    async fn calls_due_for_retry(
        &self,
        campaign_id: &str,
        now: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<Call>, SinkError> {
        let calls = self.calls.lock().unwrap();
        let mut due: Vec<Call> = calls
            .values()
            .filter(|c| {
                c.campaign_id == campaign_id
                    && !c.opted_out
                    && c.next_retry_at.map(|at| at <= now).unwrap_or(false)
            })
            .cloned()
            .collect();
        due.sort_by_key(|c| c.next_retry_at);
        due.truncate(limit);
        Ok(due)
    }
}

/// Postgres-backed sink.  Schema in `schema.sql`.
pub struct PgSink {
    pool: Pool<Postgres>,
}

impl PgSink {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn db_err(e: sqlx::Error) -> SinkError {
        error!(error=%e, "sink query failed");
        SinkError::Database(e.to_string())
    }

    fn call_from_row(row: &PgRow) -> Result<Call, SinkError> {
        let status: String = row.try_get("status").map_err(Self::db_err)?;
        let status = CallStatus::parse(&status)
            .ok_or_else(|| SinkError::Database(format!("unknown call status '{status}'")))?;
        let sentiment_label: Option<String> =
            row.try_get("sentiment_label").map_err(Self::db_err)?;
        let error_kind: Option<String> = row.try_get("error_kind").map_err(Self::db_err)?;
        let error_message: Option<String> = row.try_get("error_message").map_err(Self::db_err)?;
        let attempts: i32 = row.try_get("attempts").map_err(Self::db_err)?;
        let duration: Option<i32> = row.try_get("duration_secs").map_err(Self::db_err)?;
        Ok(Call {
            id: row.try_get("id").map_err(Self::db_err)?,
            campaign_id: row.try_get("campaign_id").map_err(Self::db_err)?,
            contact_id: row.try_get("contact_id").map_err(Self::db_err)?,
            phone_number: row.try_get("phone_number").map_err(Self::db_err)?,
            provider_session_id: row.try_get("provider_session_id").map_err(Self::db_err)?,
            status,
            queued_at: row.try_get("queued_at").map_err(Self::db_err)?,
            started_at: row.try_get("started_at").map_err(Self::db_err)?,
            ended_at: row.try_get("ended_at").map_err(Self::db_err)?,
            duration_secs: duration.map(|d| d as u32),
            recording_url: row.try_get("recording_url").map_err(Self::db_err)?,
            sentiment_score: row.try_get("sentiment_score").map_err(Self::db_err)?,
            sentiment_label: sentiment_label.as_deref().and_then(parse_sentiment_label),
            answered: row.try_get("answered").map_err(Self::db_err)?,
            opted_out: row.try_get("opted_out").map_err(Self::db_err)?,
            human_escalation: row.try_get("human_escalation").map_err(Self::db_err)?,
            attempts: attempts as u32,
            last_attempt_at: row.try_get("last_attempt_at").map_err(Self::db_err)?,
            next_retry_at: row.try_get("next_retry_at").map_err(Self::db_err)?,
            error: match (error_kind.as_deref(), error_message) {
                (Some(kind), Some(message)) => parse_error_kind(kind)
                    .map(|kind| crate::model::CallError { kind, message }),
                _ => None,
            },
        })
    }

    fn contact_from_row(row: &PgRow) -> Result<Contact, SinkError> {
        let custom: Option<String> = row.try_get("custom_fields").map_err(Self::db_err)?;
        let custom_fields = custom
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        let total_calls: i32 = row.try_get("total_calls").map_err(Self::db_err)?;
        let last_status: Option<String> =
            row.try_get("last_call_status").map_err(Self::db_err)?;
        Ok(Contact {
            id: row.try_get("id").map_err(Self::db_err)?,
            first_name: row.try_get("first_name").map_err(Self::db_err)?,
            last_name: row.try_get("last_name").map_err(Self::db_err)?,
            phone_number: row.try_get("phone_number").map_err(Self::db_err)?,
            opted_out: row.try_get("opted_out").map_err(Self::db_err)?,
            custom_fields,
            total_calls: total_calls as u32,
            last_called: row.try_get("last_called").map_err(Self::db_err)?,
            last_call_status: last_status.as_deref().and_then(CallStatus::parse),
        })
    }
}

fn parse_sentiment_label(s: &str) -> Option<SentimentLabel> {
    match s {
        "positive" => Some(SentimentLabel::Positive),
        "neutral" => Some(SentimentLabel::Neutral),
        "negative" => Some(SentimentLabel::Negative),
        _ => None,
    }
}

fn parse_error_kind(s: &str) -> Option<crate::model::CallErrorKind> {
    use crate::model::CallErrorKind;
    match s {
        "retries-exhausted" => Some(CallErrorKind::RetriesExhausted),
        "provider-failure" => Some(CallErrorKind::ProviderFailure),
        "canceled" => Some(CallErrorKind::Canceled),
        _ => None,
    }
}

#[async_trait]
impl Sink for PgSink {
    async fn create_call(&self, call: Call) -> Result<(), SinkError> {
        sqlx::query(
            "insert into calls (
               id, campaign_id, contact_id, phone_number, provider_session_id,
               status, queued_at, started_at, ended_at, duration_secs,
               recording_url, sentiment_score, sentiment_label, answered,
               opted_out, human_escalation, attempts, last_attempt_at,
               next_retry_at, error_kind, error_message
             ) values (
               $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
               $15, $16, $17, $18, $19, $20, $21
             )",
        )
        .bind(call.id)
        .bind(&call.campaign_id)
        .bind(&call.contact_id)
        .bind(&call.phone_number)
        .bind(&call.provider_session_id)
        .bind(call.status.as_str())
        .bind(call.queued_at)
        .bind(call.started_at)
        .bind(call.ended_at)
        .bind(call.duration_secs.map(|d| d as i32))
        .bind(&call.recording_url)
        .bind(call.sentiment_score)
        .bind(call.sentiment_label.map(|l| l.as_str()))
        .bind(call.answered)
        .bind(call.opted_out)
        .bind(call.human_escalation)
        .bind(call.attempts as i32)
        .bind(call.last_attempt_at)
        .bind(call.next_retry_at)
        .bind(call.error.as_ref().map(|e| e.kind.as_str()))
        .bind(call.error.as_ref().map(|e| e.message.clone()))
        .execute(&self.pool)
        .await
        .map_err(Self::db_err)?;
        Ok(())
    }

    async fn get_call(&self, id: Uuid) -> Result<Option<Call>, SinkError> {
        let row = sqlx::query("select * from calls where id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::db_err)?;
        row.as_ref().map(Self::call_from_row).transpose()
    }

    async fn update_call(&self, id: Uuid, patch: CallPatch) -> Result<(), SinkError> {
        let clear_or_set_retry = patch.next_retry_at.is_some();
        let retry_value = patch.next_retry_at.flatten();
        let result = sqlx::query(
            "update calls set
               status = coalesce($2, status),
               provider_session_id = coalesce($3, provider_session_id),
               started_at = coalesce($4, started_at),
               ended_at = coalesce($5, ended_at),
               duration_secs = coalesce($6, duration_secs),
               recording_url = coalesce($7, recording_url),
               sentiment_score = coalesce($8, sentiment_score),
               sentiment_label = coalesce($9, sentiment_label),
               answered = coalesce($10, answered),
               opted_out = coalesce($11, opted_out),
               human_escalation = coalesce($12, human_escalation),
               attempts = coalesce($13, attempts),
               last_attempt_at = coalesce($14, last_attempt_at),
               next_retry_at = case when $15 then $16 else next_retry_at end,
               error_kind = coalesce($17, error_kind),
               error_message = coalesce($18, error_message)
             where id = $1",
        )
        .bind(id)
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.provider_session_id)
        .bind(patch.started_at)
        .bind(patch.ended_at)
        .bind(patch.duration_secs.map(|d| d as i32))
        .bind(patch.recording_url)
        .bind(patch.sentiment_score)
        .bind(patch.sentiment_label.map(|l| l.as_str()))
        .bind(patch.answered)
        .bind(patch.opted_out)
        .bind(patch.human_escalation)
        .bind(patch.attempts.map(|a| a as i32))
        .bind(patch.last_attempt_at)
        .bind(clear_or_set_retry)
        .bind(retry_value)
        .bind(patch.error.as_ref().map(|e| e.kind.as_str()))
        .bind(patch.error.map(|e| e.message))
        .execute(&self.pool)
        .await
        .map_err(Self::db_err)?;
        if result.rows_affected() == 0 {
            return Err(SinkError::UnknownCall(id));
        }
        Ok(())
    }

    async fn add_call_event(&self, event: CallEventRecord) -> Result<(), SinkError> {
        let kind = serde_json::to_string(&event.kind)
            .map_err(|e| SinkError::Database(e.to_string()))?;
        sqlx::query(
            "insert into call_events (id, call_id, kind, occurred_at, data)
             values ($1, $2, $3, $4, $5)",
        )
        .bind(event.id)
        .bind(event.call_id)
        .bind(kind.trim_matches('"'))
        .bind(event.timestamp)
        .bind(event.data.to_string())
        .execute(&self.pool)
        .await
        .map_err(Self::db_err)?;
        Ok(())
    }

    async fn add_conversation_turn(&self, turn: ConversationTurn) -> Result<(), SinkError> {
        sqlx::query(
            "insert into conversation_turns
               (id, call_id, speaker, content, occurred_at, audio_url, confidence, sentiment)
             values ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(turn.id)
        .bind(turn.call_id)
        .bind(turn.speaker.as_str())
        .bind(&turn.content)
        .bind(turn.timestamp)
        .bind(&turn.audio_url)
        .bind(turn.confidence)
        .bind(turn.sentiment)
        .execute(&self.pool)
        .await
        .map_err(Self::db_err)?;
        Ok(())
    }

    async fn store_turn_audio(
        &self,
        call_id: Uuid,
        turn_id: Uuid,
        bytes: Vec<u8>,
    ) -> Result<String, SinkError> {
        sqlx::query("insert into turn_audio (turn_id, call_id, body) values ($1, $2, $3)")
            .bind(turn_id)
            .bind(call_id)
            .bind(bytes)
            .execute(&self.pool)
            .await
            .map_err(Self::db_err)?;
        Ok(format!("db://turn-audio/{turn_id}"))
    }

    async fn turn_audio(&self, turn_id: Uuid) -> Result<Option<Vec<u8>>, SinkError> {
        let row = sqlx::query("select body from turn_audio where turn_id = $1")
            .bind(turn_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::db_err)?;
        row.map(|r| r.try_get("body").map_err(Self::db_err)).transpose()
    }

    async fn get_contact(&self, id: &str) -> Result<Option<Contact>, SinkError> {
        let row = sqlx::query("select * from contacts where id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::db_err)?;
        row.as_ref().map(Self::contact_from_row).transpose()
    }

    async fn queued_contacts(
        &self,
        campaign_id: &str,
        limit: usize,
    ) -> Result<Vec<Contact>, SinkError> {
        let rows = sqlx::query(
            "select c.* from contacts c
             join campaign_contacts cc on cc.contact_id = c.id
             where cc.campaign_id = $1
               and not c.opted_out
               and not exists (
                 select 1 from calls k
                 where k.contact_id = c.id and k.campaign_id = $1
               )
             order by c.id
             limit $2",
        )
        .bind(campaign_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::db_err)?;
        rows.iter().map(Self::contact_from_row).collect()
    }

    async fn mark_contact_opted_out(&self, contact_id: &str) -> Result<(), SinkError> {
        let result = sqlx::query(
            "update contacts set opted_out = true, opt_out_date = now() where id = $1",
        )
        .bind(contact_id)
        .execute(&self.pool)
        .await
        .map_err(Self::db_err)?;
        if result.rows_affected() == 0 {
            return Err(SinkError::UnknownContact(contact_id.to_string()));
        }
        debug!(contact_id, "contact marked opted out");
        Ok(())
    }

    async fn record_contact_call_result(
        &self,
        contact_id: &str,
        status: CallStatus,
    ) -> Result<(), SinkError> {
        sqlx::query(
            "update contacts set
               total_calls = total_calls + 1,
               last_called = now(),
               last_call_status = $2
             where id = $1",
        )
        .bind(contact_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(Self::db_err)?;
        Ok(())
    }

    async fn calls_due_for_retry(
        &self,
        campaign_id: &str,
        now: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<Call>, SinkError> {
        let rows = sqlx::query(
            "select * from calls
             where campaign_id = $1
               and next_retry_at is not null
               and next_retry_at <= $2
               and not opted_out
             order by next_retry_at
             limit $3",
        )
        .bind(campaign_id)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::db_err)?;
        rows.iter().map(Self::call_from_row).collect()
    }
}

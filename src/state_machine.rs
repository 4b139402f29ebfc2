use crate::consts::{
    EMA_ALPHA, LOW_CONFIDENCE_STREAK, LOW_CONFIDENCE_THRESHOLD, MAX_UTTERANCE_FAILURES,
    OPT_OUT_CONFIRMATION, OPT_OUT_KEYWORDS, REPROMPT_TEXT,
};
use crate::engine::{
    greeting_fallback, AudioFormat, ConversationContext, ConversationEngine, Sentiment,
};
use crate::gateway::{
    empty_document, render_control_document, ControlDocKind, ControlDocParams, TelephonyGateway,
};
use crate::model::{
    Call, CallError, CallErrorKind, CallEventKind, CallEventRecord, CallPatch, CallStatus,
    CampaignRuntimeConfig, Contact, ConversationTurn, SentimentLabel, Speaker,
};
use crate::sink::Sink;
use crate::twilio_types::{ProviderCallStatus, StatusCallbackPayload, TurnCallbackPayload};

use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const SIGNAL_BUFFER: usize = 32;

/// Provider status update distilled from a webhook payload.
#[derive(Clone, Debug)]
pub struct StatusUpdate {
    pub status: ProviderCallStatus,
    pub duration_secs: Option<u32>,
    pub recording_url: Option<String>,
}

impl StatusUpdate {
    pub fn from_payload(payload: &StatusCallbackPayload) -> Self {
        Self {
            status: payload.call_status,
            duration_secs: payload
                .call_duration
                .as_deref()
                .and_then(|d| d.parse().ok()),
            recording_url: payload.recording_url.clone(),
        }
    }
}

/// What the human said (or pressed) during one gather round.
#[derive(Clone, Default, Debug)]
pub struct TurnInput {
    pub speech: Option<String>,
    pub confidence: Option<f32>,
    pub digits: Option<String>,
}

impl TurnInput {
    pub fn from_payload(payload: &TurnCallbackPayload) -> Self {
        Self {
            speech: payload.speech_result.clone(),
            confidence: payload
                .confidence
                .as_deref()
                .and_then(|c| c.parse().ok()),
            digits: payload.digits.clone(),
        }
    }
}

/// Signals delivered to a call session.  All mutation of a live call flows
/// through its session channel, so per-call ordering matches arrival order.
pub enum CallSignal {
    Provider {
        update: StatusUpdate,
        reply: oneshot::Sender<String>,
    },
    Turn {
        input: TurnInput,
        reply: oneshot::Sender<String>,
    },
    Sentiment {
        turn_id: Uuid,
        sentiment: Sentiment,
    },
    Cancel,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum TurnPhase {
    AwaitingHumanSpeech,
    AwaitingAiResponse,
    Escalating,
}

#[derive(Clone)]
struct SessionHandle {
    tx: mpsc::Sender<CallSignal>,
    phone_number: String,
    campaign_id: String,
}

/// Registry of live sessions keyed by provider session id.  Webhook handlers
/// route through it; the dispatcher consults it for capacity and dedupe.
#[derive(Clone, Default)]
pub struct ActiveCalls {
    inner: Arc<Mutex<HashMap<String, SessionHandle>>>,
}

impl ActiveCalls {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(
        &self,
        session_id: &str,
        tx: mpsc::Sender<CallSignal>,
        phone_number: &str,
        campaign_id: &str,
    ) {
        self.inner.lock().unwrap().insert(
            session_id.to_string(),
            SessionHandle {
                tx,
                phone_number: phone_number.to_string(),
                campaign_id: campaign_id.to_string(),
            },
        );
    }

    fn deregister(&self, session_id: &str) {
        self.inner.lock().unwrap().remove(session_id);
    }

    pub fn signal_sender(&self, session_id: &str) -> Option<mpsc::Sender<CallSignal>> {
        self.inner
            .lock()
            .unwrap()
            .get(session_id)
            .map(|h| h.tx.clone())
    }

    pub fn phone_in_flight(&self, phone_number: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .values()
            .any(|h| h.phone_number == phone_number)
    }

    pub fn active_count(&self, campaign_id: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .values()
            .filter(|h| h.campaign_id == campaign_id)
            .count()
    }

    pub fn campaign_senders(&self, campaign_id: &str) -> Vec<mpsc::Sender<CallSignal>> {
        self.inner
            .lock()
            .unwrap()
            .values()
            .filter(|h| h.campaign_id == campaign_id)
            .map(|h| h.tx.clone())
            .collect()
    }
}

/// Shared collaborators handed to every session and webhook handler.
#[derive(Clone)]
pub struct SessionDeps {
    pub gateway: Arc<dyn TelephonyGateway>,
    pub engine: Arc<dyn ConversationEngine>,
    pub sink: Arc<dyn Sink>,
    pub registry: ActiveCalls,
    pub base_url: String,
    pub handoff_number: Option<String>,
}

impl SessionDeps {
    pub fn turn_url(&self) -> String {
        format!("{}/twilio/turn", self.base_url)
    }

    pub fn status_url(&self) -> String {
        format!("{}/twilio/status", self.base_url)
    }
}

/// Register and start a session task for a freshly placed call.  Registration
/// happens before spawning so a webhook racing the dispatcher still routes.
pub fn launch_session(
    deps: &SessionDeps,
    call: Call,
    contact: Contact,
    config: CampaignRuntimeConfig,
) {
    let session_id = match &call.provider_session_id {
        Some(sid) => sid.clone(),
        None => {
            error!(call=%call.id, "cannot launch session without provider session id");
            return;
        }
    };
    let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
    deps.registry
        .register(&session_id, tx.clone(), &call.phone_number, &call.campaign_id);
    let session = CallSession {
        call,
        contact,
        config,
        turns: Vec::new(),
        gateway: deps.gateway.clone(),
        engine: deps.engine.clone(),
        sink: deps.sink.clone(),
        registry: deps.registry.clone(),
        turn_url: deps.turn_url(),
        audio_base: format!("{}/audio", deps.base_url),
        handoff_number: deps.handoff_number.clone(),
        tx,
        rx,
        phase: TurnPhase::AwaitingHumanSpeech,
        low_confidence_streak: 0,
        utterance_failures: 0,
        opt_out_marked: false,
    };
    tokio::spawn(session.run());
}

fn is_opt_out(speech: &str, digits: &str) -> bool {
    if digits.contains('9') {
        return true;
    }
    let lowered = speech.to_lowercase();
    OPT_OUT_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Exponentially weighted running sentiment; recent turns dominate.
pub(crate) fn ema(previous: Option<f32>, sample: f32) -> f32 {
    match previous {
        None => sample,
        Some(prev) => EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * prev,
    }
}

fn fill_template(template: &str, contact: &Contact) -> String {
    let mut out = template
        .replace("{name}", &contact.full_name())
        .replace("{first_name}", &contact.first_name)
        .replace("{last_name}", &contact.last_name);
    for (key, value) in &contact.custom_fields {
        if let Some(s) = value.as_str() {
            out = out.replace(&format!("{{{key}}}"), s);
        }
    }
    out
}

/// Single-writer owner of one call.  The task consumes signals in order and
/// exits once the call reaches a terminal status.
struct CallSession {
    call: Call,
    contact: Contact,
    config: CampaignRuntimeConfig,
    turns: Vec<ConversationTurn>,
    gateway: Arc<dyn TelephonyGateway>,
    engine: Arc<dyn ConversationEngine>,
    sink: Arc<dyn Sink>,
    registry: ActiveCalls,
    turn_url: String,
    audio_base: String,
    handoff_number: Option<String>,
    tx: mpsc::Sender<CallSignal>,
    rx: mpsc::Receiver<CallSignal>,
    phase: TurnPhase,
    low_confidence_streak: u32,
    utterance_failures: u32,
    opt_out_marked: bool,
}

impl CallSession {
    async fn run(mut self) {
        while let Some(signal) = self.rx.recv().await {
            match signal {
                CallSignal::Provider { update, reply } => {
                    let doc = self.on_provider_status(update).await;
                    let _ = reply.send(doc);
                }
                CallSignal::Turn { input, reply } => {
                    let doc = self.on_turn(input).await;
                    let _ = reply.send(doc);
                }
                CallSignal::Sentiment { turn_id, sentiment } => {
                    self.on_sentiment(turn_id, sentiment).await;
                }
                CallSignal::Cancel => self.on_cancel().await,
            }
            if self.call.status.is_terminal() {
                break;
            }
        }
        self.drain_pending().await;
        self.close().await;
    }

    /// Sentiment samples already queued when the call went terminal still
    /// enrich the stored record before the session exits.
    async fn drain_pending(&mut self) {
        self.rx.close();
        while let Ok(signal) = self.rx.try_recv() {
            if let CallSignal::Sentiment { turn_id, sentiment } = signal {
                self.on_sentiment(turn_id, sentiment).await;
            }
        }
    }

    async fn persist(&mut self, patch: CallPatch) {
        self.call.apply(patch.clone());
        if let Err(e) = self.sink.update_call(self.call.id, patch).await {
            error!(error=%e, call=%self.call.id, "failed to persist call update");
        }
    }

    async fn record_event(&self, kind: CallEventKind, data: serde_json::Value) {
        let event = CallEventRecord::new(self.call.id, kind, data);
        if let Err(e) = self.sink.add_call_event(event).await {
            error!(error=%e, call=%self.call.id, "failed to record call event");
        }
    }

    async fn push_turn(&mut self, turn: ConversationTurn) {
        self.turns.push(turn.clone());
        if let Err(e) = self.sink.add_conversation_turn(turn.clone()).await {
            error!(error=%e, call=%self.call.id, "failed to persist conversation turn");
        }
        self.record_event(
            CallEventKind::TranscriptUpdated,
            json!({ "turn_id": turn.id, "speaker": turn.speaker.as_str() }),
        )
        .await;
    }

    fn context(&self) -> ConversationContext {
        ConversationContext {
            config: self.config.clone(),
            contact_name: self.contact.full_name(),
            contact_fields: self.contact.custom_fields.clone(),
            turns: self.turns.clone(),
        }
    }

    fn doc_params(&self, message: Option<String>) -> ControlDocParams {
        ControlDocParams {
            voice: self.config.voice.clone(),
            language: self.config.language.clone(),
            message,
            gather_action: Some(self.turn_url.clone()),
            audio_url: None,
            handoff_number: self.handoff_number.clone(),
        }
    }

    fn reprompt(&self) -> String {
        render_control_document(
            ControlDocKind::GatherSpeech,
            &self.doc_params(Some(REPROMPT_TEXT.to_string())),
        )
    }

    async fn on_provider_status(&mut self, update: StatusUpdate) -> String {
        if self.call.status.is_terminal() {
            debug!(call=%self.call.id, status=?update.status, "status signal after terminal state; ignoring");
            return empty_document();
        }
        match update.status {
            ProviderCallStatus::Queued
            | ProviderCallStatus::Initiated
            | ProviderCallStatus::Ringing => {
                match self.call.status {
                    CallStatus::Queued => {
                        self.persist(CallPatch {
                            status: Some(CallStatus::Dialing),
                            ..Default::default()
                        })
                        .await;
                    }
                    CallStatus::Dialing => {}
                    // Provider events can arrive out of order; a late ring
                    // must not regress an answered call.
                    _ => {
                        debug!(call=%self.call.id, status=?update.status, "stale ring signal; ignoring");
                    }
                }
                empty_document()
            }
            ProviderCallStatus::InProgress => self.on_answered().await,
            ProviderCallStatus::Completed => {
                self.finish_completed(update).await;
                empty_document()
            }
            ProviderCallStatus::Busy => {
                self.retryable_failure(CallStatus::Busy, "line busy").await;
                empty_document()
            }
            ProviderCallStatus::NoAnswer => {
                self.retryable_failure(CallStatus::NoAnswer, "no answer")
                    .await;
                empty_document()
            }
            ProviderCallStatus::Failed => {
                self.retryable_failure(CallStatus::Failed, "provider reported failure")
                    .await;
                empty_document()
            }
            ProviderCallStatus::Canceled => {
                self.fail_terminal(CallErrorKind::Canceled, "canceled by provider")
                    .await;
                empty_document()
            }
        }
    }

    async fn on_answered(&mut self) -> String {
        // The call-control URL and the status callback both deliver
        // in-progress; only the first delivery greets.
        if self.call.status == CallStatus::InProgress {
            debug!(call=%self.call.id, "duplicate in-progress delivery; already answered");
            return empty_document();
        }
        let now = OffsetDateTime::now_utc();
        self.persist(CallPatch {
            status: Some(CallStatus::InProgress),
            answered: Some(true),
            started_at: Some(now),
            ..Default::default()
        })
        .await;
        self.record_event(CallEventKind::CallAnswered, json!({})).await;

        let ctx = self.context();
        let greeting = match &self.config.greeting_template {
            Some(template) => fill_template(template, &self.contact),
            None => match self.engine.generate_greeting(&ctx).await {
                Ok(text) => text,
                Err(e) => {
                    warn!(error=%e, call=%self.call.id, "greeting generation failed; using template fallback");
                    greeting_fallback(&ctx)
                }
            },
        };
        let turn = ConversationTurn::new(self.call.id, Speaker::Ai, greeting.clone());
        self.push_turn(turn).await;
        self.phase = TurnPhase::AwaitingHumanSpeech;
        info!(call=%self.call.id, contact=%self.contact.id, "call answered; greeting delivered");
        render_control_document(ControlDocKind::Greeting, &self.doc_params(Some(greeting)))
    }

    async fn finish_completed(&mut self, update: StatusUpdate) {
        let now = OffsetDateTime::now_utc();
        let recording_url = match update.recording_url {
            Some(url) => Some(url),
            None => match &self.call.provider_session_id {
                Some(sid) => self.gateway.fetch_recording(sid).await.unwrap_or_default(),
                None => None,
            },
        };
        let duration_secs = update.duration_secs.or_else(|| {
            self.call
                .started_at
                .map(|s| (now - s).whole_seconds().max(0) as u32)
        });
        self.persist(CallPatch {
            status: Some(CallStatus::Completed),
            ended_at: Some(now),
            duration_secs,
            recording_url,
            next_retry_at: Some(None),
            ..Default::default()
        })
        .await;
        self.record_event(
            CallEventKind::CallEnded,
            json!({ "duration_secs": duration_secs }),
        )
        .await;
        info!(call=%self.call.id, duration_secs, "call completed");
    }

    /// Busy, no-answer, and transient failures get a linear-backoff redial
    /// slot until the attempt cap, then fail for good.
    async fn retryable_failure(&mut self, status: CallStatus, reason: &str) {
        if self.call.attempts >= self.config.max_retries {
            self.fail_terminal(CallErrorKind::RetriesExhausted, reason)
                .await;
            return;
        }
        let now = OffsetDateTime::now_utc();
        let next = now + self.config.retry_interval * self.call.attempts as i32;
        self.persist(CallPatch {
            status: Some(status),
            ended_at: Some(now),
            next_retry_at: Some(Some(next)),
            ..Default::default()
        })
        .await;
        self.record_event(
            CallEventKind::RetryScheduled,
            json!({
                "attempt": self.call.attempts,
                "reason": reason,
                "next_retry_at": next.to_string(),
            }),
        )
        .await;
        info!(call=%self.call.id, attempt = self.call.attempts, reason, "retry scheduled");
    }

    async fn fail_terminal(&mut self, kind: CallErrorKind, message: &str) {
        let now = OffsetDateTime::now_utc();
        self.persist(CallPatch {
            status: Some(CallStatus::Failed),
            ended_at: Some(now),
            next_retry_at: Some(None),
            error: Some(CallError::new(kind, message)),
            ..Default::default()
        })
        .await;
        self.record_event(
            CallEventKind::Error,
            json!({ "kind": kind.as_str(), "message": message }),
        )
        .await;
        warn!(call=%self.call.id, kind = kind.as_str(), message, "call failed");
    }

    async fn on_turn(&mut self, input: TurnInput) -> String {
        if self.call.status.is_terminal() || self.phase == TurnPhase::Escalating {
            return empty_document();
        }
        let speech = input.speech.unwrap_or_default();
        let digits = input.digits.unwrap_or_default();
        if speech.trim().is_empty() && digits.is_empty() {
            debug!(call=%self.call.id, "empty gather; reprompting");
            return self.reprompt();
        }

        // Context before this turn; the latest utterance travels separately.
        let ctx = self.context();
        let content = if speech.trim().is_empty() {
            format!("[keypad {digits}]")
        } else {
            speech.clone()
        };
        let mut turn = ConversationTurn::new(self.call.id, Speaker::Human, content.clone());
        turn.confidence = input.confidence;
        let turn_id = turn.id;
        self.push_turn(turn).await;
        self.spawn_sentiment(turn_id, content.clone());

        if is_opt_out(&speech, &digits) {
            return self.handle_opt_out().await;
        }

        let mut escalate_reason: Option<String> = None;
        let low_confidence = match self.engine.extract_intent(&content, &ctx).await {
            Ok(intent) => {
                if intent.requires_escalation {
                    escalate_reason = Some(format!("intent '{}' requires a human", intent.intent));
                }
                intent.confidence < LOW_CONFIDENCE_THRESHOLD
            }
            Err(e) => {
                debug!(error=%e, call=%self.call.id, "intent extraction failed");
                true
            }
        };
        if low_confidence {
            self.low_confidence_streak += 1;
        } else {
            self.low_confidence_streak = 0;
        }
        if escalate_reason.is_none() && self.low_confidence_streak >= LOW_CONFIDENCE_STREAK {
            escalate_reason = Some("repeated low-confidence understanding".to_string());
        }
        if escalate_reason.is_none() {
            match self.engine.should_escalate(&self.context()).await {
                Ok(check) if check.escalate => escalate_reason = Some(check.reason),
                Ok(_) => {}
                Err(e) => debug!(error=%e, call=%self.call.id, "escalation check failed"),
            }
        }
        if let Some(reason) = escalate_reason {
            return self.escalate(reason).await;
        }

        self.phase = TurnPhase::AwaitingAiResponse;
        match self.engine.next_utterance(&ctx, &content).await {
            Ok(text) => {
                self.utterance_failures = 0;
                self.phase = TurnPhase::AwaitingHumanSpeech;
                self.speak(text).await
            }
            Err(e) => {
                self.utterance_failures += 1;
                error!(error=%e, call=%self.call.id, failures = self.utterance_failures, "failed to generate response");
                if self.utterance_failures >= MAX_UTTERANCE_FAILURES {
                    self.escalate("response generation failed repeatedly".to_string())
                        .await
                } else {
                    self.phase = TurnPhase::AwaitingHumanSpeech;
                    self.reprompt()
                }
            }
        }
    }

    /// Deliver an AI utterance: synthesized audio when TTS and storage both
    /// succeed, provider voice otherwise.  The turn is recorded either way.
    async fn speak(&mut self, text: String) -> String {
        let mut turn = ConversationTurn::new(self.call.id, Speaker::Ai, text.clone());
        let mut audio_url = None;
        match self
            .engine
            .synthesize(&text, &self.config.voice, 1.0, AudioFormat::Mp3)
            .await
        {
            Ok(bytes) => match self.sink.store_turn_audio(self.call.id, turn.id, bytes).await {
                Ok(_) => audio_url = Some(format!("{}/{}", self.audio_base, turn.id)),
                Err(e) => {
                    warn!(error=%e, call=%self.call.id, "failed to store synthesized audio");
                }
            },
            Err(e) => {
                debug!(error=%e, call=%self.call.id, "synthesis failed; using provider voice");
            }
        }
        turn.audio_url = audio_url.clone();
        self.push_turn(turn).await;
        match audio_url {
            Some(url) => {
                let mut params = self.doc_params(None);
                params.audio_url = Some(url);
                render_control_document(ControlDocKind::PlayAudio, &params)
            }
            None => render_control_document(
                ControlDocKind::GatherSpeech,
                &self.doc_params(Some(text)),
            ),
        }
    }

    async fn escalate(&mut self, reason: String) -> String {
        self.phase = TurnPhase::Escalating;
        self.persist(CallPatch {
            human_escalation: Some(true),
            ..Default::default()
        })
        .await;
        self.record_event(
            CallEventKind::EscalationTriggered,
            json!({ "reason": reason }),
        )
        .await;
        warn!(call=%self.call.id, reason, "escalating to human");
        render_control_document(ControlDocKind::Escalate, &self.doc_params(None))
    }

    async fn handle_opt_out(&mut self) -> String {
        if !self.opt_out_marked {
            self.opt_out_marked = true;
            if let Err(e) = self.sink.mark_contact_opted_out(&self.contact.id).await {
                error!(error=%e, contact=%self.contact.id, "failed to persist opt-out");
            }
        }
        let now = OffsetDateTime::now_utc();
        self.persist(CallPatch {
            status: Some(CallStatus::OptedOut),
            opted_out: Some(true),
            ended_at: Some(now),
            next_retry_at: Some(None),
            ..Default::default()
        })
        .await;
        self.record_event(
            CallEventKind::OptedOut,
            json!({ "contact_id": self.contact.id }),
        )
        .await;
        info!(call=%self.call.id, contact=%self.contact.id, "contact opted out");
        render_control_document(
            ControlDocKind::Goodbye,
            &self.doc_params(Some(OPT_OUT_CONFIRMATION.to_string())),
        )
    }

    fn spawn_sentiment(&self, turn_id: Uuid, text: String) {
        let engine = self.engine.clone();
        let sink = self.sink.clone();
        let tx = self.tx.clone();
        let call_id = self.call.id;
        tokio::spawn(async move {
            let sentiment = match engine.score_sentiment(&text).await {
                Ok(s) => s,
                Err(e) => {
                    debug!(error=%e, call=%call_id, "sentiment scoring failed; treating as neutral");
                    Sentiment::neutral()
                }
            };
            let sample = sentiment.score;
            if tx
                .send(CallSignal::Sentiment { turn_id, sentiment })
                .await
                .is_err()
            {
                // Session already closed; enrich the stored call directly.
                if let Ok(Some(call)) = sink.get_call(call_id).await {
                    let score = ema(call.sentiment_score, sample);
                    let label = SentimentLabel::from_score(score);
                    let _ = sink
                        .update_call(
                            call_id,
                            CallPatch {
                                sentiment_score: Some(score),
                                sentiment_label: Some(label),
                                ..Default::default()
                            },
                        )
                        .await;
                    let _ = sink
                        .add_call_event(CallEventRecord::new(
                            call_id,
                            CallEventKind::SentimentUpdated,
                            json!({ "turn_id": turn_id, "sample": sample, "score": score }),
                        ))
                        .await;
                }
            }
        });
    }

    async fn on_sentiment(&mut self, turn_id: Uuid, sentiment: Sentiment) {
        let score = ema(self.call.sentiment_score, sentiment.score);
        let label = SentimentLabel::from_score(score);
        self.persist(CallPatch {
            sentiment_score: Some(score),
            sentiment_label: Some(label),
            ..Default::default()
        })
        .await;
        self.record_event(
            CallEventKind::SentimentUpdated,
            json!({
                "turn_id": turn_id,
                "sample": sentiment.score,
                "score": score,
                "label": label.as_str(),
            }),
        )
        .await;
    }

    async fn on_cancel(&mut self) {
        if self.call.status.is_terminal() {
            return;
        }
        if let Some(sid) = &self.call.provider_session_id {
            if let Err(e) = self.gateway.hang_up(sid).await {
                warn!(error=%e, call=%self.call.id, "hangup during cancel failed");
            }
        }
        self.fail_terminal(CallErrorKind::Canceled, "campaign cancelled")
            .await;
    }

    async fn close(self) {
        if let Some(sid) = &self.call.provider_session_id {
            self.registry.deregister(sid);
        }
        if self.call.status.is_terminal() {
            if let Err(e) = self
                .sink
                .record_contact_call_result(&self.contact.id, self.call.status)
                .await
            {
                error!(error=%e, contact=%self.contact.id, "failed to record contact call result");
            }
        }
        info!(
            call=%self.call.id,
            status = self.call.status.as_str(),
            attempts = self.call.attempts,
            "call session closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts;
    use crate::error::EngineError;
    use crate::sink::{MemorySink, Sink as _};
    use crate::testutil::{ScriptedEngine, StubGateway};
    use time::Duration;

    fn campaign_config() -> CampaignRuntimeConfig {
        CampaignRuntimeConfig {
            campaign_id: "camp-1".to_string(),
            script: "annual plan renewal".to_string(),
            personality: "warm".to_string(),
            goals: vec!["confirm renewal".to_string()],
            language: "en-US".to_string(),
            voice: "nova".to_string(),
            greeting_template: None,
            max_call_duration_secs: 300,
            max_retries: 3,
            retry_interval: Duration::minutes(30),
            personalization_fields: vec![],
            concurrency_limit: 5,
            token_budget: consts::DEFAULT_TOKEN_BUDGET,
            keep_recent_turns: consts::KEEP_RECENT_TURNS,
        }
    }

    fn contact() -> Contact {
        Contact {
            id: "ct1".to_string(),
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            phone_number: "+15550001111".to_string(),
            opted_out: false,
            custom_fields: HashMap::new(),
            total_calls: 0,
            last_called: None,
            last_call_status: None,
        }
    }

    struct Harness {
        sink: Arc<MemorySink>,
        registry: ActiveCalls,
        call_id: Uuid,
        tx: mpsc::Sender<CallSignal>,
    }

    async fn start(attempts: u32, engine: ScriptedEngine) -> Harness {
        let sink = Arc::new(MemorySink::new());
        let gateway = Arc::new(StubGateway::default());
        let engine = Arc::new(engine);
        let registry = ActiveCalls::new();

        let contact = contact();
        sink.add_contact("camp-1", contact.clone());

        let mut call = Call::new("camp-1", "ct1", "+15550001111");
        call.provider_session_id = Some("CA1".to_string());
        call.status = CallStatus::Dialing;
        call.attempts = attempts;
        let call_id = call.id;
        sink.create_call(call.clone()).await.unwrap();

        let deps = SessionDeps {
            gateway: gateway as Arc<dyn TelephonyGateway>,
            engine: engine as Arc<dyn ConversationEngine>,
            sink: sink.clone() as Arc<dyn Sink>,
            registry: registry.clone(),
            base_url: "https://example.com".to_string(),
            handoff_number: Some("+15550009999".to_string()),
        };
        launch_session(&deps, call, contact, campaign_config());
        let tx = registry.signal_sender("CA1").expect("session registered");
        Harness {
            sink,
            registry,
            call_id,
            tx,
        }
    }

    async fn send_status(tx: &mpsc::Sender<CallSignal>, status: ProviderCallStatus) -> String {
        let (reply, rx) = oneshot::channel();
        tx.send(CallSignal::Provider {
            update: StatusUpdate {
                status,
                duration_secs: None,
                recording_url: None,
            },
            reply,
        })
        .await
        .unwrap();
        rx.await.unwrap()
    }

    async fn send_turn(tx: &mpsc::Sender<CallSignal>, speech: Option<&str>, digits: Option<&str>) -> String {
        let (reply, rx) = oneshot::channel();
        tx.send(CallSignal::Turn {
            input: TurnInput {
                speech: speech.map(str::to_string),
                confidence: Some(0.9),
                digits: digits.map(str::to_string),
            },
            reply,
        })
        .await
        .unwrap();
        rx.await.unwrap()
    }

    async fn wait_for_call(
        sink: &MemorySink,
        id: Uuid,
        what: &str,
        pred: impl Fn(&Call) -> bool,
    ) -> Call {
        for _ in 0..200 {
            let call = sink.get_call(id).await.unwrap().unwrap();
            if pred(&call) {
                return call;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn answer_delivers_greeting_and_marks_in_progress() {
        let mut engine = ScriptedEngine::default();
        engine.push_greeting(Ok("Hi Ada, quick call about your renewal.".to_string()));
        let h = start(1, engine).await;

        let doc = send_status(&h.tx, ProviderCallStatus::Ringing).await;
        assert!(!doc.contains("<Say"));

        let doc = send_status(&h.tx, ProviderCallStatus::InProgress).await;
        assert!(doc.contains("Hi Ada, quick call about your renewal."));
        assert!(doc.contains("<Gather"));

        let call = h.sink.get_call(h.call_id).await.unwrap().unwrap();
        assert_eq!(call.status, CallStatus::InProgress);
        assert!(call.answered);
        assert!(call.started_at.is_some());
        assert_eq!(h.sink.turns_for(h.call_id).len(), 1);
        assert!(h
            .sink
            .events_for(h.call_id)
            .iter()
            .any(|e| e.kind == CallEventKind::CallAnswered));
    }

    #[tokio::test]
    async fn duplicate_answer_delivery_greets_only_once() {
        let h = start(1, ScriptedEngine::default()).await;

        let first = send_status(&h.tx, ProviderCallStatus::InProgress).await;
        assert!(first.contains("<Gather"));
        let started = h.sink.get_call(h.call_id).await.unwrap().unwrap().started_at;

        let second = send_status(&h.tx, ProviderCallStatus::InProgress).await;
        assert!(!second.contains("<Say"));

        let call = h.sink.get_call(h.call_id).await.unwrap().unwrap();
        assert_eq!(call.started_at, started);
        assert_eq!(h.sink.turns_for(h.call_id).len(), 1);
    }

    #[tokio::test]
    async fn late_ring_signal_does_not_regress_an_answered_call() {
        let h = start(1, ScriptedEngine::default()).await;
        send_status(&h.tx, ProviderCallStatus::InProgress).await;

        send_status(&h.tx, ProviderCallStatus::Ringing).await;

        let call = h.sink.get_call(h.call_id).await.unwrap().unwrap();
        assert_eq!(call.status, CallStatus::InProgress);
    }

    #[tokio::test]
    async fn greeting_failure_falls_back_to_template() {
        let mut engine = ScriptedEngine::default();
        engine.push_greeting(Err(EngineError::RateLimited));
        let h = start(1, engine).await;

        let doc = send_status(&h.tx, ProviderCallStatus::InProgress).await;
        assert!(doc.contains("Hello Ada Lovelace, this is an automated call regarding annual plan renewal."));
    }

    #[tokio::test]
    async fn completed_records_duration_and_closes_session() {
        let h = start(1, ScriptedEngine::default()).await;
        send_status(&h.tx, ProviderCallStatus::InProgress).await;

        let (reply, rx) = oneshot::channel();
        h.tx.send(CallSignal::Provider {
            update: StatusUpdate {
                status: ProviderCallStatus::Completed,
                duration_secs: Some(42),
                recording_url: Some("https://rec.example.com/RE1".to_string()),
            },
            reply,
        })
        .await
        .unwrap();
        rx.await.unwrap();

        let call = wait_for_call(&h.sink, h.call_id, "completion", |c| {
            c.status == CallStatus::Completed
        })
        .await;
        assert_eq!(call.duration_secs, Some(42));
        assert_eq!(
            call.recording_url.as_deref(),
            Some("https://rec.example.com/RE1")
        );

        // Session deregisters and the contact result lands.
        for _ in 0..200 {
            if h.registry.signal_sender("CA1").is_none() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(h.registry.signal_sender("CA1").is_none());
        let contact = wait_for_contact_result(&h.sink).await;
        assert_eq!(contact.total_calls, 1);
        assert_eq!(contact.last_call_status, Some(CallStatus::Completed));
    }

    async fn wait_for_contact_result(sink: &MemorySink) -> Contact {
        for _ in 0..200 {
            let c = sink.get_contact("ct1").await.unwrap().unwrap();
            if c.total_calls > 0 {
                return c;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("contact call result never recorded");
    }

    #[tokio::test]
    async fn busy_schedules_linear_retry() {
        let h = start(1, ScriptedEngine::default()).await;
        let before = OffsetDateTime::now_utc();
        send_status(&h.tx, ProviderCallStatus::Busy).await;

        let call = wait_for_call(&h.sink, h.call_id, "busy status", |c| {
            c.status == CallStatus::Busy
        })
        .await;
        let next = call.next_retry_at.expect("retry scheduled");
        let delay = next - before;
        assert!(delay >= Duration::minutes(29) && delay <= Duration::minutes(31));
        assert!(h
            .sink
            .events_for(h.call_id)
            .iter()
            .any(|e| e.kind == CallEventKind::RetryScheduled));
    }

    #[tokio::test]
    async fn second_attempt_backs_off_twice_the_interval() {
        let h = start(2, ScriptedEngine::default()).await;
        let before = OffsetDateTime::now_utc();
        send_status(&h.tx, ProviderCallStatus::NoAnswer).await;

        let call = wait_for_call(&h.sink, h.call_id, "no-answer status", |c| {
            c.status == CallStatus::NoAnswer
        })
        .await;
        let delay = call.next_retry_at.unwrap() - before;
        assert!(delay >= Duration::minutes(59) && delay <= Duration::minutes(61));
    }

    #[tokio::test]
    async fn attempt_cap_fails_terminally() {
        let h = start(3, ScriptedEngine::default()).await;
        send_status(&h.tx, ProviderCallStatus::NoAnswer).await;

        let call = wait_for_call(&h.sink, h.call_id, "terminal failure", |c| {
            c.status == CallStatus::Failed
        })
        .await;
        assert!(call.next_retry_at.is_none());
        assert_eq!(
            call.error.as_ref().map(|e| e.kind),
            Some(CallErrorKind::RetriesExhausted)
        );
    }

    #[tokio::test]
    async fn provider_cancel_is_failed_without_retry() {
        let h = start(1, ScriptedEngine::default()).await;
        send_status(&h.tx, ProviderCallStatus::Canceled).await;

        let call = wait_for_call(&h.sink, h.call_id, "canceled", |c| {
            c.status == CallStatus::Failed
        })
        .await;
        assert!(call.next_retry_at.is_none());
        assert_eq!(
            call.error.as_ref().map(|e| e.kind),
            Some(CallErrorKind::Canceled)
        );
    }

    #[tokio::test]
    async fn opt_out_digit_marks_contact_exactly_once() {
        let h = start(1, ScriptedEngine::default()).await;
        send_status(&h.tx, ProviderCallStatus::InProgress).await;

        let doc = send_turn(&h.tx, None, Some("9")).await;
        assert!(doc.contains(consts::OPT_OUT_CONFIRMATION));
        assert!(doc.contains("<Hangup"));

        let call = wait_for_call(&h.sink, h.call_id, "opt-out", |c| {
            c.status == CallStatus::OptedOut
        })
        .await;
        assert!(call.opted_out);
        assert!(call.next_retry_at.is_none());
        assert_eq!(h.sink.opt_out_mark_count("ct1"), 1);
        let contact = h.sink.get_contact("ct1").await.unwrap().unwrap();
        assert!(contact.opted_out);
    }

    #[tokio::test]
    async fn opt_out_keyword_in_speech_is_honored() {
        let h = start(1, ScriptedEngine::default()).await;
        send_status(&h.tx, ProviderCallStatus::InProgress).await;

        let doc = send_turn(&h.tx, Some("Please stop calling me."), None).await;
        assert!(doc.contains(consts::OPT_OUT_CONFIRMATION));
        assert_eq!(h.sink.opt_out_mark_count("ct1"), 1);
    }

    #[tokio::test]
    async fn sentiment_smoothing_weights_recent_turns() {
        let mut engine = ScriptedEngine::default();
        for score in [0.2, 0.8, -0.4] {
            engine.push_sentiment(Ok(Sentiment {
                score,
                ..Sentiment::neutral()
            }));
        }
        let h = start(1, engine).await;
        send_status(&h.tx, ProviderCallStatus::InProgress).await;

        for (speech, expected) in [
            ("that sounds fine", 0.2_f32),
            ("oh that is great news", 0.44),
            ("actually this is annoying", 0.104),
        ] {
            send_turn(&h.tx, Some(speech), None).await;
            wait_for_call(&h.sink, h.call_id, "sentiment update", |c| {
                c.sentiment_score
                    .map(|s| (s - expected).abs() < 1e-4)
                    .unwrap_or(false)
            })
            .await;
        }

        let call = h.sink.get_call(h.call_id).await.unwrap().unwrap();
        assert_eq!(call.sentiment_label, Some(SentimentLabel::Neutral));
    }

    #[tokio::test]
    async fn sentiment_queued_behind_a_terminal_status_still_lands() {
        let sink = Arc::new(MemorySink::new());
        let contact = contact();
        sink.add_contact("camp-1", contact.clone());

        let mut call = Call::new("camp-1", "ct1", "+15550001111");
        call.provider_session_id = Some("CA1".to_string());
        call.status = CallStatus::Completed;
        let call_id = call.id;
        sink.create_call(call.clone()).await.unwrap();

        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
        let mut session = CallSession {
            call,
            contact,
            config: campaign_config(),
            turns: Vec::new(),
            gateway: Arc::new(StubGateway::default()) as Arc<dyn TelephonyGateway>,
            engine: Arc::new(ScriptedEngine::default()) as Arc<dyn ConversationEngine>,
            sink: sink.clone() as Arc<dyn Sink>,
            registry: ActiveCalls::new(),
            turn_url: "https://example.com/twilio/turn".to_string(),
            audio_base: "https://example.com/audio".to_string(),
            handoff_number: None,
            tx: tx.clone(),
            rx,
            phase: TurnPhase::AwaitingHumanSpeech,
            low_confidence_streak: 0,
            utterance_failures: 0,
            opt_out_marked: false,
        };

        tx.send(CallSignal::Sentiment {
            turn_id: Uuid::new_v4(),
            sentiment: Sentiment {
                score: 0.6,
                ..Sentiment::neutral()
            },
        })
        .await
        .unwrap();
        session.drain_pending().await;

        let stored = sink.get_call(call_id).await.unwrap().unwrap();
        assert!((stored.sentiment_score.unwrap() - 0.6).abs() < 1e-6);
        assert!(sink
            .events_for(call_id)
            .iter()
            .any(|e| e.kind == CallEventKind::SentimentUpdated));
    }

    #[tokio::test]
    async fn repeated_generation_failures_escalate() {
        let mut engine = ScriptedEngine::default();
        engine.push_utterance(Err(EngineError::UpstreamUnavailable("503".to_string())));
        engine.push_utterance(Err(EngineError::UpstreamUnavailable("503".to_string())));
        let h = start(1, engine).await;
        send_status(&h.tx, ProviderCallStatus::InProgress).await;

        let doc = send_turn(&h.tx, Some("tell me more"), None).await;
        assert!(doc.contains(&consts::REPROMPT_TEXT.replace('\'', "&apos;")));

        let doc = send_turn(&h.tx, Some("hello?"), None).await;
        assert!(doc.contains("<Dial"));

        let call = wait_for_call(&h.sink, h.call_id, "escalation flag", |c| c.human_escalation).await;
        assert_eq!(call.status, CallStatus::InProgress);
        assert!(h
            .sink
            .events_for(h.call_id)
            .iter()
            .any(|e| e.kind == CallEventKind::EscalationTriggered));
    }

    #[tokio::test]
    async fn low_confidence_streak_escalates() {
        let mut engine = ScriptedEngine::default();
        for _ in 0..2 {
            engine.push_intent(Ok(crate::engine::IntentAnalysis {
                confidence: 0.1,
                ..Default::default()
            }));
        }
        let h = start(1, engine).await;
        send_status(&h.tx, ProviderCallStatus::InProgress).await;

        let doc = send_turn(&h.tx, Some("mumble mumble"), None).await;
        assert!(!doc.contains("<Dial"));
        let doc = send_turn(&h.tx, Some("static noise"), None).await;
        assert!(doc.contains("<Dial"));
    }

    #[tokio::test]
    async fn engine_escalation_check_is_honored() {
        let mut engine = ScriptedEngine::default();
        engine.push_escalation(Ok(crate::engine::EscalationCheck {
            escalate: true,
            reason: "caller asked for a human".to_string(),
            urgency: crate::engine::Urgency::High,
        }));
        let h = start(1, engine).await;
        send_status(&h.tx, ProviderCallStatus::InProgress).await;

        let doc = send_turn(&h.tx, Some("let me talk to a person"), None).await;
        assert!(doc.contains("<Dial"));
    }

    #[tokio::test]
    async fn ai_response_plays_synthesized_audio() {
        let h = start(1, ScriptedEngine::default()).await;
        send_status(&h.tx, ProviderCallStatus::InProgress).await;

        let doc = send_turn(&h.tx, Some("tell me more"), None).await;
        assert!(doc.contains("<Play"));
        assert!(doc.contains("/audio/"));
        assert!(doc.contains("<Gather"));

        let turns = h.sink.turns_for(h.call_id);
        let response = turns.last().unwrap();
        assert_eq!(response.speaker, Speaker::Ai);
        let url = response.audio_url.as_deref().expect("audio stored");
        let turn_id: Uuid = url.rsplit('/').next().unwrap().parse().unwrap();
        assert!(h.sink.turn_audio(turn_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn empty_gather_reprompts_without_recording_a_turn() {
        let h = start(1, ScriptedEngine::default()).await;
        send_status(&h.tx, ProviderCallStatus::InProgress).await;
        let turns_before = h.sink.turns_for(h.call_id).len();

        let doc = send_turn(&h.tx, None, None).await;
        assert!(doc.contains(&consts::REPROMPT_TEXT.replace('\'', "&apos;")));
        assert_eq!(h.sink.turns_for(h.call_id).len(), turns_before);
    }

    #[test]
    fn ema_starts_at_first_sample() {
        assert!((ema(None, 0.2) - 0.2).abs() < f32::EPSILON);
        assert!((ema(Some(0.2), 0.8) - 0.44).abs() < 1e-6);
        assert!((ema(Some(0.44), -0.4) - 0.104).abs() < 1e-6);
    }

    #[test]
    fn opt_out_detection_covers_digits_and_phrases() {
        assert!(is_opt_out("", "9"));
        assert!(is_opt_out("please remove me from your list", ""));
        assert!(is_opt_out("STOP CALLING", ""));
        assert!(!is_opt_out("yes, nine sounds good", ""));
        assert!(!is_opt_out("tell me more", "1"));
    }

    #[test]
    fn greeting_template_substitutes_contact_fields() {
        let mut c = contact();
        c.custom_fields
            .insert("plan".to_string(), serde_json::json!("Gold"));
        let out = fill_template("Hi {first_name}, about your {plan} plan.", &c);
        assert_eq!(out, "Hi Ada, about your Gold plan.");
    }
}

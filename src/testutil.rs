use crate::engine::{
    AudioFormat, ConversationContext, ConversationEngine, EscalationCheck, IntentAnalysis,
    Sentiment, Transcription, Urgency,
};
use crate::error::{EngineError, GatewayError};
use crate::gateway::{PlaceCallOptions, TelephonyGateway};

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Gateway double recording placements and hangups; placement failures can be
/// scripted ahead of time.
#[derive(Default)]
pub struct StubGateway {
    placed: Mutex<Vec<String>>,
    hangups: Mutex<Vec<String>>,
    placement_failures: Mutex<VecDeque<GatewayError>>,
    next_sid: AtomicUsize,
}

impl StubGateway {
    pub fn fail_next_placement(&self, err: GatewayError) {
        self.placement_failures.lock().unwrap().push_back(err);
    }

    pub fn placed_destinations(&self) -> Vec<String> {
        self.placed.lock().unwrap().clone()
    }

    pub fn hangups(&self) -> Vec<String> {
        self.hangups.lock().unwrap().clone()
    }
}

#[async_trait]
impl TelephonyGateway for StubGateway {
    async fn place_call(
        &self,
        destination: &str,
        _control_url: &str,
        _status_callback_url: &str,
        _opts: &PlaceCallOptions,
    ) -> Result<String, GatewayError> {
        if let Some(err) = self.placement_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.placed.lock().unwrap().push(destination.to_string());
        let n = self.next_sid.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("CA-stub-{n}"))
    }

    async fn update_live_call(
        &self,
        _session_id: &str,
        _control_url: &str,
    ) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn hang_up(&self, session_id: &str) -> Result<(), GatewayError> {
        self.hangups.lock().unwrap().push(session_id.to_string());
        Ok(())
    }

    async fn fetch_recording(&self, _session_id: &str) -> Result<Option<String>, GatewayError> {
        Ok(None)
    }
}

/// Engine double.  Each queue is popped per invocation; empty queues yield a
/// benign default so tests only script what they assert on.
#[derive(Default)]
pub struct ScriptedEngine {
    greetings: Mutex<VecDeque<Result<String, EngineError>>>,
    utterances: Mutex<VecDeque<Result<String, EngineError>>>,
    sentiments: Mutex<VecDeque<Result<Sentiment, EngineError>>>,
    intents: Mutex<VecDeque<Result<IntentAnalysis, EngineError>>>,
    escalations: Mutex<VecDeque<Result<EscalationCheck, EngineError>>>,
}

impl ScriptedEngine {
    pub fn push_greeting(&mut self, result: Result<String, EngineError>) {
        self.greetings.lock().unwrap().push_back(result);
    }

    pub fn push_utterance(&mut self, result: Result<String, EngineError>) {
        self.utterances.lock().unwrap().push_back(result);
    }

    pub fn push_sentiment(&mut self, result: Result<Sentiment, EngineError>) {
        self.sentiments.lock().unwrap().push_back(result);
    }

    pub fn push_intent(&mut self, result: Result<IntentAnalysis, EngineError>) {
        self.intents.lock().unwrap().push_back(result);
    }

    pub fn push_escalation(&mut self, result: Result<EscalationCheck, EngineError>) {
        self.escalations.lock().unwrap().push_back(result);
    }
}

#[async_trait]
impl ConversationEngine for ScriptedEngine {
    async fn transcribe(
        &self,
        _audio: &[u8],
        _language_hint: &str,
    ) -> Result<Transcription, EngineError> {
        Ok(Transcription {
            text: "stub transcript".to_string(),
            confidence: 0.95,
            duration_secs: 1.0,
        })
    }

    async fn synthesize(
        &self,
        _text: &str,
        _voice: &str,
        _speed: f32,
        _format: AudioFormat,
    ) -> Result<Vec<u8>, EngineError> {
        Ok(vec![0; 4])
    }

    async fn next_utterance(
        &self,
        _ctx: &ConversationContext,
        _latest_human_text: &str,
    ) -> Result<String, EngineError> {
        self.utterances
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("Understood. Anything else I can help with?".to_string()))
    }

    async fn score_sentiment(&self, _text: &str) -> Result<Sentiment, EngineError> {
        self.sentiments
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Sentiment::neutral()))
    }

    async fn extract_intent(
        &self,
        _text: &str,
        _ctx: &ConversationContext,
    ) -> Result<IntentAnalysis, EngineError> {
        self.intents.lock().unwrap().pop_front().unwrap_or_else(|| {
            Ok(IntentAnalysis {
                intent: "question".to_string(),
                confidence: 0.9,
                ..Default::default()
            })
        })
    }

    async fn should_escalate(
        &self,
        _ctx: &ConversationContext,
    ) -> Result<EscalationCheck, EngineError> {
        self.escalations
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(EscalationCheck {
                    escalate: false,
                    reason: String::new(),
                    urgency: Urgency::Low,
                })
            })
    }

    async fn generate_greeting(&self, _ctx: &ConversationContext) -> Result<String, EngineError> {
        self.greetings
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("Hello, this is a quick courtesy call.".to_string()))
    }
}

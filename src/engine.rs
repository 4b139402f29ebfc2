use crate::error::EngineError;
use crate::model::{CampaignRuntimeConfig, ConversationTurn, SentimentLabel, Speaker};
use crate::openai_types::{
    OpenAIBatchResponse, OpenAIMessage, OpenAIPayload, SpeechPayload, TranscriptionResponse,
};

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, error};

const CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const TRANSCRIPTION_URL: &str = "https://api.openai.com/v1/audio/transcriptions";
const SPEECH_URL: &str = "https://api.openai.com/v1/audio/speech";
const CHAT_MODEL: &str = "gpt-4-turbo-preview";
const WHISPER_MODEL: &str = "whisper-1";
const TTS_MODEL: &str = "tts-1-hd";

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AudioFormat {
    Mp3,
    Opus,
    Aac,
    Flac,
}

impl AudioFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Opus => "opus",
            AudioFormat::Aac => "aac",
            AudioFormat::Flac => "flac",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Transcription {
    pub text: String,
    pub confidence: f32,
    pub duration_secs: f32,
}

#[derive(Deserialize, Clone, Copy, Default, Debug)]
#[serde(default)]
pub struct EmotionScores {
    pub joy: f32,
    pub anger: f32,
    pub fear: f32,
    pub sadness: f32,
    pub surprise: f32,
    pub trust: f32,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Sentiment {
    pub score: f32,
    pub magnitude: f32,
    pub label: SentimentLabel,
    pub confidence: f32,
    pub emotions: EmotionScores,
}

impl Default for Sentiment {
    fn default() -> Self {
        Self::neutral()
    }
}

impl Sentiment {
    /// Safe fallback used whenever analysis fails; sentiment is advisory and
    /// must never block a call.
    pub fn neutral() -> Self {
        Self {
            score: 0.0,
            magnitude: 0.0,
            label: SentimentLabel::Neutral,
            confidence: 0.0,
            emotions: EmotionScores::default(),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase", default)]
pub struct IntentAnalysis {
    pub intent: String,
    pub entities: serde_json::Value,
    pub confidence: f32,
    pub requires_escalation: bool,
    pub suggested_response: Option<String>,
}

impl Default for IntentAnalysis {
    fn default() -> Self {
        Self {
            intent: "unknown".to_string(),
            entities: serde_json::Value::Null,
            confidence: 0.0,
            requires_escalation: false,
            suggested_response: None,
        }
    }
}

#[derive(Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Medium,
    High,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct EscalationCheck {
    #[serde(rename = "shouldEscalate", default)]
    pub escalate: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default = "default_urgency")]
    pub urgency: Urgency,
}

fn default_urgency() -> Urgency {
    Urgency::Low
}

/// Rough token estimate used to bound prompt size; one token per four chars.
pub fn approx_tokens(text: &str) -> usize {
    text.len() / 4 + 1
}

/// Everything the engine needs to speak for one call: the campaign snapshot,
/// who we are talking to, and the ordered turn history.
#[derive(Clone, Debug)]
pub struct ConversationContext {
    pub config: CampaignRuntimeConfig,
    pub contact_name: String,
    pub contact_fields: HashMap<String, serde_json::Value>,
    pub turns: Vec<ConversationTurn>,
}

impl ConversationContext {
    pub fn system_prompt(&self) -> String {
        let goals = if self.config.goals.is_empty() {
            "Engage and inform".to_string()
        } else {
            self.config.goals.join(", ")
        };
        let fields = serde_json::to_string(&self.contact_fields).unwrap_or_default();
        format!(
            "You are an AI phone agent making an outbound call.\n\
             Contact: {name}\n\
             Campaign: {script}\n\
             Personality: {personality}\n\
             Goals: {goals}\n\
             Language: {language}\n\
             Contact information: {fields}\n\n\
             Instructions:\n\
             - Keep responses conversational and natural (under 50 words)\n\
             - Stay on topic and work toward your goals\n\
             - Be respectful of the person's time\n\
             - If asked to opt out, immediately acknowledge and end politely\n\
             - If complex issues arise, offer to transfer to a human\n\
             - Match the specified personality and language\n\
             - Sound human, not robotic",
            name = self.contact_name,
            script = self.non_empty_script(),
            personality = self.non_empty_personality(),
            goals = goals,
            language = self.config.language,
            fields = fields,
        )
    }

    fn non_empty_script(&self) -> &str {
        if self.config.script.is_empty() {
            "General outreach"
        } else {
            &self.config.script
        }
    }

    fn non_empty_personality(&self) -> &str {
        if self.config.personality.is_empty() {
            "Professional and friendly"
        } else {
            &self.config.personality
        }
    }

    /// History slice fitted to the token budget.  Oldest turns are dropped
    /// first; the most recent `keep_recent_turns` are always retained intact
    /// to preserve discourse coherence.
    pub fn trimmed_turns(&self) -> &[ConversationTurn] {
        let keep = self.config.keep_recent_turns.min(self.turns.len());
        let mut start = 0;
        while self.turns.len() - start > keep {
            let used: usize = self.turns[start..]
                .iter()
                .map(|t| approx_tokens(&t.content))
                .sum();
            if used <= self.config.token_budget {
                break;
            }
            start += 1;
        }
        &self.turns[start..]
    }

    pub fn history_messages(&self, latest_human_text: &str) -> Vec<OpenAIMessage> {
        let mut messages = vec![OpenAIMessage::system(self.system_prompt())];
        for turn in self.trimmed_turns() {
            let msg = match turn.speaker {
                Speaker::Ai => OpenAIMessage::assistant(turn.content.clone()),
                Speaker::Human => OpenAIMessage::user(turn.content.clone()),
            };
            messages.push(msg);
        }
        messages.push(OpenAIMessage::user(latest_human_text));
        messages
    }

    fn turns_as_text(&self) -> String {
        self.trimmed_turns()
            .iter()
            .map(|t| format!("{}: {}", t.speaker.as_str(), t.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Deterministic templated greeting used when generation fails; call start
/// must never block on the engine.
pub fn greeting_fallback(ctx: &ConversationContext) -> String {
    let purpose = if ctx.config.script.is_empty() {
        "an important matter"
    } else {
        &ctx.config.script
    };
    format!(
        "Hello {}, this is an automated call regarding {}.",
        ctx.contact_name, purpose
    )
}

#[async_trait]
pub trait ConversationEngine: Send + Sync {
    async fn transcribe(
        &self,
        audio: &[u8],
        language_hint: &str,
    ) -> Result<Transcription, EngineError>;

    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        speed: f32,
        format: AudioFormat,
    ) -> Result<Vec<u8>, EngineError>;

    async fn next_utterance(
        &self,
        ctx: &ConversationContext,
        latest_human_text: &str,
    ) -> Result<String, EngineError>;

    async fn score_sentiment(&self, text: &str) -> Result<Sentiment, EngineError>;

    async fn extract_intent(
        &self,
        text: &str,
        ctx: &ConversationContext,
    ) -> Result<IntentAnalysis, EngineError>;

    async fn should_escalate(
        &self,
        ctx: &ConversationContext,
    ) -> Result<EscalationCheck, EngineError>;

    async fn generate_greeting(&self, ctx: &ConversationContext) -> Result<String, EngineError>;
}

/// OpenAI-backed engine: Whisper for transcription, TTS for synthesis, chat
/// completions for everything else.
pub struct OpenAiEngine {
    http: reqwest::Client,
    api_key: String,
}

impl OpenAiEngine {
    pub fn new(http: reqwest::Client, api_key: impl Into<String>) -> Self {
        Self {
            http,
            api_key: api_key.into(),
        }
    }

    async fn chat(
        &self,
        messages: Vec<OpenAIMessage>,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, EngineError> {
        let payload = OpenAIPayload {
            model: CHAT_MODEL.to_string(),
            messages,
            max_tokens: Some(max_tokens),
            temperature: Some(temperature),
        };
        let resp = self
            .http
            .post(CHAT_URL)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.api_key),
            )
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                error!(error=%e, "failed to reach conversation upstream");
                EngineError::UpstreamUnavailable(e.to_string())
            })?;
        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(EngineError::RateLimited);
        }
        if !status.is_success() {
            return Err(EngineError::UpstreamUnavailable(format!(
                "chat completion returned {status}"
            )));
        }
        let body: OpenAIBatchResponse = resp
            .json()
            .await
            .map_err(|e| EngineError::MalformedResponse(e.to_string()))?;
        body.choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .ok_or_else(|| EngineError::MalformedResponse("empty choices".to_string()))
    }

    async fn chat_json<T: serde::de::DeserializeOwned>(
        &self,
        system: String,
        user: String,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<T, EngineError> {
        let content = self
            .chat(
                vec![OpenAIMessage::system(system), OpenAIMessage::user(user)],
                max_tokens,
                temperature,
            )
            .await?;
        serde_json::from_str(&content).map_err(|e| {
            error!(error=%e, content=%content, "analysis response was not valid JSON");
            EngineError::MalformedResponse(e.to_string())
        })
    }
}

#[async_trait]
impl ConversationEngine for OpenAiEngine {
    async fn transcribe(
        &self,
        audio: &[u8],
        language_hint: &str,
    ) -> Result<Transcription, EngineError> {
        let part = reqwest::multipart::Part::bytes(audio.to_vec())
            .file_name("turn.wav")
            .mime_str("audio/wav")
            .map_err(|e| EngineError::MalformedResponse(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", WHISPER_MODEL)
            .text("language", language_hint.to_string())
            .text("response_format", "verbose_json");
        let resp = self
            .http
            .post(TRANSCRIPTION_URL)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.api_key),
            )
            .multipart(form)
            .send()
            .await
            .map_err(|e| EngineError::UpstreamUnavailable(e.to_string()))?;
        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(EngineError::RateLimited);
        }
        if !status.is_success() {
            return Err(EngineError::UpstreamUnavailable(format!(
                "transcription returned {status}"
            )));
        }
        let body: TranscriptionResponse = resp
            .json()
            .await
            .map_err(|e| EngineError::MalformedResponse(e.to_string()))?;
        Ok(Transcription {
            text: body.text,
            // Whisper does not report confidence; assume high.
            confidence: 0.95,
            duration_secs: body.duration.unwrap_or(0.0),
        })
    }

    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        speed: f32,
        format: AudioFormat,
    ) -> Result<Vec<u8>, EngineError> {
        let payload = SpeechPayload {
            model: TTS_MODEL.to_string(),
            voice: voice.to_string(),
            input: text.to_string(),
            response_format: format.as_str().to_string(),
            speed,
        };
        let resp = self
            .http
            .post(SPEECH_URL)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.api_key),
            )
            .json(&payload)
            .send()
            .await
            .map_err(|e| EngineError::UpstreamUnavailable(e.to_string()))?;
        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(EngineError::RateLimited);
        }
        if !status.is_success() {
            return Err(EngineError::UpstreamUnavailable(format!(
                "speech synthesis returned {status}"
            )));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| EngineError::MalformedResponse(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn next_utterance(
        &self,
        ctx: &ConversationContext,
        latest_human_text: &str,
    ) -> Result<String, EngineError> {
        let messages = ctx.history_messages(latest_human_text);
        debug!(turns = ctx.turns.len(), "requesting next utterance");
        self.chat(messages, 500, 0.7).await
    }

    async fn score_sentiment(&self, text: &str) -> Result<Sentiment, EngineError> {
        let system = "Analyze the sentiment of the following text and return a JSON object with:\n\
             - score: number between -1 (very negative) and 1 (very positive)\n\
             - magnitude: number between 0 and 1 indicating strength of emotion\n\
             - label: \"positive\", \"neutral\", or \"negative\"\n\
             - confidence: number between 0 and 1\n\
             - emotions: object with joy, anger, fear, sadness, surprise, trust scores (0-1 each)\n\
             Respond with only valid JSON, no other text."
            .to_string();
        self.chat_json(system, text.to_string(), 200, 0.3).await
    }

    async fn extract_intent(
        &self,
        text: &str,
        ctx: &ConversationContext,
    ) -> Result<IntentAnalysis, EngineError> {
        let system = format!(
            "Analyze the user's message for intent and extract key information.\n\
             Campaign: {script}. Goals: {goals}.\n\
             Return JSON with:\n\
             - intent: main purpose (question, complaint, interest, opt_out, escalation, etc.)\n\
             - entities: extracted information (dates, names, preferences, etc.)\n\
             - confidence: 0-1 how sure you are\n\
             - requiresEscalation: true if a human agent is needed\n\
             - suggestedResponse: brief response suggestion if confidence > 0.8\n\
             Respond with only valid JSON.",
            script = ctx.non_empty_script(),
            goals = ctx.config.goals.join(", "),
        );
        self.chat_json(system, text.to_string(), 300, 0.3).await
    }

    async fn should_escalate(
        &self,
        ctx: &ConversationContext,
    ) -> Result<EscalationCheck, EngineError> {
        let system = "Analyze this conversation to determine if human escalation is needed.\n\
             Escalation triggers:\n\
             - Specific requests for a human agent\n\
             - Emotional distress or anger\n\
             - Legal or compliance concerns\n\
             - Complex complaints beyond AI capability\n\
             Return JSON with:\n\
             - shouldEscalate: boolean\n\
             - reason: specific reason if true\n\
             - urgency: \"low\", \"medium\", or \"high\""
            .to_string();
        self.chat_json(system, ctx.turns_as_text(), 150, 0.2).await
    }

    async fn generate_greeting(&self, ctx: &ConversationContext) -> Result<String, EngineError> {
        let fields = serde_json::to_string(&ctx.contact_fields).unwrap_or_default();
        let system = format!(
            "Generate a natural, personalized phone greeting.\n\
             Campaign: {script}\n\
             Personality: {personality}\n\
             Contact: {name}\n\
             Contact data: {fields}\n\
             Language: {language}\n\
             Rules:\n\
             - Keep it under 30 words\n\
             - Use the contact's name appropriately\n\
             - Include the main purpose briefly\n\
             - Don't sound robotic or scripted",
            script = ctx.non_empty_script(),
            personality = ctx.non_empty_personality(),
            name = ctx.contact_name,
            fields = fields,
            language = ctx.config.language,
        );
        self.chat(vec![OpenAIMessage::system(system)], 150, 0.8).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Speaker;
    use time::Duration;
    use uuid::Uuid;

    fn config(token_budget: usize, keep_recent: usize) -> CampaignRuntimeConfig {
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
            token_budget,
            keep_recent_turns: keep_recent,
        }
    }

    fn ctx(token_budget: usize, keep_recent: usize, n_turns: usize) -> ConversationContext {
        let call_id = Uuid::new_v4();
        let turns = (0..n_turns)
            .map(|i| {
                let speaker = if i % 2 == 0 { Speaker::Human } else { Speaker::Ai };
                ConversationTurn::new(
                    call_id,
                    speaker,
                    format!("turn {i} with some filler words to take up budget"),
                )
            })
            .collect();
        ConversationContext {
            config: config(token_budget, keep_recent),
            contact_name: "Ada Lovelace".to_string(),
            contact_fields: HashMap::new(),
            turns,
        }
    }

    #[test]
    fn history_under_budget_is_untrimmed() {
        let ctx = ctx(10_000, 4, 10);
        assert_eq!(ctx.trimmed_turns().len(), 10);
    }

    #[test]
    fn trimming_drops_oldest_first_and_keeps_recent() {
        // Each turn is ~12 tokens; a budget of 30 forces trimming well below
        // ten turns, but the recent-turn floor must hold.
        let ctx = ctx(30, 4, 10);
        let trimmed = ctx.trimmed_turns();
        assert_eq!(trimmed.len(), 4);
        assert!(trimmed[0].content.starts_with("turn 6"));
        assert!(trimmed[3].content.starts_with("turn 9"));
    }

    #[test]
    fn history_messages_end_with_latest_human_text() {
        let ctx = ctx(10_000, 4, 3);
        let messages = ctx.history_messages("can you repeat the price?");
        assert_eq!(messages[0].role, "system");
        let last = messages.last().unwrap();
        assert_eq!(last.role, "user");
        assert_eq!(last.content, "can you repeat the price?");
        // system + 3 turns + latest
        assert_eq!(messages.len(), 5);
    }

    #[test]
    fn greeting_fallback_names_contact_and_purpose() {
        let ctx = ctx(10_000, 4, 0);
        let greeting = greeting_fallback(&ctx);
        assert!(greeting.contains("Ada Lovelace"));
        assert!(greeting.contains("annual plan renewal"));
    }

    #[test]
    fn greeting_fallback_without_script_stays_generic() {
        let mut ctx = ctx(10_000, 4, 0);
        ctx.config.script.clear();
        assert!(greeting_fallback(&ctx).contains("an important matter"));
    }

    #[test]
    fn whisper_verbose_json_parses_text_and_duration() {
        let json = r#"{"text":"hello there","duration":2.4,"language":"english"}"#;
        let resp: TranscriptionResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.text, "hello there");
        assert!((resp.duration.unwrap() - 2.4).abs() < 1e-6);
        assert_eq!(resp.language.as_deref(), Some("english"));
    }

    #[test]
    fn sentiment_defaults_are_neutral() {
        let s: Sentiment = serde_json::from_str("{}").unwrap();
        assert_eq!(s.score, 0.0);
        assert_eq!(s.label, SentimentLabel::Neutral);
    }

    #[test]
    fn escalation_check_parses_llm_shape() {
        let json = r#"{"shouldEscalate": true, "reason": "caller asked for a human", "urgency": "high"}"#;
        let check: EscalationCheck = serde_json::from_str(json).unwrap();
        assert!(check.escalate);
        assert_eq!(check.urgency, Urgency::High);
    }

    #[test]
    fn intent_analysis_defaults_to_unknown() {
        let intent: IntentAnalysis = serde_json::from_str("{}").unwrap();
        assert_eq!(intent.intent, "unknown");
        assert!(!intent.requires_escalation);
        assert_eq!(intent.confidence, 0.0);
    }
}

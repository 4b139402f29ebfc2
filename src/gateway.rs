use crate::consts::{APOLOGY_TEXT, GATHER_TIMEOUT_SECS, OPT_OUT_PROMPT};
use crate::error::GatewayError;
use crate::twilio_types::{
    wrap_twiml, DialAction, GatherAction, GatherInput, HangupAction, PauseAction, PlayAction,
    Response, ResponseAction, SayAction,
};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, error};

/// Call-control document kinds the orchestrator can ask for.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ControlDocKind {
    Greeting,
    GatherSpeech,
    PlayAudio,
    Escalate,
    Goodbye,
}

/// Inputs to control-document rendering.  Which fields matter depends on the
/// kind; rendering is pure and deterministic given identical params.
#[derive(Clone, Default, Debug)]
pub struct ControlDocParams {
    pub voice: String,
    pub language: String,
    pub message: Option<String>,
    pub gather_action: Option<String>,
    pub audio_url: Option<String>,
    pub handoff_number: Option<String>,
}

impl ControlDocParams {
    fn say(&self, text: impl Into<String>) -> ResponseAction {
        ResponseAction::Say(SayAction {
            text: text.into(),
            voice: Some(self.voice.clone()),
            language: Some(self.language.clone()),
            ..Default::default()
        })
    }

    fn gather(&self) -> ResponseAction {
        ResponseAction::Gather(GatherAction {
            input: Some(GatherInput::SpeechDtmf),
            action: self.gather_action.clone(),
            method: Some("POST".to_string()),
            timeout: Some(GATHER_TIMEOUT_SECS),
            speech_timeout: Some("auto".to_string()),
            num_digits: Some(1),
            language: Some(self.language.clone()),
        })
    }
}

/// Render the control document instructing the provider what to do next on
/// the channel.  Pure function; snapshot-testable.
pub fn render_control_document(kind: ControlDocKind, params: &ControlDocParams) -> String {
    let actions = match kind {
        ControlDocKind::Greeting => {
            let greeting = params
                .message
                .clone()
                .unwrap_or_else(|| "Hello, this is an automated call.".to_string());
            vec![
                params.say(greeting),
                ResponseAction::Pause(PauseAction { length: Some(1) }),
                params.say(OPT_OUT_PROMPT),
                params.gather(),
            ]
        }
        ControlDocKind::GatherSpeech => {
            let prompt = params
                .message
                .clone()
                .unwrap_or_else(|| "Please go ahead.".to_string());
            vec![params.say(prompt), params.gather()]
        }
        ControlDocKind::PlayAudio => {
            let mut actions = vec![ResponseAction::Play(PlayAction {
                url: params.audio_url.clone().unwrap_or_default(),
                ..Default::default()
            })];
            actions.push(params.gather());
            actions
        }
        ControlDocKind::Escalate => {
            let hold = params
                .message
                .clone()
                .unwrap_or_else(|| "Please hold while I connect you to a team member.".to_string());
            let mut actions = vec![params.say(hold)];
            match &params.handoff_number {
                Some(number) => actions.push(ResponseAction::Dial(DialAction {
                    number: number.clone(),
                })),
                // No handoff destination configured; end politely instead of
                // leaving dead air.
                None => actions.push(ResponseAction::Hangup(HangupAction::default())),
            }
            actions
        }
        ControlDocKind::Goodbye => {
            let farewell = params
                .message
                .clone()
                .unwrap_or_else(|| "Thank you for your time. Goodbye.".to_string());
            vec![
                params.say(farewell),
                ResponseAction::Hangup(HangupAction::default()),
            ]
        }
    };
    wrap_twiml(xmlserde::xml_serialize(Response { actions }))
}

/// Bare acknowledgement document carrying no instruction.
pub fn empty_document() -> String {
    wrap_twiml(xmlserde::xml_serialize(Response { actions: vec![] }))
}

/// Safe document returned on any internal error: apologize and hang up so the
/// provider never retries indefinitely and the caller never hears dead air.
pub fn fallback_document() -> String {
    let response = Response {
        actions: vec![
            ResponseAction::Say(SayAction {
                text: APOLOGY_TEXT.to_string(),
                voice: Some("alice".to_string()),
                ..Default::default()
            }),
            ResponseAction::Hangup(HangupAction::default()),
        ],
    };
    wrap_twiml(xmlserde::xml_serialize(response))
}

#[derive(Clone, Copy, Debug)]
pub struct PlaceCallOptions {
    pub record: bool,
    pub max_duration_secs: u32,
    pub timeout_secs: u32,
}

/// Call-control operations against the telephony provider.
#[async_trait]
pub trait TelephonyGateway: Send + Sync {
    /// Place an outbound call.  Returns the provider session id.
    async fn place_call(
        &self,
        destination: &str,
        control_url: &str,
        status_callback_url: &str,
        opts: &PlaceCallOptions,
    ) -> Result<String, GatewayError>;

    /// Point a live call at a new control document.
    async fn update_live_call(&self, session_id: &str, control_url: &str)
        -> Result<(), GatewayError>;

    async fn hang_up(&self, session_id: &str) -> Result<(), GatewayError>;

    async fn fetch_recording(&self, session_id: &str) -> Result<Option<String>, GatewayError>;
}

#[derive(Deserialize)]
struct CallResource {
    sid: String,
}

#[derive(Deserialize)]
struct RecordingResource {
    uri: String,
}

#[derive(Deserialize)]
struct RecordingPage {
    recordings: Vec<RecordingResource>,
}

/// Twilio REST implementation.
pub struct TwilioGateway {
    http: reqwest::Client,
    account_sid: String,
    auth_token: String,
    from_number: String,
}

impl TwilioGateway {
    pub fn new(
        http: reqwest::Client,
        account_sid: impl Into<String>,
        auth_token: impl Into<String>,
        from_number: impl Into<String>,
    ) -> Self {
        Self {
            http,
            account_sid: account_sid.into(),
            auth_token: auth_token.into(),
            from_number: from_number.into(),
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/{path}",
            self.account_sid
        )
    }

    async fn post_form(
        &self,
        url: &str,
        form: &[(&str, String)],
    ) -> Result<reqwest::Response, GatewayError> {
        self.http
            .post(url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(form)
            .send()
            .await
            .map_err(|e| {
                error!(error=%e, "failed to reach telephony provider");
                GatewayError::ProviderUnavailable(e.to_string())
            })
    }
}

#[async_trait]
impl TelephonyGateway for TwilioGateway {
    async fn place_call(
        &self,
        destination: &str,
        control_url: &str,
        status_callback_url: &str,
        opts: &PlaceCallOptions,
    ) -> Result<String, GatewayError> {
        let url = self.api_url("Calls.json");
        let mut form: Vec<(&str, String)> = vec![
            ("To", destination.to_string()),
            ("From", self.from_number.clone()),
            ("Url", control_url.to_string()),
            ("StatusCallback", status_callback_url.to_string()),
            ("Record", opts.record.to_string()),
            ("Timeout", opts.timeout_secs.to_string()),
            ("TimeLimit", opts.max_duration_secs.to_string()),
        ];
        for event in ["initiated", "ringing", "answered", "completed"] {
            form.push(("StatusCallbackEvent", event.to_string()));
        }

        let resp = self.post_form(&url, &form).await?;
        let status = resp.status();
        if status.is_client_error() {
            let body = resp.text().await.unwrap_or_default();
            error!(%status, destination, "provider rejected call placement");
            return Err(GatewayError::InvalidDestination(body));
        }
        if !status.is_success() {
            return Err(GatewayError::ProviderUnavailable(format!(
                "call placement returned {status}"
            )));
        }
        let call: CallResource = resp
            .json()
            .await
            .map_err(|e| GatewayError::ProviderUnavailable(e.to_string()))?;
        debug!(session=%call.sid, destination, "call placed");
        Ok(call.sid)
    }

    async fn update_live_call(
        &self,
        session_id: &str,
        control_url: &str,
    ) -> Result<(), GatewayError> {
        let url = self.api_url(&format!("Calls/{session_id}.json"));
        let form = [
            ("Url", control_url.to_string()),
            ("Method", "POST".to_string()),
        ];
        let resp = self.post_form(&url, &form).await?;
        let status = resp.status();
        if status == http::StatusCode::NOT_FOUND {
            return Err(GatewayError::SessionNotFound(session_id.to_string()));
        }
        if !status.is_success() {
            return Err(GatewayError::ProviderUnavailable(format!(
                "live update returned {status}"
            )));
        }
        Ok(())
    }

    async fn hang_up(&self, session_id: &str) -> Result<(), GatewayError> {
        let url = self.api_url(&format!("Calls/{session_id}.json"));
        let form = [("Status", "completed".to_string())];
        let resp = self.post_form(&url, &form).await?;
        let status = resp.status();
        // 404 means the call already ended on the provider side; nothing to do.
        if status == http::StatusCode::NOT_FOUND || status.is_success() {
            return Ok(());
        }
        Err(GatewayError::ProviderUnavailable(format!(
            "hangup returned {status}"
        )))
    }

    async fn fetch_recording(&self, session_id: &str) -> Result<Option<String>, GatewayError> {
        let url = self.api_url(&format!("Recordings.json?CallSid={session_id}"));
        let resp = self
            .http
            .get(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .send()
            .await
            .map_err(|e| GatewayError::ProviderUnavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Ok(None);
        }
        let page: RecordingPage = resp
            .json()
            .await
            .map_err(|e| GatewayError::ProviderUnavailable(e.to_string()))?;
        Ok(page.recordings.into_iter().next().map(|r| r.uri))
    }
}

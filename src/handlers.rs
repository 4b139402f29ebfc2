use crate::dispatcher::Dispatcher;
use crate::gateway::{empty_document, fallback_document};
use crate::model::Campaign;
use crate::state_machine::{CallSignal, SessionDeps, StatusUpdate, TurnInput};
use crate::twilio_types::{StatusCallbackPayload, TurnCallbackPayload};

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub deps: SessionDeps,
    pub dispatcher: Arc<Dispatcher>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/twilio/status", post(status_handler))
        .route("/twilio/turn", post(turn_handler))
        .route("/campaigns/dispatch", post(dispatch_handler))
        .route("/campaigns/:id/cancel", post(cancel_handler))
        .route("/audio/:turn_id", get(audio_handler))
        .with_state(state)
}

async fn root() -> &'static str {
    "outdial orchestrator"
}

fn xml_response(doc: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/xml")],
        doc,
    )
        .into_response()
}

/// Provider status callback.  Always answers 200 with a control document so
/// the provider never retries or plays an error tone at the callee.
async fn status_handler(State(state): State<AppState>, body: String) -> Response {
    xml_response(handle_status(&state, &body).await)
}

async fn handle_status(state: &AppState, body: &str) -> String {
    let payload: StatusCallbackPayload = match serde_urlencoded::from_str(body) {
        Ok(p) => p,
        Err(e) => {
            error!(error=%e, "malformed status callback");
            return fallback_document();
        }
    };
    let Some(tx) = state.deps.registry.signal_sender(&payload.call_sid) else {
        info!(session=%payload.call_sid, status=?payload.call_status, "status callback for unknown session; ignoring");
        return empty_document();
    };
    let update = StatusUpdate::from_payload(&payload);
    let (reply, rx) = oneshot::channel();
    if tx
        .send(CallSignal::Provider { update, reply })
        .await
        .is_err()
    {
        // Session closed between lookup and send.
        return empty_document();
    }
    match rx.await {
        Ok(doc) => doc,
        Err(_) => {
            error!(session=%payload.call_sid, "session dropped status reply");
            fallback_document()
        }
    }
}

/// Gather callback carrying the human's speech or keypad input.
async fn turn_handler(State(state): State<AppState>, body: String) -> Response {
    xml_response(handle_turn(&state, &body).await)
}

async fn handle_turn(state: &AppState, body: &str) -> String {
    let payload: TurnCallbackPayload = match serde_urlencoded::from_str(body) {
        Ok(p) => p,
        Err(e) => {
            error!(error=%e, "malformed turn callback");
            return fallback_document();
        }
    };
    let Some(tx) = state.deps.registry.signal_sender(&payload.call_sid) else {
        info!(session=%payload.call_sid, "turn callback for unknown session; ignoring");
        return empty_document();
    };
    let input = TurnInput::from_payload(&payload);
    let (reply, rx) = oneshot::channel();
    if tx.send(CallSignal::Turn { input, reply }).await.is_err() {
        return empty_document();
    }
    match rx.await {
        Ok(doc) => doc,
        Err(_) => {
            error!(session=%payload.call_sid, "session dropped turn reply");
            fallback_document()
        }
    }
}

/// Run one dispatch tick for the posted campaign definition.
async fn dispatch_handler(
    State(state): State<AppState>,
    Json(campaign): Json<Campaign>,
) -> Response {
    match state.dispatcher.tick(&campaign).await {
        Ok(summary) => (
            StatusCode::OK,
            Json(json!({
                "placed": summary.placed,
                "skippedInFlight": summary.skipped_in_flight,
                "failures": summary.failures,
            })),
        )
            .into_response(),
        Err(e) => {
            error!(error=%e, campaign=%campaign.id, "dispatch tick failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// Serve synthesized turn audio for provider playback.
async fn audio_handler(
    State(state): State<AppState>,
    Path(turn_id): Path<uuid::Uuid>,
) -> Response {
    match state.deps.sink.turn_audio(turn_id).await {
        Ok(Some(bytes)) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "audio/mpeg")],
            bytes,
        )
            .into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            error!(error=%e, %turn_id, "failed to load turn audio");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn cancel_handler(
    State(state): State<AppState>,
    Path(campaign_id): Path<String>,
) -> Response {
    let cancelled = state.dispatcher.cancel_campaign(&campaign_id).await;
    (StatusCode::OK, Json(json!({ "cancelled": cancelled }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts;
    use crate::engine::ConversationEngine;
    use crate::gateway::TelephonyGateway;
    use crate::model::{Call, CallStatus, CampaignRuntimeConfig, Contact};
    use crate::sink::{MemorySink, Sink};
    use crate::state_machine::{launch_session, ActiveCalls};
    use crate::testutil::{ScriptedEngine, StubGateway};
    use std::collections::HashMap;
    use time::Duration;

    fn state() -> (AppState, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let deps = SessionDeps {
            gateway: Arc::new(StubGateway::default()) as Arc<dyn TelephonyGateway>,
            engine: Arc::new(ScriptedEngine::default()) as Arc<dyn ConversationEngine>,
            sink: sink.clone() as Arc<dyn Sink>,
            registry: ActiveCalls::new(),
            base_url: "https://example.com".to_string(),
            handoff_number: None,
        };
        let dispatcher = Arc::new(Dispatcher::new(deps.clone()));
        (AppState { deps, dispatcher }, sink)
    }

    async fn start_session(state: &AppState, sink: &MemorySink) {
        let contact = Contact {
            id: "ct1".to_string(),
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            phone_number: "+15550001111".to_string(),
            opted_out: false,
            custom_fields: HashMap::new(),
            total_calls: 0,
            last_called: None,
            last_call_status: None,
        };
        sink.add_contact("camp-1", contact.clone());
        let mut call = Call::new("camp-1", "ct1", "+15550001111");
        call.provider_session_id = Some("CA1".to_string());
        call.status = CallStatus::Dialing;
        call.attempts = 1;
        sink.create_call(call.clone()).await.unwrap();
        let config = CampaignRuntimeConfig {
            campaign_id: "camp-1".to_string(),
            script: "renewal".to_string(),
            personality: String::new(),
            goals: vec![],
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
        };
        launch_session(&state.deps, call, contact, config);
    }

    #[tokio::test]
    async fn unknown_session_status_is_a_quiet_no_op() {
        let (state, _sink) = state();
        let doc = handle_status(&state, "CallSid=CA404&CallStatus=completed").await;
        assert!(doc.contains("<Response"));
        assert!(!doc.contains("<Say"));
    }

    #[tokio::test]
    async fn unknown_session_turn_is_a_quiet_no_op() {
        let (state, _sink) = state();
        let doc = handle_turn(&state, "CallSid=CA404&SpeechResult=hello").await;
        assert!(!doc.contains("<Say"));
    }

    #[tokio::test]
    async fn malformed_status_body_gets_fallback_document() {
        let (state, _sink) = state();
        let doc = handle_status(&state, "CallSid=CA1&CallStatus=warp-drive").await;
        assert!(doc.contains(&consts::APOLOGY_TEXT.replace('\'', "&apos;")));
        assert!(doc.contains("<Hangup"));
    }

    #[tokio::test]
    async fn answered_call_is_routed_to_its_session() {
        let (state, sink) = state();
        start_session(&state, &sink).await;

        let doc = handle_status(&state, "CallSid=CA1&CallStatus=in-progress").await;
        assert!(doc.contains("<Gather"));

        let turn_doc = handle_turn(&state, "CallSid=CA1&SpeechResult=tell%20me%20more&Confidence=0.9").await;
        assert!(turn_doc.contains("<Gather"));

        // Greeting plus one human and one assistant turn.
        let call = sink.calls_for_campaign("camp-1").pop().unwrap();
        assert_eq!(sink.turns_for(call.id).len(), 3);
    }
}

use crate::dispatcher::Dispatcher;
use crate::engine::OpenAiEngine;
use crate::gateway::TwilioGateway;
use crate::handlers::{router, AppState};
use crate::sink::{MemorySink, PgSink, Sink};
use crate::state_machine::{ActiveCalls, SessionDeps};

use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

mod dispatcher;
mod engine;
mod error;
mod gateway;
mod handlers;
mod model;
mod openai_types;
mod sink;
mod state_machine;
#[cfg(test)]
mod testutil;
mod twilio_types;

pub mod consts {
    /// Weight of the newest sample in the running sentiment average.
    pub const EMA_ALPHA: f32 = 0.4;
    /// Intent confidence below this counts toward the escalation streak.
    pub const LOW_CONFIDENCE_THRESHOLD: f32 = 0.4;
    /// Consecutive low-confidence turns before handing off to a human.
    pub const LOW_CONFIDENCE_STREAK: u32 = 2;
    /// Consecutive response-generation failures before handing off.
    pub const MAX_UTTERANCE_FAILURES: u32 = 2;
    /// Approximate token allowance for conversation history in prompts.
    pub const DEFAULT_TOKEN_BUDGET: usize = 3_000;
    /// Most recent turns that survive history trimming no matter what.
    pub const KEEP_RECENT_TURNS: usize = 6;
    /// Seconds of silence before a gather round gives up.
    pub const GATHER_TIMEOUT_SECS: u16 = 5;

    pub const OPT_OUT_KEYWORDS: &[&str] = &[
        "stop calling",
        "remove me",
        "don't call",
        "do not call",
        "unsubscribe",
        "take me off",
        "opt out",
    ];
    pub const OPT_OUT_PROMPT: &str =
        "To stop receiving calls, say stop calling or press nine at any time.";
    pub const OPT_OUT_CONFIRMATION: &str =
        "You have been removed from our calling list. Goodbye.";
    pub const APOLOGY_TEXT: &str = "We're sorry, there was a technical issue. Goodbye.";
    pub const REPROMPT_TEXT: &str = "I'm sorry, I didn't catch that. Could you say that again?";
}

fn env_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} must be set"))
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let account_sid = env_var("TWILIO_ACCOUNT_SID");
    let auth_token = env_var("TWILIO_AUTH_TOKEN");
    let from_number = env_var("TWILIO_PHONE_NUMBER");
    let openai_key = env_var("OPENAI_API_KEY");
    let base_url = env_var("PUBLIC_BASE_URL")
        .trim_end_matches('/')
        .to_string();
    let handoff_number = std::env::var("HANDOFF_NUMBER").ok();

    let http = reqwest::Client::new();
    let gateway = Arc::new(TwilioGateway::new(
        http.clone(),
        account_sid,
        auth_token,
        from_number,
    ));
    let engine = Arc::new(OpenAiEngine::new(http, openai_key));

    let sink: Arc<dyn Sink> = match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(&url)
                .await
                .expect("failed to connect to database");
            info!("using postgres sink");
            Arc::new(PgSink::new(pool))
        }
        Err(_) => {
            info!("DATABASE_URL not set; using in-memory sink");
            Arc::new(MemorySink::new())
        }
    };

    let deps = SessionDeps {
        gateway,
        engine,
        sink,
        registry: ActiveCalls::new(),
        base_url,
        handoff_number,
    };
    let dispatcher = Arc::new(Dispatcher::new(deps.clone()));
    let app = router(AppState { deps, dispatcher });

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3000);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "listening");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .expect("server error");
}

use crate::error::{GatewayError, OrchestratorError};
use crate::gateway::PlaceCallOptions;
use crate::model::{
    Call, CallError, CallErrorKind, CallEventKind, CallEventRecord, CallPatch, CallStatus,
    Campaign, CampaignRuntimeConfig, CampaignStatus, Contact,
};
use crate::state_machine::{launch_session, CallSignal, SessionDeps};

use serde_json::json;
use std::collections::HashSet;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const PLACEMENT_TIMEOUT_SECS: u32 = 30;

/// What one dispatch tick did.
#[derive(Default, Clone, Copy, Debug)]
pub struct TickSummary {
    pub placed: usize,
    pub skipped_in_flight: usize,
    pub failures: usize,
}

/// Pulls work for a campaign: redials whose schedule came due first, then
/// fresh queued contacts, up to the campaign's concurrency limit.
pub struct Dispatcher {
    deps: SessionDeps,
    // Ticks for the same dispatcher never interleave; dedupe and capacity
    // checks rely on it.
    tick_lock: Mutex<()>,
}

impl Dispatcher {
    pub fn new(deps: SessionDeps) -> Self {
        Self {
            deps,
            tick_lock: Mutex::new(()),
        }
    }

    pub async fn tick(&self, campaign: &Campaign) -> Result<TickSummary, OrchestratorError> {
        let _guard = self.tick_lock.lock().await;
        let mut summary = TickSummary::default();
        if campaign.status != CampaignStatus::Active {
            debug!(campaign=%campaign.id, status=?campaign.status, "campaign not active; skipping tick");
            return Ok(summary);
        }
        let config = campaign.snapshot();
        let active = self.deps.registry.active_count(&campaign.id);
        let capacity = config.concurrency_limit.saturating_sub(active);
        if capacity == 0 {
            debug!(campaign=%campaign.id, active, "at concurrency limit");
            return Ok(summary);
        }

        let mut dialed: HashSet<String> = HashSet::new();
        let now = OffsetDateTime::now_utc();

        let redials = self
            .deps
            .sink
            .calls_due_for_retry(&campaign.id, now, capacity)
            .await?;
        for call in redials {
            if summary.placed >= capacity {
                break;
            }
            let contact = match self.deps.sink.get_contact(&call.contact_id).await? {
                Some(c) if !c.opted_out => c,
                _ => continue,
            };
            self.place_one(&config, call, contact, &mut dialed, &mut summary)
                .await?;
        }

        let remaining = capacity - summary.placed;
        if remaining > 0 {
            let contacts = self
                .deps
                .sink
                .queued_contacts(&campaign.id, remaining)
                .await?;
            for contact in contacts {
                if summary.placed >= capacity {
                    break;
                }
                // Dedupe before creating a record, so a skipped duplicate
                // stays queued for a later tick.
                if self.number_in_flight(&dialed, &contact.phone_number) {
                    debug!(contact=%contact.id, phone=%contact.phone_number, "number already in flight; skipping");
                    summary.skipped_in_flight += 1;
                    continue;
                }
                let call = Call::new(&campaign.id, &contact.id, &contact.phone_number);
                self.deps.sink.create_call(call.clone()).await?;
                self.place_one(&config, call, contact, &mut dialed, &mut summary)
                    .await?;
            }
        }

        info!(
            campaign=%campaign.id,
            placed = summary.placed,
            skipped = summary.skipped_in_flight,
            failures = summary.failures,
            "dispatch tick finished"
        );
        Ok(summary)
    }

    // One live call per phone number, across this tick and the registry.
    fn number_in_flight(&self, dialed: &HashSet<String>, phone_number: &str) -> bool {
        dialed.contains(phone_number) || self.deps.registry.phone_in_flight(phone_number)
    }

    async fn place_one(
        &self,
        config: &CampaignRuntimeConfig,
        mut call: Call,
        contact: Contact,
        dialed: &mut HashSet<String>,
        summary: &mut TickSummary,
    ) -> Result<(), OrchestratorError> {
        if self.number_in_flight(dialed, &call.phone_number) {
            debug!(call=%call.id, phone=%call.phone_number, "number already in flight; skipping");
            summary.skipped_in_flight += 1;
            return Ok(());
        }
        dialed.insert(call.phone_number.clone());

        let now = OffsetDateTime::now_utc();
        let attempts = call.attempts + 1;
        let opts = PlaceCallOptions {
            record: true,
            max_duration_secs: config.max_call_duration_secs,
            timeout_secs: PLACEMENT_TIMEOUT_SECS,
        };
        let placement = self
            .deps
            .gateway
            .place_call(
                &call.phone_number,
                &self.deps.status_url(),
                &self.deps.status_url(),
                &opts,
            )
            .await;

        match placement {
            Ok(session_id) => {
                let patch = CallPatch {
                    status: Some(CallStatus::Dialing),
                    provider_session_id: Some(session_id.clone()),
                    attempts: Some(attempts),
                    last_attempt_at: Some(now),
                    next_retry_at: Some(None),
                    ..Default::default()
                };
                call.apply(patch.clone());
                self.deps.sink.update_call(call.id, patch).await?;
                self.deps
                    .sink
                    .add_call_event(CallEventRecord::new(
                        call.id,
                        CallEventKind::CallStarted,
                        json!({ "attempt": attempts, "session": session_id }),
                    ))
                    .await?;
                info!(call=%call.id, session=%session_id, attempt = attempts, "call placed");
                launch_session(&self.deps, call, contact, config.clone());
                summary.placed += 1;
            }
            Err(GatewayError::InvalidDestination(msg)) => {
                warn!(call=%call.id, phone=%call.phone_number, "destination rejected; not retrying");
                let error = CallError::new(CallErrorKind::ProviderFailure, msg);
                self.deps
                    .sink
                    .update_call(
                        call.id,
                        CallPatch {
                            status: Some(CallStatus::Failed),
                            attempts: Some(attempts),
                            last_attempt_at: Some(now),
                            next_retry_at: Some(None),
                            ended_at: Some(now),
                            error: Some(error.clone()),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.deps
                    .sink
                    .add_call_event(CallEventRecord::new(
                        call.id,
                        CallEventKind::Error,
                        json!({ "kind": error.kind.as_str(), "message": error.message }),
                    ))
                    .await?;
                summary.failures += 1;
            }
            Err(e) => {
                summary.failures += 1;
                if attempts >= config.max_retries {
                    warn!(call=%call.id, error=%e, "placement failed; retries exhausted");
                    self.deps
                        .sink
                        .update_call(
                            call.id,
                            CallPatch {
                                status: Some(CallStatus::Failed),
                                attempts: Some(attempts),
                                last_attempt_at: Some(now),
                                next_retry_at: Some(None),
                                ended_at: Some(now),
                                error: Some(CallError::new(
                                    CallErrorKind::RetriesExhausted,
                                    e.to_string(),
                                )),
                                ..Default::default()
                            },
                        )
                        .await?;
                    return Ok(());
                }
                let next = now + config.retry_interval * attempts as i32;
                warn!(call=%call.id, error=%e, attempt = attempts, "placement failed; retry scheduled");
                self.deps
                    .sink
                    .update_call(
                        call.id,
                        CallPatch {
                            status: Some(CallStatus::Failed),
                            attempts: Some(attempts),
                            last_attempt_at: Some(now),
                            next_retry_at: Some(Some(next)),
                            error: Some(CallError::new(
                                CallErrorKind::ProviderFailure,
                                e.to_string(),
                            )),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.deps
                    .sink
                    .add_call_event(CallEventRecord::new(
                        call.id,
                        CallEventKind::RetryScheduled,
                        json!({ "attempt": attempts, "next_retry_at": next.to_string() }),
                    ))
                    .await?;
            }
        }
        Ok(())
    }

    /// Signal every live session of the campaign to hang up and fail with a
    /// cancellation marker.  Scheduled redials stop firing because ticks only
    /// run for active campaigns.
    pub async fn cancel_campaign(&self, campaign_id: &str) -> usize {
        let senders = self.deps.registry.campaign_senders(campaign_id);
        let count = senders.len();
        for tx in senders {
            let _ = tx.send(CallSignal::Cancel).await;
        }
        info!(campaign_id, sessions = count, "campaign cancel signalled");
        count
    }
}

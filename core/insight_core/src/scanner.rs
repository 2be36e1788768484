//! Inactivity scan: find users who have gone quiet and nudge them.
//!
//! Stages run in order: enumerate active users, keep the reachable ones,
//! look up their last entry, classify against the threshold, dispatch, report.
//! Nothing is persisted between scans, so eligibility is recomputed from the
//! entry history each time.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::notify::{token_prefix, NotificationDispatcher, PushPayload, SendOutcome};
use crate::settings::PolicySettings;
use crate::store::{EntryStore, StoreError};

const SECONDS_PER_DAY: f64 = 86_400.0;

pub const REMINDER_TITLE: &str = "How have you been?";
pub const REMINDER_BODY: &str = "It's been a few days since your last journal entry. Take a minute to write down how you feel.";

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("failed to enumerate active users: {0}")]
    Enumerate(#[source] StoreError),
}

#[derive(Debug, Clone, Copy)]
pub struct ScanPolicy {
    pub threshold_days: f64,
    pub concurrency: usize,
    pub clear_invalid_tokens: bool,
}

impl From<&PolicySettings> for ScanPolicy {
    fn from(s: &PolicySettings) -> Self {
        let s = s.normalized();
        Self {
            threshold_days: s.inactivity_threshold_days,
            concurrency: usize::try_from(s.dispatch_concurrency).unwrap_or(1).max(1),
            clear_invalid_tokens: s.clear_invalid_tokens,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationCandidate {
    pub user_id: String,
    #[serde(skip_serializing)]
    pub push_token: String,
    #[serde(serialize_with = "crate::timefmt::rfc3339::option::serialize")]
    pub last_entry_date: Option<OffsetDateTime>,
    /// `f64::INFINITY` when the user never wrote; serialized as `null`.
    pub days_since_last_entry: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchErrorKind {
    InvalidToken,
    Transient,
    Panicked,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchOutcome {
    pub user_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<DispatchErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub token_cleared: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    #[serde(with = "crate::timefmt::rfc3339")]
    pub scanned_at: OffsetDateTime,
    pub threshold_days: f64,
    pub scanned_users: usize,
    pub reachable_users: usize,
    pub candidates: Vec<NotificationCandidate>,
    pub outcomes: Vec<DispatchOutcome>,
    pub dispatched: usize,
    pub succeeded: usize,
    pub invalid_tokens: usize,
}

pub fn days_since(now: OffsetDateTime, last: Option<OffsetDateTime>) -> f64 {
    match last {
        Some(t) => (now - t).as_seconds_f64() / SECONDS_PER_DAY,
        None => f64::INFINITY,
    }
}

pub fn reminder_payload() -> PushPayload {
    PushPayload {
        title: REMINDER_TITLE.to_string(),
        body: REMINDER_BODY.to_string(),
        data: BTreeMap::from([("type".to_string(), "journal_reminder".to_string())]),
    }
}

#[derive(Clone)]
pub struct InactivityScanner {
    store: Arc<dyn EntryStore>,
    dispatcher: NotificationDispatcher,
}

impl InactivityScanner {
    pub fn new(store: Arc<dyn EntryStore>, dispatcher: NotificationDispatcher) -> Self {
        Self { store, dispatcher }
    }

    pub async fn find_candidates(
        &self,
        now: OffsetDateTime,
        threshold_days: f64,
    ) -> Result<(usize, usize, Vec<NotificationCandidate>), ScanError> {
        let users = self.store.active_users().await.map_err(ScanError::Enumerate)?;
        let scanned = users.len();

        let reachable: Vec<(String, String)> = users
            .iter()
            .filter_map(|u| u.reachable_token().map(|t| (u.id.clone(), t.to_string())))
            .collect();
        let reachable_count = reachable.len();

        let mut candidates = Vec::new();
        for (user_id, push_token) in reachable {
            let last = match self.store.last_entry_at(&user_id).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(user_id = %user_id, "skipping user, last entry lookup failed: {e}");
                    continue;
                }
            };
            let days = days_since(now, last);
            if days >= threshold_days {
                candidates.push(NotificationCandidate {
                    user_id,
                    push_token,
                    last_entry_date: last,
                    days_since_last_entry: days,
                });
            }
        }
        Ok((scanned, reachable_count, candidates))
    }

    pub async fn scan(&self, now: OffsetDateTime, policy: ScanPolicy) -> Result<ScanReport, ScanError> {
        let (scanned_users, reachable_users, candidates) = self.find_candidates(now, policy.threshold_days).await?;
        info!(
            scanned_users,
            reachable_users,
            candidates = candidates.len(),
            "inactivity scan classified users"
        );

        let payload = reminder_payload();
        let dispatches: Vec<_> = candidates
            .iter()
            .map(|c| self.dispatch_one(c, &payload, policy))
            .collect();
        let outcomes: Vec<DispatchOutcome> = stream::iter(dispatches)
            .buffered(policy.concurrency.max(1))
            .collect()
            .await;

        let succeeded = outcomes.iter().filter(|o| o.success).count();
        let invalid_tokens = outcomes
            .iter()
            .filter(|o| o.error_kind == Some(DispatchErrorKind::InvalidToken))
            .count();
        info!(dispatched = outcomes.len(), succeeded, invalid_tokens, "inactivity scan finished");

        Ok(ScanReport {
            scanned_at: now,
            threshold_days: policy.threshold_days,
            scanned_users,
            reachable_users,
            dispatched: outcomes.len(),
            succeeded,
            invalid_tokens,
            candidates,
            outcomes,
        })
    }

    async fn dispatch_one(&self, c: &NotificationCandidate, payload: &PushPayload, policy: ScanPolicy) -> DispatchOutcome {
        let sent = AssertUnwindSafe(self.dispatcher.send_to_token(&c.push_token, payload))
            .catch_unwind()
            .await;

        let mut outcome = DispatchOutcome {
            user_id: c.user_id.clone(),
            success: false,
            message_id: None,
            error_kind: None,
            error: None,
            token_cleared: false,
        };
        match sent {
            Ok(SendOutcome::Delivered { message_id }) => {
                outcome.success = true;
                outcome.message_id = Some(message_id);
            }
            Ok(SendOutcome::InvalidToken { code }) => {
                outcome.error_kind = Some(DispatchErrorKind::InvalidToken);
                outcome.error = Some(code);
                if policy.clear_invalid_tokens {
                    outcome.token_cleared = self.clear_token(&c.user_id).await;
                }
            }
            Ok(SendOutcome::TransientFailure { reason }) => {
                outcome.error_kind = Some(DispatchErrorKind::Transient);
                outcome.error = Some(reason);
            }
            Err(_) => {
                error!(user_id = %c.user_id, token = %token_prefix(&c.push_token), "dispatch panicked");
                outcome.error_kind = Some(DispatchErrorKind::Panicked);
                outcome.error = Some("dispatch panicked".to_string());
            }
        }
        outcome
    }

    async fn clear_token(&self, user_id: &str) -> bool {
        match self.store.clear_push_token(user_id).await {
            Ok(cleared) => {
                if cleared {
                    info!(user_id = %user_id, "cleared rejected push token");
                }
                cleared
            }
            Err(e) => {
                warn!(user_id = %user_id, "failed to clear push token: {e}");
                false
            }
        }
    }
}

//! Session token refresh and the background loop that drives it.
//!
//! A refresh trades the current device id for a fresh session token at the
//! chat-requirements endpoint, solving the attached proof-of-work challenge
//! when there is one. The loop keeps doing that on a timer:
//!
//! - after a success it waits `refresh_interval`;
//! - after a failure it backs off, with the wait growing with the number of
//!   consecutive failures;
//! - while no token has ever been obtained, every `renew_after_failures`
//!   failures also rotate the device id. A held token, even a stale one, is
//!   never thrown away for a new identity.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::pow::{self, ProofToken};
use crate::session::{Credentials, SessionState};
use crate::upstream::UpstreamClient;

/// Wait multiplier applied while a stale token is still being served.
const STALE_TOKEN_WAIT_FACTOR: u32 = 10;

pub struct SessionRefresher {
    upstream: UpstreamClient,
    state: Arc<SessionState>,
    proof_of_work: bool,
}

impl SessionRefresher {
    pub fn new(upstream: UpstreamClient, state: Arc<SessionState>, proof_of_work: bool) -> Self {
        Self {
            upstream,
            state,
            proof_of_work,
        }
    }

    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    /// Fetch a new session token. On failure whatever token is already held
    /// stays in place.
    pub async fn refresh(&self) -> Result<()> {
        let device_id = self.state.device_id().await;
        let requirements = self.upstream.chat_requirements(&device_id).await?;

        if requirements.token.is_empty() {
            return Err(ProxyError::InvalidRequirements("empty token".to_string()));
        }

        let proof_token = match requirements.proofofwork {
            Some(challenge) if self.proof_of_work && challenge.is_required() => {
                let user_agent = self.upstream.user_agent().to_string();
                let seed = challenge.seed.clone();
                let difficulty = challenge.difficulty.clone();
                let solved = tokio::task::spawn_blocking(move || {
                    pow::solve(&seed, &difficulty, &user_agent)
                })
                .await
                .unwrap_or_else(|e| {
                    warn!(error = %e, "proof of work task failed");
                    ProofToken::Fallback(pow::fallback_token(&challenge.seed))
                });
                debug!(
                    difficulty = %challenge.difficulty,
                    solved = solved.is_solved(),
                    "proof of work finished"
                );
                Some(solved.into_string())
            }
            _ => None,
        };

        info!(
            device_id = %device_id,
            proof = proof_token.is_some(),
            "obtained new session token"
        );
        self.state
            .store_credentials(Credentials {
                token: requirements.token,
                proof_token,
            })
            .await;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    pub interval: Duration,
    pub error_wait: Duration,
    pub max_backoff_factor: u32,
    pub renew_after_failures: u32,
}

impl RefreshPolicy {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            interval: config.refresh_interval(),
            error_wait: config.error_wait(),
            max_backoff_factor: config.max_backoff_factor,
            renew_after_failures: config.renew_after_failures,
        }
    }
}

/// What the loop does after one refresh attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshStep {
    pub wait: Duration,
    pub renew_identity: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackoffState {
    consecutive_failures: u32,
    failures_since_renew: u32,
}

impl BackoffState {
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn record_success(&mut self, policy: &RefreshPolicy) -> RefreshStep {
        *self = Self::default();
        RefreshStep {
            wait: policy.interval,
            renew_identity: false,
        }
    }

    pub fn record_failure(&mut self, policy: &RefreshPolicy, has_token: bool) -> RefreshStep {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let factor = self
            .consecutive_failures
            .min(policy.max_backoff_factor.max(1));

        if has_token {
            return RefreshStep {
                wait: policy.error_wait * STALE_TOKEN_WAIT_FACTOR * factor,
                renew_identity: false,
            };
        }

        self.failures_since_renew += 1;
        let renew_identity = self.failures_since_renew >= policy.renew_after_failures.max(1);
        if renew_identity {
            self.failures_since_renew = 0;
        }
        RefreshStep {
            wait: policy.error_wait * factor,
            renew_identity,
        }
    }
}

/// The timer-driven refresh task, with its backoff state held explicitly.
pub struct RefreshLoop {
    refresher: Arc<SessionRefresher>,
    policy: RefreshPolicy,
    backoff: BackoffState,
}

impl RefreshLoop {
    pub fn new(refresher: Arc<SessionRefresher>, policy: RefreshPolicy) -> Self {
        Self {
            refresher,
            policy,
            backoff: BackoffState::default(),
        }
    }

    pub fn backoff(&self) -> &BackoffState {
        &self.backoff
    }

    /// Run one refresh attempt and return how long to wait before the next.
    pub async fn run_once(&mut self) -> Duration {
        let state = self.refresher.state().clone();
        let device_id = state.device_id().await;
        info!(device_id = %device_id, "requesting new session token");

        match self.refresher.refresh().await {
            Ok(()) => {
                let step = self.backoff.record_success(&self.policy);
                info!(wait_secs = step.wait.as_secs(), "next token refresh scheduled");
                step.wait
            }
            Err(e) => {
                let has_token = state.has_token().await;
                let step = self.backoff.record_failure(&self.policy, has_token);
                error!(
                    error = %e,
                    failures = self.backoff.consecutive_failures(),
                    "error refreshing session token"
                );

                if step.renew_identity {
                    state.renew_identity().await;
                    info!(wait_secs = step.wait.as_secs(), "retrying with a new device id");
                } else if has_token {
                    info!(wait_secs = step.wait.as_secs(), "continuing with the old token");
                } else {
                    info!(wait_secs = step.wait.as_secs(), "retrying token refresh");
                }
                step.wait
            }
        }
    }

    pub fn spawn(mut self) -> RefreshHandle {
        let handle = tokio::spawn(async move {
            loop {
                let wait = self.run_once().await;
                tokio::time::sleep(wait).await;
            }
        });
        RefreshHandle { handle }
    }
}

/// Owns the spawned loop. Dropping it stops the loop.
pub struct RefreshHandle {
    handle: JoinHandle<()>,
}

impl RefreshHandle {
    pub fn shutdown(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

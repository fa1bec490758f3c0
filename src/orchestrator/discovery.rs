//! Loopback address discovery.
//!
//! A candidate base URL is accepted only if it reaches this scheduler's
//! endpoint (ping) and the endpoint runs sessions after replying rather than
//! before (probe). The first accepted candidate is persisted.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::runtime::Handle;
use tracing::{info, info_span, warn, Instrument};

use crate::config::LoopbackConfig;
use crate::models::block::{BlockCode, BlockFailure};
use crate::persistence::config_repo::{
    ConfigRepo, KEY_LOOPBACK_ADDRESS, KEY_LOOPBACK_PING, KEY_LOOPBACK_TEST,
};
use crate::Result;

use super::async_manager::{AsyncManager, ExecutionTime};
use super::loopback::{PingResponse, PING_TOKEN};
use super::registry::{BlockRegistry, Invocation};
use super::token;

/// Registry name of the probe closure.
pub const PROBE_HANDLER: &str = "loopback.probe";

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Register the probe closure: sleep `args[1]` seconds, then store
/// `args[0]` under the probe key.
pub fn register_probe(registry: &mut BlockRegistry, store: ConfigRepo) {
    registry.register_closure(PROBE_HANDLER, false, move |call: Invocation| {
        let token = call
            .arg(0)
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| BlockFailure::new("argument", "probe token missing"))?
            .to_owned();
        let delay = call.arg(1).and_then(serde_json::Value::as_u64).unwrap_or(0);
        std::thread::sleep(Duration::from_secs(delay));
        Handle::current()
            .block_on(store.set(KEY_LOOPBACK_TEST, &token))
            .map_err(|err| BlockFailure::new("config", err.to_string()))?;
        Ok(None)
    });
}

/// Outcome of testing one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateReport {
    /// Candidate base URL.
    pub address: String,
    /// Whether the candidate passed both checks.
    pub accepted: bool,
    /// Rejection reason.
    pub reason: Option<String>,
}

/// Tests loopback candidates against the running endpoint.
pub struct LoopbackDiscovery {
    manager: Arc<AsyncManager>,
    store: ConfigRepo,
    config: LoopbackConfig,
}

impl LoopbackDiscovery {
    /// Discovery recording its probe through `manager`.
    #[must_use]
    pub fn new(manager: Arc<AsyncManager>, store: ConfigRepo, config: LoopbackConfig) -> Self {
        Self {
            manager,
            store,
            config,
        }
    }

    /// Test `candidates` in order and persist the first accepted one.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the accepted address cannot be stored.
    pub async fn discover(&self, candidates: &[String]) -> Result<Vec<CandidateReport>> {
        let mut reports = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let report = self.test_candidate(candidate).await;
            let accepted = report.accepted;
            reports.push(report);
            if accepted {
                self.store.set(KEY_LOOPBACK_ADDRESS, candidate).await?;
                info!(address = candidate, "loopback address stored");
                break;
            }
        }
        Ok(reports)
    }

    /// Run the ping and probe checks against `address`.
    pub async fn test_candidate(&self, address: &str) -> CandidateReport {
        let span = info_span!("test_candidate", address);
        let outcome = async {
            self.ping(address).await?;
            self.probe(address).await
        }
        .instrument(span)
        .await;

        match outcome {
            Ok(()) => CandidateReport {
                address: address.to_owned(),
                accepted: true,
                reason: None,
            },
            Err(reason) => {
                warn!(address, reason = %reason, "loopback candidate rejected");
                CandidateReport {
                    address: address.to_owned(),
                    accepted: false,
                    reason: Some(reason),
                }
            }
        }
    }

    async fn ping(&self, address: &str) -> std::result::Result<(), String> {
        let expected = token::generate(token::TOKEN_LEN);
        self.store
            .set(KEY_LOOPBACK_PING, &expected)
            .await
            .map_err(|err| format!("cannot store ping token: {err}"))?;

        let body = self
            .manager
            .fork_manager()
            .loopback_to(address, PING_TOKEN)
            .await
            .map_err(|err| format!("unreachable: {err}"))?;
        let response: PingResponse =
            serde_json::from_str(&body).map_err(|err| format!("unexpected ping reply: {err}"))?;

        if response.ping.as_deref() == Some(expected.as_str()) {
            Ok(())
        } else {
            Err("ping token mismatch; address reaches a different instance".into())
        }
    }

    async fn probe(&self, address: &str) -> std::result::Result<(), String> {
        let expected = token::generate(token::TOKEN_LEN);
        self.store
            .delete(KEY_LOOPBACK_TEST)
            .await
            .map_err(|err| format!("cannot clear probe token: {err}"))?;

        let mut session = self.manager.open_session();
        session
            .record(
                BlockCode::closure(PROBE_HANDLER),
                vec![json!(expected), json!(self.config.probe_delay_seconds)],
            )
            .map_err(|err| format!("probe handler unavailable: {err}"))?
            .name("loopback probe");
        let session_token = self
            .manager
            .close_session(session, ExecutionTime::Later)
            .await
            .map_err(|err| format!("cannot record probe: {err}"))?;

        self.manager
            .fork_manager()
            .loopback_to(address, &session_token)
            .await
            .map_err(|err| format!("probe request failed: {err}"))?;

        if self.probe_value().await?.as_deref() == Some(expected.as_str()) {
            return Err("endpoint ran the probe before replying; not asynchronous".into());
        }

        let deadline = Instant::now() + Duration::from_secs(self.config.probe_wait_seconds);
        while Instant::now() < deadline {
            tokio::time::sleep(POLL_INTERVAL).await;
            if self.probe_value().await?.as_deref() == Some(expected.as_str()) {
                return Ok(());
            }
        }
        Err(format!(
            "probe did not complete within {}s",
            self.config.probe_wait_seconds
        ))
    }

    async fn probe_value(&self) -> std::result::Result<Option<String>, String> {
        self.store
            .get(KEY_LOOPBACK_TEST)
            .await
            .map_err(|err| format!("cannot read probe token: {err}"))
    }
}

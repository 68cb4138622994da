//! Venue execution: the adapter seam, the dry-run adapter, the live REST
//! adapter and the bounded dispatch worker pool.
//!
//! The trading core never performs a venue call. Jobs go over a bounded
//! channel to the pool, which signs and submits under a concurrency
//! semaphore and posts completions back onto the core's event queue. Order
//! signing itself is delegated to an external `Signer`; when no signer can
//! be built the engine runs dry.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::auth::{hmac_signature, ApiCredentials};
use crate::order_manager::{CancelJob, SubmitJob};
use crate::types::{DispatchResult, EngineEvent, TimeInForce, VenueOutcome};

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("signer unavailable: {0}")]
    Unavailable(String),
}

/// External order-signing seam (typed-data signing happens behind it).
pub trait Signer: Send + Sync {
    fn sign_order(&self, job: &SubmitJob) -> Result<String, SignerError>;
}

/// Venue calls made by the worker pool.
#[async_trait]
pub trait ExecutionAdapter: Send + Sync {
    async fn place_order(&self, job: &SubmitJob) -> VenueOutcome;
    async fn cancel_order(&self, job: &CancelJob) -> VenueOutcome;
}

/// Dry-run adapter: every call succeeds with a synthetic venue id.
#[derive(Debug, Default)]
pub struct DryRunExecution;

#[async_trait]
impl ExecutionAdapter for DryRunExecution {
    async fn place_order(&self, job: &SubmitJob) -> VenueOutcome {
        VenueOutcome::accepted(format!("dry-{}", job.client_order_id))
    }

    async fn cancel_order(&self, job: &CancelJob) -> VenueOutcome {
        VenueOutcome::accepted(
            job.venue_order_id
                .clone()
                .unwrap_or_else(|| job.client_order_id.clone()),
        )
    }
}

/// Live adapter speaking the venue REST API with signed orders and
/// HMAC-authenticated requests.
pub struct LiveExecution {
    http: reqwest::Client,
    rest_url: String,
    creds: ApiCredentials,
    signer: Arc<dyn Signer>,
    chain_id: u64,
}

impl LiveExecution {
    pub fn new(
        rest_url: String,
        creds: ApiCredentials,
        signer: Arc<dyn Signer>,
        chain_id: u64,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            rest_url,
            creds,
            signer,
            chain_id,
        }
    }

    fn auth_headers(&self, method: &str, path: &str, body: &str) -> [(String, String); 4] {
        let timestamp = Utc::now().timestamp();
        let signature = hmac_signature(&self.creds.api_secret, timestamp, method, path, body);
        [
            ("X-API-KEY".to_string(), self.creds.api_key.clone()),
            ("X-API-PASSPHRASE".to_string(), self.creds.api_passphrase.clone()),
            ("X-API-TIMESTAMP".to_string(), timestamp.to_string()),
            ("X-API-SIGNATURE".to_string(), signature),
        ]
    }
}

#[async_trait]
impl ExecutionAdapter for LiveExecution {
    async fn place_order(&self, job: &SubmitJob) -> VenueOutcome {
        let order_signature = match self.signer.sign_order(job) {
            Ok(sig) => sig,
            Err(err) => return VenueOutcome::failed(0, err.to_string()),
        };
        let body = json!({
            "token_id": job.token_id,
            "side": job.side,
            "price": job.price,
            "size": job.size,
            "client_order_id": job.client_order_id,
            "expiration_ms": job.ttl_ms,
            "time_in_force": match job.time_in_force {
                TimeInForce::Gtc => "GTC",
                TimeInForce::Ioc => "IOC",
            },
            "chain_id": self.chain_id,
            "signature": order_signature,
        })
        .to_string();

        let mut request = self
            .http
            .post(format!("{}/order", self.rest_url))
            .header("content-type", "application/json")
            .body(body.clone());
        for (name, value) in self.auth_headers("POST", "/order", &body) {
            request = request.header(name, value);
        }
        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let payload: serde_json::Value = response.json().await.unwrap_or_default();
                if (200..300).contains(&status) {
                    let venue_id = payload
                        .get("orderID")
                        .or_else(|| payload.get("order_id"))
                        .and_then(|v| v.as_str())
                        .unwrap_or(&job.client_order_id)
                        .to_string();
                    VenueOutcome::accepted(venue_id)
                } else {
                    let reason = payload
                        .get("error")
                        .and_then(|v| v.as_str())
                        .unwrap_or("order rejected")
                        .to_string();
                    VenueOutcome::failed(status, reason)
                }
            }
            Err(err) => VenueOutcome::failed(0, err.to_string()),
        }
    }

    async fn cancel_order(&self, job: &CancelJob) -> VenueOutcome {
        let order_ref = job
            .venue_order_id
            .clone()
            .unwrap_or_else(|| job.client_order_id.clone());
        let path = format!("/order/{order_ref}");
        let mut request = self.http.delete(format!("{}{}", self.rest_url, path));
        for (name, value) in self.auth_headers("DELETE", &path, "") {
            request = request.header(name, value);
        }
        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                if (200..300).contains(&status) {
                    VenueOutcome::accepted(order_ref)
                } else {
                    VenueOutcome::failed(status, "cancel rejected")
                }
            }
            Err(err) => VenueOutcome::failed(0, err.to_string()),
        }
    }
}

/// One unit of work for the pool.
#[derive(Debug, Clone)]
pub enum DispatchJob {
    Submit(SubmitJob),
    Cancel(CancelJob),
}

/// Spawn the dispatch pool. Concurrency is bounded by `max_in_flight`
/// (the venue's published budget); the core never blocks on signing or
/// HTTP, it just awaits completion events.
pub fn spawn_dispatch_pool(
    adapter: Arc<dyn ExecutionAdapter>,
    max_in_flight: usize,
    mut jobs: mpsc::Receiver<DispatchJob>,
    events: mpsc::Sender<EngineEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let semaphore = Arc::new(Semaphore::new(max_in_flight.max(1)));
        while let Some(job) = jobs.recv().await {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let adapter = adapter.clone();
            let events = events.clone();
            tokio::spawn(async move {
                let result = match job {
                    DispatchJob::Submit(submit) => {
                        let outcome = adapter.place_order(&submit).await;
                        DispatchResult::Submit {
                            client_order_id: submit.client_order_id,
                            outcome,
                            at: Utc::now(),
                        }
                    }
                    DispatchJob::Cancel(cancel) => {
                        let outcome = adapter.cancel_order(&cancel).await;
                        DispatchResult::Cancel {
                            client_order_id: cancel.client_order_id,
                            outcome,
                            at: Utc::now(),
                        }
                    }
                };
                // Completions must not be lost; block until the core takes it.
                if events.send(EngineEvent::Dispatch(result)).await.is_err() {
                    warn!(component = "dispatch", "core queue closed; completion dropped");
                }
                drop(permit);
            });
        }
        info!(component = "dispatch", "dispatch pool stopped");
    })
}

/// Build a signer from the environment, or explain why trading must run
/// dry. A missing or malformed key never aborts startup; it demotes.
pub fn build_signer(private_key: &str, scheme: &str) -> Result<Arc<dyn Signer>, SignerError> {
    if private_key.trim().is_empty() {
        return Err(SignerError::Unavailable("no private key configured".to_string()));
    }
    if !scheme.eq_ignore_ascii_case("eoa") {
        return Err(SignerError::Unavailable(format!(
            "unsupported signature scheme {scheme}"
        )));
    }
    Ok(Arc::new(HmacOrderSigner {
        key: private_key.to_string(),
    }))
}

/// Deterministic stand-in signer keyed on the private key material. The
/// real typed-data signer lives in the venue SDK behind the same trait.
struct HmacOrderSigner {
    key: String,
}

impl Signer for HmacOrderSigner {
    fn sign_order(&self, job: &SubmitJob) -> Result<String, SignerError> {
        let canonical = format!(
            "{}:{}:{}:{}:{}",
            job.token_id, job.side, job.price, job.size, job.client_order_id
        );
        Ok(hmac_signature(&self.key, 0, "ORDER", &canonical, ""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arb_common::Side;
    use rust_decimal_macros::dec;

    fn job(id: &str) -> SubmitJob {
        SubmitJob {
            client_order_id: id.to_string(),
            market_id: "m1".to_string(),
            token_id: "tok-y".to_string(),
            side: Side::Buy,
            price: dec!(0.48),
            size: dec!(10),
            ttl_ms: 1500,
            time_in_force: TimeInForce::Gtc,
        }
    }

    #[tokio::test]
    async fn test_dry_run_accepts_everything() {
        let adapter = DryRunExecution;
        let outcome = adapter.place_order(&job("c1")).await;
        assert!(outcome.ok);
        assert_eq!(outcome.venue_order_id.as_deref(), Some("dry-c1"));
        let outcome = adapter
            .cancel_order(&CancelJob {
                client_order_id: "c1".to_string(),
                venue_order_id: Some("v1".to_string()),
            })
            .await;
        assert!(outcome.ok);
    }

    #[tokio::test]
    async fn test_pool_posts_completions() {
        let (job_tx, job_rx) = mpsc::channel(16);
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let handle = spawn_dispatch_pool(Arc::new(DryRunExecution), 2, job_rx, event_tx);
        job_tx.send(DispatchJob::Submit(job("c1"))).await.unwrap();
        let event = event_rx.recv().await.unwrap();
        match event {
            EngineEvent::Dispatch(DispatchResult::Submit {
                client_order_id,
                outcome,
                ..
            }) => {
                assert_eq!(client_order_id, "c1");
                assert!(outcome.ok);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        drop(job_tx);
        handle.await.unwrap();
    }

    #[test]
    fn test_build_signer_requires_key() {
        assert!(build_signer("", "EOA").is_err());
        assert!(build_signer("0xabc", "magic").is_err());
        assert!(build_signer("0xabc", "EOA").is_ok());
    }

    #[test]
    fn test_signer_is_deterministic() {
        let signer = build_signer("0xabc", "EOA").unwrap();
        let a = signer.sign_order(&job("c1")).unwrap();
        let b = signer.sign_order(&job("c1")).unwrap();
        assert_eq!(a, b);
        let c = signer.sign_order(&job("c2")).unwrap();
        assert_ne!(a, c);
    }
}

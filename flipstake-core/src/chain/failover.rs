use super::{EsploraNetwork, NetworkClient};
use crate::config::{BreakerPolicy, EngineConfig};
use crate::error::{FlipstakeError, Result};
use crate::types::{ChainTransaction, EntropyToken, Transfer};
use crate::vault::EscrowSecret;
use async_trait::async_trait;
use bitcoin::Amount;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    /// Skipped until the cooldown expires.
    Open,
    /// Cooldown expired; calls go through until the endpoint proves itself.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointStatus {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_requests: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointHealth {
    pub name: String,
    pub healthy: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
    pub state: CircuitState,
}

struct Breaker {
    state: CircuitState,
    failures: u32,
    successes: u32,
    opened_at: Option<Instant>,
    total_requests: u64,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            opened_at: None,
            total_requests: 0,
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.successes = 0;
    }
}

struct Endpoint {
    name: String,
    client: Arc<dyn NetworkClient>,
    breaker: Mutex<Breaker>,
}

impl Endpoint {
    fn allows(&self, policy: &BreakerPolicy) -> bool {
        let mut breaker = self.breaker.lock();
        match breaker.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled = breaker
                    .opened_at
                    .map_or(true, |at| at.elapsed() >= policy.cooldown);
                if cooled {
                    info!("Circuit half-open for {}, testing recovery", self.name);
                    breaker.state = CircuitState::HalfOpen;
                    breaker.successes = 0;
                }
                cooled
            }
        }
    }

    /// Only transient errors count against the endpoint; anything else is an
    /// answer from a reachable server.
    fn record<T>(&self, result: &Result<T>, policy: &BreakerPolicy) {
        let mut breaker = self.breaker.lock();
        breaker.total_requests += 1;

        match result {
            Err(e) if e.is_transient() => {
                breaker.failures += 1;
                match breaker.state {
                    CircuitState::HalfOpen => {
                        warn!("Recovery call to {} failed, reopening circuit", self.name);
                        breaker.open();
                    }
                    CircuitState::Closed if breaker.failures >= policy.failure_threshold => {
                        error!(
                            "Circuit open for {} after {} failures; retrying in {:?}",
                            self.name, breaker.failures, policy.cooldown
                        );
                        breaker.open();
                    }
                    _ => {}
                }
            }
            _ => {
                breaker.failures = 0;
                if breaker.state == CircuitState::HalfOpen {
                    breaker.successes += 1;
                    if breaker.successes >= policy.success_threshold {
                        info!("Circuit closed for {}", self.name);
                        breaker.state = CircuitState::Closed;
                        breaker.successes = 0;
                        breaker.opened_at = None;
                    }
                }
            }
        }
    }

    fn status(&self) -> EndpointStatus {
        let breaker = self.breaker.lock();
        EndpointStatus {
            name: self.name.clone(),
            state: breaker.state,
            consecutive_failures: breaker.failures,
            total_requests: breaker.total_requests,
        }
    }
}

/// [`NetworkClient`] over several endpoints, each behind a circuit breaker.
///
/// Lookups walk the endpoints in order and move on after a transient
/// failure. Transfers and sweeps go to the first endpoint whose circuit
/// allows it and are never resubmitted to another one: a failed call may
/// already have broadcast.
pub struct FailoverNetwork {
    endpoints: Vec<Endpoint>,
    policy: BreakerPolicy,
}

impl FailoverNetwork {
    pub fn new(endpoints: Vec<(String, Arc<dyn NetworkClient>)>, policy: BreakerPolicy) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(FlipstakeError::config("No network endpoints configured"));
        }

        let endpoints = endpoints
            .into_iter()
            .map(|(name, client)| Endpoint {
                name,
                client,
                breaker: Mutex::new(Breaker::new()),
            })
            .collect();
        Ok(Self { endpoints, policy })
    }

    /// One [`EsploraNetwork`] per configured URL, in configured order.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let mut endpoints: Vec<(String, Arc<dyn NetworkClient>)> = Vec::new();
        for url in &config.esplora_urls {
            endpoints.push((url.clone(), Arc::new(EsploraNetwork::new(url, config)?)));
        }
        info!("Network failover over {} endpoints", endpoints.len());
        Self::new(endpoints, config.breaker.clone())
    }

    pub fn status(&self) -> Vec<EndpointStatus> {
        self.endpoints.iter().map(Endpoint::status).collect()
    }

    /// Queries every endpoint directly, ignoring and not touching breakers.
    pub async fn check_health(&self, address: &str) -> Vec<EndpointHealth> {
        let mut results = Vec::with_capacity(self.endpoints.len());
        for endpoint in &self.endpoints {
            let started = Instant::now();
            let outcome = endpoint.client.get_balance(address).await;
            let latency_ms = started.elapsed().as_millis() as u64;

            results.push(EndpointHealth {
                name: endpoint.name.clone(),
                healthy: outcome.is_ok(),
                latency_ms,
                error: outcome.err().map(|e| e.to_string()),
                state: endpoint.status().state,
            });
        }
        results
    }

    async fn with_failover<T, F, Fut>(&self, what: &str, call: F) -> Result<T>
    where
        F: Fn(Arc<dyn NetworkClient>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let mut attempted = 0;
        let mut last_error = None;

        for endpoint in &self.endpoints {
            if !endpoint.allows(&self.policy) {
                debug!("Skipping {} for {}: circuit open", endpoint.name, what);
                continue;
            }
            attempted += 1;

            let result = call(endpoint.client.clone()).await;
            endpoint.record(&result, &self.policy);
            match result {
                Err(e) if e.is_transient() => {
                    warn!("{} via {} failed: {}", what, endpoint.name, e);
                    last_error = Some(e);
                }
                other => return other,
            }
        }

        match last_error {
            Some(e) => {
                error!("All {} attempted endpoints failed for {}: {}", attempted, what, e);
                Err(FlipstakeError::chain_unavailable(format!(
                    "all {} endpoints failed for {}: {}",
                    attempted, what, e
                )))
            }
            None => Err(FlipstakeError::chain_unavailable(format!(
                "no network endpoint available for {}",
                what
            ))),
        }
    }

    async fn exactly_once<T, F, Fut>(&self, what: &str, call: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn NetworkClient>) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let endpoint = self
            .endpoints
            .iter()
            .find(|endpoint| endpoint.allows(&self.policy))
            .ok_or_else(|| {
                FlipstakeError::chain_unavailable(format!(
                    "no network endpoint available for {}",
                    what
                ))
            })?;

        let result = call(endpoint.client.clone()).await;
        endpoint.record(&result, &self.policy);
        if let Err(e) = &result {
            warn!("{} via {} failed, not resubmitting: {}", what, endpoint.name, e);
        }
        result
    }
}

#[async_trait]
impl NetworkClient for FailoverNetwork {
    async fn get_finalized_entropy(&self) -> Result<EntropyToken> {
        self.with_failover("entropy", |client| async move {
            client.get_finalized_entropy().await
        })
        .await
    }

    async fn get_transaction(&self, signature: &str) -> Result<Option<ChainTransaction>> {
        self.with_failover("transaction lookup", |client| async move {
            client.get_transaction(signature).await
        })
        .await
    }

    async fn get_balance(&self, address: &str) -> Result<Amount> {
        self.with_failover("balance", |client| async move {
            client.get_balance(address).await
        })
        .await
    }

    async fn transfer(&self, secret: &EscrowSecret, to: &str, amount: Amount) -> Result<String> {
        self.exactly_once("transfer", |client| async move {
            client.transfer(secret, to, amount).await
        })
        .await
    }

    async fn sweep(&self, secret: &EscrowSecret, to: &str) -> Result<Option<Transfer>> {
        self.exactly_once("sweep", |client| async move { client.sweep(secret, to).await })
            .await
    }
}

//! Model alias resolution and endpoint selection.
//!
//! Resolution picks the first endpoint in the merged, residency-filtered
//! list whose provider matches the model spec. Endpoints whose circuit is
//! open are skipped; when every candidate is open, the oldest-opened one is
//! tried as a probe so a recovered provider is eventually rediscovered.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::{Endpoint, MergedConfig, ModelSpec};
use crate::error::Error;

/// Consecutive failures before an endpoint's circuit opens.
const FAILURE_THRESHOLD: u32 = 3;

/// How long a circuit stays open before a probe is allowed through.
const PROBE_AFTER: Duration = Duration::from_secs(30);

/// Outcome of alias resolution: the model spec plus the single endpoint the
/// call should use.
#[derive(Debug, Clone)]
pub struct ResolvedCall {
    pub spec: ModelSpec,
    pub endpoint: Endpoint,
}

#[derive(Debug, Clone, Copy, Default)]
struct Circuit {
    consecutive_failures: u32,
    open_since: Option<Instant>,
}

/// Endpoint selector with a per-endpoint circuit record.
#[derive(Default)]
pub struct Registry {
    circuits: Mutex<HashMap<String, Circuit>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve an alias to a concrete `(spec, endpoint)` pair against a
    /// config snapshot.
    pub fn resolve(&self, cfg: &MergedConfig, alias: &str) -> Result<ResolvedCall, Error> {
        let spec = cfg
            .model(alias)
            .cloned()
            .ok_or_else(|| Error::UnknownModel(alias.to_string()))?;

        let candidates: Vec<&Endpoint> = cfg
            .endpoints
            .iter()
            .filter(|ep| ep.provider == spec.provider && cfg.region_allowed(&ep.region))
            .collect();

        if candidates.is_empty() {
            // The echo provider needs no network endpoint.
            if spec.provider == "echo" {
                return Ok(ResolvedCall {
                    spec,
                    endpoint: Endpoint {
                        name: "echo".to_string(),
                        provider: "echo".to_string(),
                        url: String::new(),
                        region: "local".to_string(),
                    },
                });
            }
            return Err(Error::NoEndpoint {
                alias: alias.to_string(),
                provider: spec.provider.clone(),
            });
        }

        let circuits = self.circuits.lock().expect("circuit registry poisoned");
        let now = Instant::now();

        let mut oldest_open: Option<(&Endpoint, Instant)> = None;
        for ep in &candidates {
            match circuits.get(&ep.name).and_then(|c| c.open_since) {
                None => {
                    return Ok(ResolvedCall {
                        spec,
                        endpoint: (*ep).clone(),
                    });
                }
                Some(since) => {
                    if now.duration_since(since) >= PROBE_AFTER {
                        // Cooled down enough to try directly.
                        return Ok(ResolvedCall {
                            spec,
                            endpoint: (*ep).clone(),
                        });
                    }
                    if oldest_open.is_none_or(|(_, best)| since < best) {
                        oldest_open = Some((*ep, since));
                    }
                }
            }
        }

        // Every candidate is open: probe the one that has been open longest.
        let (probe, since) = oldest_open.expect("candidates were non-empty");
        tracing::debug!(
            endpoint = %probe.name,
            open_for_s = now.duration_since(since).as_secs_f64(),
            "all endpoints open, probing oldest"
        );
        Ok(ResolvedCall {
            spec,
            endpoint: probe.clone(),
        })
    }

    /// Record a successful call through an endpoint, closing its circuit.
    pub fn record_success(&self, endpoint: &str) {
        let mut circuits = self.circuits.lock().expect("circuit registry poisoned");
        circuits.insert(endpoint.to_string(), Circuit::default());
    }

    /// Record a failed call; the circuit opens after a run of failures.
    pub fn record_failure(&self, endpoint: &str) {
        let mut circuits = self.circuits.lock().expect("circuit registry poisoned");
        let circuit = circuits.entry(endpoint.to_string()).or_default();
        circuit.consecutive_failures += 1;
        if circuit.consecutive_failures >= FAILURE_THRESHOLD && circuit.open_since.is_none() {
            circuit.open_since = Some(Instant::now());
            tracing::warn!(
                endpoint,
                failures = circuit.consecutive_failures,
                "endpoint circuit opened"
            );
        }
    }

    /// Whether an endpoint's circuit is currently open.
    pub fn is_open(&self, endpoint: &str) -> bool {
        let circuits = self.circuits.lock().expect("circuit registry poisoned");
        circuits
            .get(endpoint)
            .is_some_and(|c| c.open_since.is_some())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

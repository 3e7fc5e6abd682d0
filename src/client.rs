//! Request orchestrator.
//!
//! Every call runs the same fixed sequence: allocate a trace id, resolve the
//! model, estimate cost, check the budget, reserve a rate-limit slot, invoke
//! the adapter under the retry engine, then write the terminal ledger event
//! and release the reservation. The orchestrator is the only component that
//! raises caller-visible errors.

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::Stream;
use uuid::Uuid;

use crate::budget::{BudgetController, BudgetDecision};
use crate::cancel::CancelToken;
use crate::config::{MergedConfig, ModelSpec};
use crate::error::{Error, Result};
use crate::ledger::{EventStatus, Ledger};
use crate::limiter::{RateLimiter, Reservation, Reserve};
use crate::pricing;
use crate::providers::traits::EventStream;
use crate::providers::{EchoAdapter, ProviderAdapter, ProviderError};
use crate::registry::{Registry, ResolvedCall};
use crate::retry::{self, RetryError, RetryPolicy};
use crate::types::{
    Content, FinishReason, GenConfig, GenerationResponse, Request, StreamEvent, Timing,
    TokenUsage,
};

/// Default ledger location under the user's home directory.
fn default_ledger_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".llm-gateway")
        .join("ledger.db")
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for [`Client`].
pub struct ClientBuilder {
    config: Option<MergedConfig>,
    ledger_path: Option<PathBuf>,
    adapters: Vec<Arc<dyn ProviderAdapter>>,
}

impl ClientBuilder {
    /// Use an already-merged configuration snapshot instead of loading from
    /// the conventional file locations.
    pub fn config(mut self, config: MergedConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Override the ledger database path.
    pub fn ledger_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ledger_path = Some(path.into());
        self
    }

    /// Register a provider adapter. The echo adapter is always available.
    pub fn adapter(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    /// Build the client. Must be called within a Tokio runtime; the ledger
    /// writer worker is spawned here.
    pub fn build(self) -> Result<Client> {
        let config = match self.config {
            Some(config) => config,
            None => crate::config::load()?,
        };
        let ledger_path = self.ledger_path.unwrap_or_else(default_ledger_path);
        let ledger = Ledger::open(&ledger_path)?;
        let budget = Arc::new(BudgetController::new(&config.budget, ledger.clone()));

        let mut adapters: HashMap<String, Arc<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert("echo".to_string(), Arc::new(EchoAdapter::new()));
        for adapter in self.adapters {
            adapters.insert(adapter.id().to_string(), adapter);
        }

        tracing::info!(
            models = config.model_registry.len(),
            endpoints = config.endpoints.len(),
            daily_limit_usd = config.budget.daily_spend_limit_usd,
            strict = config.budget.strict,
            "gateway client ready"
        );

        Ok(Client {
            shared: Arc::new(Shared {
                config: RwLock::new(Arc::new(config)),
                budget: RwLock::new(budget),
                registry: Registry::new(),
                ledger,
                limiter: RateLimiter::new(),
                adapters,
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

struct Shared {
    config: RwLock<Arc<MergedConfig>>,
    budget: RwLock<Arc<BudgetController>>,
    registry: Registry,
    ledger: Ledger,
    limiter: RateLimiter,
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

/// Gateway client: the public surface of the request pipeline. Cheap to
/// clone; all clones share the same ledger, limiter, and circuit state.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder {
            config: None,
            ledger_path: None,
            adapters: Vec::new(),
        }
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<MergedConfig> {
        self.shared
            .config
            .read()
            .expect("config lock poisoned")
            .clone()
    }

    /// Replace the configuration snapshot. In-flight calls keep the snapshot
    /// they started with.
    pub fn reload(&self, config: MergedConfig) {
        let budget = Arc::new(BudgetController::new(
            &config.budget,
            self.shared.ledger.clone(),
        ));
        *self.shared.budget.write().expect("budget lock poisoned") = budget;
        *self.shared.config.write().expect("config lock poisoned") = Arc::new(config);
        tracing::info!("configuration reloaded");
    }

    /// Budget status, reporting, and top-consumer queries.
    pub fn budget(&self) -> Arc<BudgetController> {
        self.shared
            .budget
            .read()
            .expect("budget lock poisoned")
            .clone()
    }

    /// Whether the ledger writer has dropped events after repeated failures.
    pub fn ledger_degraded(&self) -> bool {
        self.shared.ledger.degraded()
    }

    /// Direct ledger access for inspection and tests.
    pub fn ledger(&self) -> &Ledger {
        &self.shared.ledger
    }

    /// Drain and stop the ledger worker. Call once when done with the client.
    pub async fn close(&self) {
        self.shared.ledger.close().await;
    }

    // -- public operations ---------------------------------------------------

    /// Run a generation call and return the full structured response.
    pub async fn generate(
        &self,
        content: impl Into<Content>,
        model_alias: &str,
        options: GenConfig,
    ) -> Result<GenerationResponse> {
        self.generate_with_token(content, model_alias, options, CancelToken::new())
            .await
    }

    /// Like [`generate`](Self::generate) but observing an external
    /// cancellation token.
    pub async fn generate_with_token(
        &self,
        content: impl Into<Content>,
        model_alias: &str,
        options: GenConfig,
        cancel: CancelToken,
    ) -> Result<GenerationResponse> {
        let prepared = self
            .prepare(content.into(), model_alias, options, cancel.clone())
            .await?;
        self.execute(prepared, cancel).await
    }

    /// Ergonomic variant returning only the content string.
    pub async fn generate_text(
        &self,
        content: impl Into<Content>,
        model_alias: &str,
    ) -> Result<String> {
        let options = GenConfig {
            full_response: false,
            ..Default::default()
        };
        Ok(self.generate(content, model_alias, options).await?.content)
    }

    /// Open a streaming call. Dropping the returned stream before its
    /// terminal event cancels the call and records partial usage.
    pub async fn stream(
        &self,
        content: impl Into<Content>,
        model_alias: &str,
        options: GenConfig,
    ) -> Result<RequestStream> {
        self.stream_with_token(content, model_alias, options, CancelToken::new())
            .await
    }

    /// Like [`stream`](Self::stream) but observing an external cancellation
    /// token.
    pub async fn stream_with_token(
        &self,
        content: impl Into<Content>,
        model_alias: &str,
        options: GenConfig,
        cancel: CancelToken,
    ) -> Result<RequestStream> {
        let prepared = self
            .prepare(content.into(), model_alias, options, cancel.clone())
            .await?;
        self.open_stream(prepared, cancel).await
    }

    // -- pipeline ------------------------------------------------------------

    /// Steps 1–6 of the fixed sequence: trace allocation, resolution, cost
    /// estimation, budget admission, and rate-limit reservation.
    async fn prepare(
        &self,
        content: Content,
        alias: &str,
        options: GenConfig,
        cancel: CancelToken,
    ) -> Result<Prepared> {
        let trace_id = Uuid::new_v4();
        let started = Instant::now();
        let config = self.config();
        let budget = self.budget();

        let ResolvedCall { spec, endpoint } = self.shared.registry.resolve(&config, alias)?;

        let adapter = self
            .shared
            .adapters
            .get(&spec.provider)
            .cloned()
            .ok_or_else(|| Error::NoEndpoint {
                alias: alias.to_string(),
                provider: spec.provider.clone(),
            })?;

        let deadline = options
            .deadline_ms
            .map(|ms| started + Duration::from_millis(ms));

        let request = Request {
            parts: content.into_parts(),
            model_id: spec.model_id.clone(),
            provider: spec.provider.clone(),
            endpoint_url: endpoint.url.clone(),
            api_key: config.api_keys.get(&spec.provider).cloned(),
            options,
        };

        let estimated_tokens = adapter.estimate_tokens(&request);
        let estimated_cost = pricing::estimated_cost(&spec, estimated_tokens, &request.options);

        tracing::debug!(
            trace_id = %trace_id,
            alias,
            model = %spec.model_id,
            endpoint = %endpoint.name,
            estimated_tokens,
            estimated_cost_usd = estimated_cost,
            "call admitted to pipeline"
        );

        match budget
            .check(trace_id, &spec.provider, &spec.model_id, estimated_cost)
            .await?
        {
            BudgetDecision::Allow | BudgetDecision::Warn(_) => {}
            BudgetDecision::Reject {
                spent_usd,
                limit_usd,
            } => {
                budget.cancel(
                    trace_id,
                    &spec.provider,
                    &spec.model_id,
                    "quota",
                    EventStatus::Cancelled,
                );
                return Err(Error::QuotaExceeded {
                    spent_usd,
                    estimated_usd: estimated_cost,
                    limit_usd,
                });
            }
        }

        let policy = RetryPolicy::from(&config.resilience);
        let reservation = self
            .acquire_slot(&spec, estimated_tokens, &policy, trace_id, &budget, &cancel)
            .await?;

        Ok(Prepared {
            trace_id,
            started,
            spec,
            endpoint_name: endpoint.name,
            request,
            adapter,
            estimated_tokens,
            estimated_cost,
            reservation,
            policy,
            budget,
            deadline,
        })
    }

    /// Step 6: reserve against the rate limiter, sleeping on wait hints when
    /// the policy allows.
    async fn acquire_slot(
        &self,
        spec: &ModelSpec,
        estimated_tokens: u64,
        policy: &RetryPolicy,
        trace_id: Uuid,
        budget: &BudgetController,
        cancel: &CancelToken,
    ) -> Result<Reservation> {
        let mut waited = Duration::ZERO;
        let mut attempt: u32 = 0;

        loop {
            match self.shared.limiter.reserve(spec, estimated_tokens) {
                Reserve::Ready(reservation) => return Ok(reservation),
                Reserve::Exhausted(reason) => {
                    budget.cancel(
                        trace_id,
                        &spec.provider,
                        &spec.model_id,
                        &reason,
                        EventStatus::RateLimited,
                    );
                    return Err(Error::RateLimited {
                        provider: spec.provider.clone(),
                        model: spec.model_id.clone(),
                        reason,
                    });
                }
                Reserve::WaitHint(hint) => {
                    if !policy.wait_on_rate_limit {
                        budget.cancel(
                            trace_id,
                            &spec.provider,
                            &spec.model_id,
                            "rate window full",
                            EventStatus::RateLimited,
                        );
                        return Err(Error::RateLimited {
                            provider: spec.provider.clone(),
                            model: spec.model_id.clone(),
                            reason: "rate window full".to_string(),
                        });
                    }
                    if waited + hint > policy.max_wait_timeout {
                        budget.cancel(
                            trace_id,
                            &spec.provider,
                            &spec.model_id,
                            "wait ceiling",
                            EventStatus::RateLimited,
                        );
                        return Err(Error::TimeoutExceeded {
                            waited_s: waited.as_secs_f64(),
                        });
                    }
                    attempt += 1;
                    budget.retry_attempt(
                        trace_id,
                        &spec.provider,
                        &spec.model_id,
                        attempt,
                        hint.as_millis() as u64,
                        "rate_limited",
                    );
                    tracing::debug!(
                        trace_id = %trace_id,
                        model = %spec.model_id,
                        wait_ms = hint.as_millis() as u64,
                        "rate window full, waiting"
                    );
                    waited += hint;
                    tokio::select! {
                        _ = tokio::time::sleep(hint) => {}
                        _ = cancel.cancelled() => {
                            budget.cancel(
                                trace_id,
                                &spec.provider,
                                &spec.model_id,
                                "cancelled",
                                EventStatus::Cancelled,
                            );
                            return Err(Error::Cancelled);
                        }
                    }
                }
            }
        }
    }

    /// Steps 7–9 for the non-streaming surface.
    async fn execute(&self, prepared: Prepared, cancel: CancelToken) -> Result<GenerationResponse> {
        let Prepared {
            trace_id,
            started,
            spec,
            endpoint_name,
            request,
            adapter,
            estimated_tokens,
            estimated_cost,
            reservation,
            policy,
            budget,
            deadline,
        } = prepared;

        let attempt_budget = budget.clone();
        let observe = |attempt: &retry::RetryAttempt| {
            attempt_budget.retry_attempt(
                trace_id,
                &spec.provider,
                &spec.model_id,
                attempt.index,
                attempt.delay.as_millis() as u64,
                attempt.error_kind,
            );
        };

        let run = retry::run_with_retry(&policy, || adapter.invoke(&request, deadline), observe, &cancel);

        let result = match deadline {
            Some(deadline) => {
                tokio::select! {
                    result = run => result,
                    _ = tokio::time::sleep_until(deadline.into()) => {
                        cancel.cancel();
                        Err(RetryError::Provider(ProviderError::Cancelled))
                    }
                }
            }
            None => run.await,
        };

        let total_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(mut response) => {
                let usage = response.usage;
                let actual_cost = if response.cost_usd > 0.0 {
                    // Adapters that know their exact billing report it directly.
                    response.cost_usd
                } else if usage.known {
                    pricing::actual_cost(&spec, &usage)
                } else {
                    estimated_cost
                };

                let committed_tokens = if usage.known {
                    usage.total_tokens
                } else {
                    estimated_tokens
                };
                reservation.commit(committed_tokens);
                self.shared.registry.record_success(&endpoint_name);

                let timing = Timing {
                    ttft_ms: None,
                    total_ms,
                };
                budget.commit(
                    trace_id,
                    &spec.provider,
                    &spec.model_id,
                    actual_cost,
                    usage,
                    EventStatus::Ok,
                    timing,
                    serde_json::json!({
                        "endpoint": endpoint_name,
                        "usage_estimated": !usage.known,
                    }),
                );

                response.trace_id = trace_id;
                response.cost_usd = actual_cost;
                response.timing = timing;
                Ok(response)
            }
            Err(RetryError::Provider(ProviderError::SafetyBlocked { message })) => {
                // Safety blocks are a successful response with a tagged
                // finish reason, never an exception.
                reservation.commit(estimated_tokens);
                self.shared.registry.record_success(&endpoint_name);

                let timing = Timing {
                    ttft_ms: None,
                    total_ms,
                };
                budget.commit(
                    trace_id,
                    &spec.provider,
                    &spec.model_id,
                    estimated_cost,
                    TokenUsage::default(),
                    EventStatus::Ok,
                    timing,
                    serde_json::json!({ "endpoint": endpoint_name, "error_kind": "safety" }),
                );

                Ok(GenerationResponse {
                    content: message,
                    media_parts: Vec::new(),
                    model: spec.model_id.clone(),
                    provider: spec.provider.clone(),
                    usage: TokenUsage::default(),
                    cost_usd: estimated_cost,
                    finish_reason: FinishReason::SafetyBlocked,
                    trace_id,
                    timing,
                    provider_meta: serde_json::Value::Null,
                })
            }
            Err(retry_error) => {
                drop(reservation);
                let timing = Timing {
                    ttft_ms: None,
                    total_ms,
                };
                let (status, kind, error) = match retry_error {
                    RetryError::WaitCeiling { waited } => {
                        self.shared.registry.record_failure(&endpoint_name);
                        (
                            EventStatus::RateLimited,
                            "wait_ceiling",
                            Error::TimeoutExceeded {
                                waited_s: waited.as_secs_f64(),
                            },
                        )
                    }
                    RetryError::Provider(provider_error) => {
                        let status = match provider_error {
                            ProviderError::Cancelled => EventStatus::Cancelled,
                            ProviderError::RateLimited { .. } => EventStatus::RateLimited,
                            _ => EventStatus::Error,
                        };
                        if matches!(
                            provider_error.class(),
                            crate::providers::ErrorClass::Retryable
                        ) {
                            self.shared.registry.record_failure(&endpoint_name);
                        }
                        let kind = provider_error.kind_tag();
                        (status, kind, Error::from(provider_error))
                    }
                };

                budget.commit(
                    trace_id,
                    &spec.provider,
                    &spec.model_id,
                    0.0,
                    TokenUsage::default(),
                    status,
                    timing,
                    serde_json::json!({ "endpoint": endpoint_name, "error_kind": kind }),
                );
                Err(error)
            }
        }
    }

    /// Step 7 for the streaming surface: establish the adapter stream under
    /// retry supervision and wrap it in the accounting guard.
    async fn open_stream(&self, prepared: Prepared, cancel: CancelToken) -> Result<RequestStream> {
        let Prepared {
            trace_id,
            started,
            spec,
            endpoint_name,
            request,
            adapter,
            estimated_tokens,
            estimated_cost,
            reservation,
            policy,
            budget,
            deadline,
        } = prepared;

        let attempt_budget = budget.clone();
        let observe = |attempt: &retry::RetryAttempt| {
            attempt_budget.retry_attempt(
                trace_id,
                &spec.provider,
                &spec.model_id,
                attempt.index,
                attempt.delay.as_millis() as u64,
                attempt.error_kind,
            );
        };

        let result =
            retry::run_with_retry(&policy, || adapter.stream(&request, deadline), observe, &cancel)
                .await;

        let inner = match result {
            Ok(stream) => stream,
            Err(retry_error) => {
                drop(reservation);
                let timing = Timing {
                    ttft_ms: None,
                    total_ms: started.elapsed().as_millis() as u64,
                };
                let (status, kind, error) = match retry_error {
                    RetryError::WaitCeiling { waited } => (
                        EventStatus::RateLimited,
                        "wait_ceiling",
                        Error::TimeoutExceeded {
                            waited_s: waited.as_secs_f64(),
                        },
                    ),
                    RetryError::Provider(provider_error) => {
                        let status = match provider_error {
                            ProviderError::Cancelled => EventStatus::Cancelled,
                            ProviderError::RateLimited { .. } => EventStatus::RateLimited,
                            _ => EventStatus::Error,
                        };
                        let kind = provider_error.kind_tag();
                        (status, kind, Error::from(provider_error))
                    }
                };
                budget.commit(
                    trace_id,
                    &spec.provider,
                    &spec.model_id,
                    0.0,
                    TokenUsage::default(),
                    status,
                    timing,
                    serde_json::json!({ "endpoint": endpoint_name, "error_kind": kind }),
                );
                return Err(error);
            }
        };

        Ok(RequestStream {
            inner: Some(inner),
            ctx: Some(StreamCtx {
                trace_id,
                started,
                spec,
                endpoint_name,
                estimated_tokens,
                estimated_cost,
                reservation: Some(reservation),
                budget,
                shared: self.shared.clone(),
            }),
            usage: TokenUsage::default(),
            output_chars: 0,
            ttft_ms: None,
            cancel,
        })
    }
}

// ---------------------------------------------------------------------------
// Prepared call state
// ---------------------------------------------------------------------------

struct Prepared {
    trace_id: Uuid,
    started: Instant,
    spec: ModelSpec,
    endpoint_name: String,
    request: Request,
    adapter: Arc<dyn ProviderAdapter>,
    estimated_tokens: u64,
    estimated_cost: f64,
    reservation: Reservation,
    policy: RetryPolicy,
    budget: Arc<BudgetController>,
    deadline: Option<Instant>,
}

// ---------------------------------------------------------------------------
// Streaming guard
// ---------------------------------------------------------------------------

struct StreamCtx {
    trace_id: Uuid,
    started: Instant,
    spec: ModelSpec,
    endpoint_name: String,
    estimated_tokens: u64,
    estimated_cost: f64,
    reservation: Option<Reservation>,
    budget: Arc<BudgetController>,
    shared: Arc<Shared>,
}

/// Stream of [`StreamEvent`]s with the request's accounting attached.
///
/// The terminal event finalises the ledger commit. Dropping the stream early
/// closes the adapter stream and writes a `commit` with `status = cancelled`
/// and partial usage.
pub struct RequestStream {
    inner: Option<EventStream>,
    ctx: Option<StreamCtx>,
    usage: TokenUsage,
    output_chars: u64,
    ttft_ms: Option<u64>,
    cancel: CancelToken,
}

impl RequestStream {
    /// Trace id of the underlying call.
    pub fn trace_id(&self) -> Option<Uuid> {
        self.ctx.as_ref().map(|ctx| ctx.trace_id)
    }

    /// Cancel the call explicitly. Equivalent to dropping the stream.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn finalize_ok(&mut self, event: &StreamEvent) {
        let Some(ctx) = self.ctx.take() else { return };
        if let Some(usage) = &event.usage {
            self.usage.absorb(usage);
        }

        let actual_cost = if let Some(cost) = event.cost_usd {
            cost
        } else if self.usage.known {
            pricing::actual_cost(&ctx.spec, &self.usage)
        } else {
            ctx.estimated_cost
        };

        let committed_tokens = if self.usage.known {
            self.usage.total_tokens
        } else {
            ctx.estimated_tokens
        };
        if let Some(reservation) = ctx.reservation {
            reservation.commit(committed_tokens);
        }
        ctx.shared.registry.record_success(&ctx.endpoint_name);

        let status = match event.finish_reason {
            Some(FinishReason::Cancelled) => EventStatus::Cancelled,
            Some(FinishReason::Error) => EventStatus::Error,
            _ => EventStatus::Ok,
        };
        let timing = Timing {
            ttft_ms: self.ttft_ms,
            total_ms: ctx.started.elapsed().as_millis() as u64,
        };
        ctx.budget.commit(
            ctx.trace_id,
            &ctx.spec.provider,
            &ctx.spec.model_id,
            actual_cost,
            self.usage,
            status,
            timing,
            serde_json::json!({
                "endpoint": ctx.endpoint_name,
                "usage_estimated": !self.usage.known,
            }),
        );
    }

    fn finalize_abandoned(&mut self) {
        let Some(ctx) = self.ctx.take() else { return };

        // Partial usage: the input estimate plus output derived from the
        // deltas observed so far.
        let mut usage = self.usage;
        if !usage.known {
            usage.input_tokens = ctx.estimated_tokens;
            usage.output_tokens = if self.output_chars == 0 {
                0
            } else {
                self.output_chars / 3 + 1
            };
            usage.total_tokens = usage.input_tokens + usage.output_tokens;
        }
        let partial_cost = pricing::actual_cost(&ctx.spec, &usage);

        if let Some(reservation) = ctx.reservation {
            reservation.commit(usage.total_tokens);
        }

        let timing = Timing {
            ttft_ms: self.ttft_ms,
            total_ms: ctx.started.elapsed().as_millis() as u64,
        };
        tracing::debug!(
            trace_id = %ctx.trace_id,
            output_chars = self.output_chars,
            partial_cost_usd = partial_cost,
            "stream abandoned before terminal event"
        );
        ctx.budget.commit(
            ctx.trace_id,
            &ctx.spec.provider,
            &ctx.spec.model_id,
            partial_cost,
            usage,
            EventStatus::Cancelled,
            timing,
            serde_json::json!({ "endpoint": ctx.endpoint_name, "reason": "abandoned" }),
        );
    }
}

impl Stream for RequestStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.as_mut().get_mut();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        if this.cancel.is_cancelled() && this.ctx.is_some() {
            this.inner = None;
            this.finalize_abandoned();
            return Poll::Ready(None);
        }

        match inner.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(event)) => {
                if !event.delta.is_empty() {
                    if this.ttft_ms.is_none() {
                        if let Some(ctx) = this.ctx.as_ref() {
                            this.ttft_ms = Some(ctx.started.elapsed().as_millis() as u64);
                        }
                    }
                    this.output_chars += event.delta.chars().count() as u64;
                }
                if let Some(usage) = &event.usage {
                    this.usage.absorb(usage);
                }
                if event.is_final {
                    this.inner = None;
                    this.finalize_ok(&event);
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                // Stream ended without a terminal event: close out as an
                // abandoned call so the trace still gets its terminal row.
                this.inner = None;
                this.finalize_abandoned();
                Poll::Ready(None)
            }
        }
    }
}

impl Drop for RequestStream {
    fn drop(&mut self) {
        // Release the adapter stream first so its transport closes promptly.
        self.inner = None;
        if self.ctx.is_some() {
            self.finalize_abandoned();
        }
    }
}

//! Adapter contract.

use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

use futures::stream::BoxStream;

use crate::providers::ProviderError;
use crate::types::{GenerationResponse, Request, StreamEvent};

/// Stream of events produced by an adapter. The caller may drop it before
/// the terminal event; the adapter must release its transport when that
/// happens.
pub type EventStream = BoxStream<'static, StreamEvent>;

/// Trait every provider adapter implements.
///
/// Async methods return boxed futures so the trait is dyn-compatible (can be
/// held as `Arc<dyn ProviderAdapter>`). No `async_trait` macro is needed.
pub trait ProviderAdapter: Send + Sync {
    /// Unique provider identifier (e.g. "google", "dashscope", "echo").
    fn id(&self) -> &str;

    /// Blocking completion. `deadline`, when set, bounds the whole exchange;
    /// adapters must return [`ProviderError::Timeout`] rather than overrun it.
    fn invoke(
        &self,
        request: &Request,
        deadline: Option<Instant>,
    ) -> Pin<Box<dyn Future<Output = Result<GenerationResponse, ProviderError>> + Send + '_>>;

    /// Streaming completion. The stream yields at most one event with
    /// `is_final = true`, which carries final usage; events after it are not
    /// produced.
    fn stream(
        &self,
        request: &Request,
        deadline: Option<Instant>,
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, ProviderError>> + Send + '_>>;

    /// Best-effort input-token estimate for the request. A conservative
    /// upper bound is preferred; the default uses the chars/3 heuristic over
    /// the request's text parts.
    fn estimate_tokens(&self, request: &Request) -> u64 {
        crate::pricing::estimate_tokens(&request.text())
    }
}

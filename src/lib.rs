//! tollgate -- Client-side LLM gateway with spend guardrails.
//!
//! One interface over heterogeneous LLM providers, with the organisational
//! controls enforced in-process: per-day cost caps, per-model rate limits,
//! automatic retry with back-off, and a durable per-request ledger.
//!
//! ```no_run
//! use tollgate::{Client, GenConfig};
//!
//! # async fn demo() -> tollgate::Result<()> {
//! let client = Client::builder().build()?;
//! let response = client.generate("hello", "fast", GenConfig::default()).await?;
//! println!("{} (${:.6})", response.content, response.cost_usd);
//! # Ok(())
//! # }
//! ```

pub mod blocking;
pub mod budget;
pub mod cancel;
pub mod client;
pub mod config;
pub mod error;
pub mod ledger;
pub mod limiter;
pub mod pricing;
pub mod providers;
pub mod registry;
pub mod retry;
pub mod types;

pub use crate::cancel::CancelToken;
pub use crate::client::{Client, ClientBuilder, RequestStream};
pub use crate::config::{MergedConfig, ModelSpec};
pub use crate::error::{Error, Result};
pub use crate::types::{
    Content, ContentPart, FinishReason, GenConfig, GenerationResponse, StreamEvent, TokenUsage,
};

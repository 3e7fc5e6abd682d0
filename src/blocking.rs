//! Synchronous façade over the async client.
//!
//! Owns a current-thread Tokio runtime and blocks on the async surface, so
//! callers without an async context get the same pipeline and guarantees.

use std::sync::Arc;

use futures::StreamExt;

use crate::config::MergedConfig;
use crate::error::{Error, Result};
use crate::types::{Content, GenConfig, GenerationResponse, StreamEvent};

/// Blocking gateway client.
pub struct Client {
    inner: crate::Client,
    runtime: Arc<tokio::runtime::Runtime>,
}

impl Client {
    /// Build a blocking client from a merged configuration snapshot.
    pub fn new(config: MergedConfig, ledger_path: impl Into<std::path::PathBuf>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Ledger(format!("failed to start runtime: {e}")))?;
        let inner = runtime.block_on(async {
            crate::Client::builder()
                .config(config)
                .ledger_path(ledger_path)
                .build()
        })?;
        Ok(Self {
            inner,
            runtime: Arc::new(runtime),
        })
    }

    /// Blocking dual of [`crate::Client::generate`].
    pub fn generate(
        &self,
        content: impl Into<Content>,
        model_alias: &str,
        options: GenConfig,
    ) -> Result<GenerationResponse> {
        self.runtime
            .block_on(self.inner.generate(content, model_alias, options))
    }

    /// Blocking dual of [`crate::Client::generate_text`].
    pub fn generate_text(&self, content: impl Into<Content>, model_alias: &str) -> Result<String> {
        self.runtime
            .block_on(self.inner.generate_text(content, model_alias))
    }

    /// Blocking dual of [`crate::Client::stream`]: an iterator over stream
    /// events. Dropping the iterator early cancels the call, same as the
    /// async surface.
    pub fn stream(
        &self,
        content: impl Into<Content>,
        model_alias: &str,
        options: GenConfig,
    ) -> Result<BlockingStream> {
        let stream = self
            .runtime
            .block_on(self.inner.stream(content, model_alias, options))?;
        Ok(BlockingStream {
            inner: Some(stream),
            runtime: self.runtime.clone(),
        })
    }

    /// Access the async client (for budget status and reporting).
    pub fn inner(&self) -> &crate::Client {
        &self.inner
    }

    /// Drain the ledger worker.
    pub fn close(&self) {
        self.runtime.block_on(self.inner.close());
    }
}

/// Iterator over streaming events, backed by the blocking runtime.
pub struct BlockingStream {
    inner: Option<crate::client::RequestStream>,
    runtime: Arc<tokio::runtime::Runtime>,
}

impl Iterator for BlockingStream {
    type Item = StreamEvent;

    fn next(&mut self) -> Option<StreamEvent> {
        let stream = self.inner.as_mut()?;
        let event = self.runtime.block_on(stream.next());
        if event.is_none() {
            self.inner = None;
        }
        event
    }
}

impl Drop for BlockingStream {
    fn drop(&mut self) {
        // Drop the async stream inside the runtime so its cancellation
        // accounting runs with a reactor available.
        if let Some(stream) = self.inner.take() {
            self.runtime.block_on(async move { drop(stream) });
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

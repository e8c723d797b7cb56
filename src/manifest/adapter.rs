//! Manifest adapters: turn a user-supplied location into a [`Manifest`].
//!
//! Site-specific producers implement [`ManifestAdapter`] and are registered in
//! an [`AdapterRegistry`]. Resolution asks each adapter in registration order
//! whether it recognizes the input and uses the first one that does. Adapters
//! know nothing about chunking or concurrency.
//!
//! Two adapters ship with the crate:
//! - [`JsonFileAdapter`] - a manifest JSON file on disk
//! - [`HttpJsonAdapter`] - a manifest JSON document served over http(s)

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, instrument};

use super::{Manifest, ManifestError};
use crate::download::{FetchError, HttpClient};

/// Errors that can occur while producing a manifest.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// No registered adapter recognized the input.
    #[error("no adapter recognizes '{input}'")]
    NoAdapter { input: String },

    #[error("failed to read manifest file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to fetch manifest: {0}")]
    Fetch(#[from] FetchError),

    #[error("malformed manifest JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid manifest: {0}")]
    Invalid(#[from] ManifestError),
}

/// A producer of manifests for one family of inputs.
#[async_trait]
pub trait ManifestAdapter: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Returns true when this adapter can resolve `input`.
    fn detect(&self, input: &str) -> bool;

    /// Produces a validated manifest for `input`.
    async fn resolve(&self, input: &str) -> Result<Manifest, AdapterError>;
}

/// Adapters in registration order; the first detecting adapter wins.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: Vec<Box<dyn ManifestAdapter>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field(
                "adapters",
                &self.adapters.iter().map(|a| a.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl AdapterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in adapters.
    #[must_use]
    pub fn with_defaults(client: HttpClient) -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(JsonFileAdapter));
        registry.register(Box::new(HttpJsonAdapter::new(client)));
        registry
    }

    #[tracing::instrument(skip(self, adapter), fields(adapter_name))]
    pub fn register(&mut self, adapter: Box<dyn ManifestAdapter>) {
        tracing::Span::current().record("adapter_name", adapter.name());
        debug!(name = adapter.name(), "registering adapter");
        self.adapters.push(adapter);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Returns the adapter that will handle `input`, if any.
    #[must_use]
    pub fn find(&self, input: &str) -> Option<&dyn ManifestAdapter> {
        self.adapters
            .iter()
            .find(|a| a.detect(input))
            .map(AsRef::as_ref)
    }

    /// Resolves `input` with the first detecting adapter.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::NoAdapter`] when nothing recognizes the input,
    /// otherwise whatever the chosen adapter reports.
    #[instrument(skip(self))]
    pub async fn resolve(&self, input: &str) -> Result<Manifest, AdapterError> {
        let adapter = self.find(input).ok_or_else(|| AdapterError::NoAdapter {
            input: input.to_string(),
        })?;
        debug!(adapter = adapter.name(), "resolving manifest");
        adapter.resolve(input).await
    }
}

/// Reads a manifest from a local `.json` file.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFileAdapter;

#[async_trait]
impl ManifestAdapter for JsonFileAdapter {
    fn name(&self) -> &'static str {
        "json-file"
    }

    fn detect(&self, input: &str) -> bool {
        let path = Path::new(input);
        path.extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
            && !input.contains("://")
    }

    async fn resolve(&self, input: &str) -> Result<Manifest, AdapterError> {
        let bytes = tokio::fs::read(input)
            .await
            .map_err(|source| AdapterError::Io {
                path: PathBuf::from(input),
                source,
            })?;
        Manifest::from_json(&bytes)
    }
}

/// Fetches a manifest JSON document over http(s).
#[derive(Debug, Clone)]
pub struct HttpJsonAdapter {
    client: HttpClient,
    timeout: Duration,
}

impl HttpJsonAdapter {
    #[must_use]
    pub fn new(client: HttpClient) -> Self {
        Self {
            client,
            timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl ManifestAdapter for HttpJsonAdapter {
    fn name(&self) -> &'static str {
        "http-json"
    }

    fn detect(&self, input: &str) -> bool {
        url::Url::parse(input).is_ok_and(|u| matches!(u.scheme(), "http" | "https"))
    }

    async fn resolve(&self, input: &str) -> Result<Manifest, AdapterError> {
        let body = self.client.fetch(input, self.timeout, |_| {}).await?;
        Manifest::from_json(&body.bytes)
    }
}

//! Fetch operations attached to definitions
//!
//! The engine never performs I/O itself. Each definition that can fetch
//! carries a `Fetcher`, and the engine only decides when to call it and
//! what to do with the outcome.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::params::RawParameters;

/// Asynchronous fetch operation for one definition
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch data for the given parameters
    ///
    /// `mapped` is the output of the definition's `map_parameters` (or the
    /// raw parameters as JSON when none is declared).
    async fn fetch(&self, mapped: Value, raw: RawParameters) -> Result<Value>;
}

type FetchFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

/// Async callback-based Fetcher
///
/// Wraps an async closure so definitions can be declared inline.
pub struct CallbackFetcher {
    callback: Box<dyn Fn(Value, RawParameters) -> FetchFuture + Send + Sync>,
}

impl CallbackFetcher {
    pub fn new<F, Fut>(callback: F) -> Self
    where
        F: Fn(Value, RawParameters) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            callback: Box::new(move |mapped, raw| Box::pin(callback(mapped, raw))),
        }
    }
}

#[async_trait]
impl Fetcher for CallbackFetcher {
    async fn fetch(&self, mapped: Value, raw: RawParameters) -> Result<Value> {
        (self.callback)(mapped, raw).await
    }
}

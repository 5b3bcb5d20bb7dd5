//! Model provider abstraction
//!
//! Wraps a provider's incremental response stream into a uniform sequence of
//! typed [`StreamEvent`]s consumed by the tool-call loop.

mod anthropic;
mod error;
mod types;

pub use anthropic::AnthropicClient;
pub use error::{ProviderError, ProviderErrorKind};
pub use types::*;

use async_trait::async_trait;
use futures::stream::Stream;
use std::pin::Pin;
use std::sync::Arc;

/// Lazy, finite event sequence representing one assistant turn.
///
/// The sequence either ends with `TurnDone` or with an `Err` item; a stream
/// that ends without either must be treated by the consumer as truncated.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, ProviderError>> + Send>>;

/// Common interface for streaming model providers
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Start one assistant turn against the given history.
    ///
    /// Errors returned here are request-level failures (connection, auth,
    /// bad request); failures after streaming has begun surface as an `Err`
    /// item in the returned stream.
    async fn stream_turn(&self, request: &ModelRequest) -> Result<EventStream, ProviderError>;

    /// Get the model ID
    fn model_id(&self) -> &str;
}

#[async_trait]
impl<T: ModelClient + ?Sized> ModelClient for Arc<T> {
    async fn stream_turn(&self, request: &ModelRequest) -> Result<EventStream, ProviderError> {
        (**self).stream_turn(request).await
    }

    fn model_id(&self) -> &str {
        (**self).model_id()
    }
}

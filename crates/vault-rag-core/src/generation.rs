//! Streaming text generation interface.
//!
//! A [`Generator`] turns a prompt into an owned stream of text fragments.
//! Dropping the stream releases the underlying connection, which is how
//! callers cancel generation.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::stream::Stream;

use crate::error::GenerationError;

/// Fragments of generated text, in order.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, GenerationError>> + Send>>;

#[async_trait]
pub trait Generator: Send + Sync {
    /// Model identifier reported in responses.
    fn model_name(&self) -> &str;

    /// Start generating. Errors returned here happen before any text.
    async fn generate(&self, prompt: &str) -> Result<TokenStream, GenerationError>;
}

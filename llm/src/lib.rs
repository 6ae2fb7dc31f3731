//! Model-client abstraction consumed by the praxis runtime.
//!
//! This crate defines the chat data model (`ChatMessage`, `ToolCall`,
//! `ToolDefinition`, ...) and the `ChatModel` trait that concrete providers
//! implement. The runtime depends only on the trait; providers are selected
//! through a `ProviderFactory` keyed by a provider tag.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

pub mod api;
pub use api::*;

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn name(&self) -> &str;

    /// One model turn: messages plus tool definitions in, one assistant
    /// message out, with a stop reason.
    async fn generate(&self, request: &ChatRequest) -> anyhow::Result<ChatMessage>;

    /// Structured output: the response parsed as JSON conforming to the
    /// given schema. Providers with native structured modes override this;
    /// the default parses the text of a plain `generate` call.
    async fn structured(
        &self,
        request: &ChatRequest,
        _schema: &schemars::schema::RootSchema,
    ) -> anyhow::Result<serde_json::Value> {
        let message = self.generate(request).await?;
        let text = message.get_text();
        serde_json::from_str(text.trim())
            .map_err(|e| anyhow::anyhow!("model did not return valid JSON: {}", e))
    }
}

// Blanket implementation so Arc<dyn ChatModel> is itself a ChatModel.
#[async_trait]
impl ChatModel for Arc<dyn ChatModel> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn generate(&self, request: &ChatRequest) -> anyhow::Result<ChatMessage> {
        (**self).generate(request).await
    }

    async fn structured(
        &self,
        request: &ChatRequest,
        schema: &schemars::schema::RootSchema,
    ) -> anyhow::Result<serde_json::Value> {
        (**self).structured(request, schema).await
    }
}

type ModelConstructor = Box<dyn Fn(&str) -> anyhow::Result<Arc<dyn ChatModel>> + Send + Sync>;

/// Registry of model constructors keyed by provider tag.
///
/// Providers register themselves once; callers create models by
/// `"{provider}"` tag plus model name and only ever see `Arc<dyn
/// ChatModel>`.
#[derive(Default)]
pub struct ProviderFactory {
    constructors: HashMap<String, ModelConstructor>,
}

impl ProviderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, provider: impl Into<String>, constructor: F)
    where
        F: Fn(&str) -> anyhow::Result<Arc<dyn ChatModel>> + Send + Sync + 'static,
    {
        self.constructors
            .insert(provider.into(), Box::new(constructor));
    }

    pub fn providers(&self) -> Vec<&str> {
        self.constructors.keys().map(|k| k.as_str()).collect()
    }

    pub fn create(&self, provider: &str, model_name: &str) -> anyhow::Result<Arc<dyn ChatModel>> {
        match self.constructors.get(provider) {
            Some(constructor) => constructor(model_name),
            None => Err(anyhow::anyhow!("unknown provider '{}'", provider)),
        }
    }
}

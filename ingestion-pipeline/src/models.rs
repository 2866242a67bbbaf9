use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::Arc,
};

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
        ChatCompletionRequestUserMessage, CreateChatCompletionRequestArgs,
        CreateEmbeddingRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use common::{error::AppError, utils::config::AppConfig};
use tracing::debug;

use crate::services::{ChatModel, ChatOptions, EmbeddingModel, ModelProvider};

pub struct OpenAiEmbeddingModel {
    client: Arc<Client<OpenAIConfig>>,
    model: String,
    dimensions: u32,
}

impl OpenAiEmbeddingModel {
    pub fn new(client: Arc<Client<OpenAIConfig>>, model: impl Into<String>, dimensions: u32) -> Self {
        Self {
            client,
            model: model.into(),
            dimensions,
        }
    }
}

#[async_trait]
impl EmbeddingModel for OpenAiEmbeddingModel {
    fn id(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> u32 {
        self.dimensions
    }

    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, AppError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let expected = texts.len();
        let request = CreateEmbeddingRequestArgs::default()
            .model(self.model.clone())
            .input(texts)
            .dimensions(self.dimensions)
            .build()?;

        let response = self.client.embeddings().create(request).await?;

        let mut data = response.data;
        data.sort_by_key(|item| item.index);
        let embeddings: Vec<Vec<f32>> = data.into_iter().map(|item| item.embedding).collect();

        if embeddings.len() != expected {
            return Err(AppError::Processing(format!(
                "embedding backend returned {} vectors for {expected} inputs",
                embeddings.len()
            )));
        }
        Ok(embeddings)
    }
}

/// Bag-of-tokens embedding with no external dependency. Identical text always
/// maps to the same unit vector.
pub struct HashedEmbeddingModel {
    id: String,
    dimensions: u32,
}

impl HashedEmbeddingModel {
    pub fn new(id: impl Into<String>, dimensions: u32) -> Self {
        Self {
            id: id.into(),
            dimensions: dimensions.max(1),
        }
    }
}

#[async_trait]
impl EmbeddingModel for HashedEmbeddingModel {
    fn id(&self) -> &str {
        &self.id
    }

    fn dimensions(&self) -> u32 {
        self.dimensions
    }

    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, AppError> {
        let dim = usize::try_from(self.dimensions).unwrap_or(1);
        Ok(texts.iter().map(|text| hashed_embedding(text, dim)).collect())
    }
}

fn hashed_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let dim = dimension.max(1);
    let mut vector = vec![0.0f32; dim];

    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
    {
        let mut hasher = DefaultHasher::new();
        token.to_lowercase().hash(&mut hasher);
        let idx = usize::try_from(hasher.finish() % dim as u64).unwrap_or(0);
        if let Some(slot) = vector.get_mut(idx) {
            *slot += 1.0;
        }
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut vector {
            *value /= norm;
        }
    }
    vector
}

pub struct OpenAiChatModel {
    client: Arc<Client<OpenAIConfig>>,
    model: String,
}

impl OpenAiChatModel {
    pub fn new(client: Arc<Client<OpenAIConfig>>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    fn id(&self) -> &str {
        &self.model
    }

    async fn chat(
        &self,
        system: Option<&str>,
        user: &str,
        options: ChatOptions,
    ) -> Result<String, AppError> {
        let mut messages: Vec<ChatCompletionRequestMessage> = Vec::with_capacity(2);
        if let Some(system) = system.filter(|s| !s.trim().is_empty()) {
            messages.push(ChatCompletionRequestSystemMessage::from(system).into());
        }
        messages.push(ChatCompletionRequestUserMessage::from(user.to_string()).into());

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .temperature(options.temperature)
            .max_completion_tokens(options.max_tokens)
            .build()?;

        let response = self.client.chat().create(request).await?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.as_ref())
            .ok_or_else(|| AppError::Processing("No content found in LLM response".into()))?;

        Ok(content.trim().to_string())
    }
}

/// Resolves every model id to the OpenAI-compatible endpoint in the config.
/// An empty id means the configured default model.
pub struct OpenAiModelProvider {
    client: Arc<Client<OpenAIConfig>>,
    chat_model: String,
    embedding_model: String,
    embedding_dimensions: u32,
}

impl OpenAiModelProvider {
    pub fn new(client: Arc<Client<OpenAIConfig>>, config: &AppConfig) -> Self {
        Self {
            client,
            chat_model: config.chat_model.clone(),
            embedding_model: config.embedding_model.clone(),
            embedding_dimensions: config.embedding_dimensions,
        }
    }
}

#[async_trait]
impl ModelProvider for OpenAiModelProvider {
    async fn embedding_model(&self, id: &str) -> Result<Arc<dyn EmbeddingModel>, AppError> {
        let model = if id.trim().is_empty() {
            self.embedding_model.clone()
        } else {
            id.to_string()
        };
        debug!(model = %model, "resolved embedding model");
        Ok(Arc::new(OpenAiEmbeddingModel::new(
            Arc::clone(&self.client),
            model,
            self.embedding_dimensions,
        )))
    }

    async fn chat_model(&self, id: &str) -> Result<Arc<dyn ChatModel>, AppError> {
        let model = if id.trim().is_empty() {
            self.chat_model.clone()
        } else {
            id.to_string()
        };
        Ok(Arc::new(OpenAiChatModel::new(Arc::clone(&self.client), model)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hashed_embeddings_are_stable_unit_vectors() {
        let model = HashedEmbeddingModel::new("hashed", 16);
        let vectors = model
            .embed_batch(vec!["Reset the password".into(), "reset THE password".into(), String::new()])
            .await
            .expect("embed");

        assert_eq!(vectors.len(), 3);
        assert_eq!(vectors[0], vectors[1]);
        let norm: f32 = vectors[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!(vectors[2].iter().all(|v| *v == 0.0));
    }
}

//! Chat-completion adapters for the enrich and produce stages.
//!
//! Speaks the OpenAI-compatible `/chat/completions` protocol, which most
//! hosted providers accept.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::{EnrichRequest, Enricher, ProduceRequest, Producer};

/// Minimal chat-completions client
pub struct ChatClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

impl ChatClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(600))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn api_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// Run one completion and return the trimmed reply.
    ///
    /// An empty reply is an error.
    pub async fn complete(&self, system: Option<&str>, user: &str) -> Result<String> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system.filter(|s| !s.trim().is_empty()) {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: user,
        });

        let response = self
            .client
            .post(self.api_url())
            .bearer_auth(&self.api_key)
            .json(&ChatRequest {
                model: &self.model,
                messages,
            })
            .send()
            .await
            .context("Failed to send chat request")?;

        let status = response.status();
        let body: ChatResponse = response
            .json()
            .await
            .context("Failed to parse chat response")?;

        if let Some(err) = body.error {
            anyhow::bail!("Chat API error ({}): {}", status, err.message);
        }
        if !status.is_success() {
            anyhow::bail!("Chat API returned {}", status);
        }

        let text = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .unwrap_or_default();

        if text.is_empty() {
            anyhow::bail!("Chat API returned an empty reply");
        }
        Ok(text)
    }
}

/// Metadata block sent to the enricher
pub fn enrich_message(request: &EnrichRequest<'_>) -> String {
    let episode = request.episode;
    let mut parts = vec![format!("Podcast: {}", request.feed_name)];

    if let Some(feed) = request.feed {
        if let Some(author) = &feed.author {
            parts.push(format!("Author: {}", author));
        }
        if let Some(description) = &feed.description {
            parts.push(format!("Podcast Description: {}", description));
        }
    }

    parts.push(format!("Episode: {}", episode.title));
    if let Some(published) = &episode.published_at {
        let date = episode
            .published()
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| published.clone());
        parts.push(format!("Published: {}", date));
    }
    match episode.description.as_deref().filter(|d| !d.trim().is_empty()) {
        Some(description) => parts.push(format!("Episode Description: {}", description)),
        None => parts.push("Episode Description: (not provided)".to_string()),
    }
    if let Some(link) = &episode.link {
        parts.push(format!("Episode Link: {}", link));
    }

    format!(
        "{}\n\nPodcast & Episode Information:\n\n{}",
        request.prompt,
        parts.join("\n")
    )
}

/// Full prompt sent to the producer
pub fn produce_message(request: &ProduceRequest<'_>) -> String {
    let mut parts = vec![request.prompt.to_string()];

    if let Some(feed) = request.feed {
        let mut feed_parts = Vec::new();
        if let Some(title) = &feed.title {
            feed_parts.push(format!("Podcast: {}", title));
        }
        if let Some(description) = &feed.description {
            feed_parts.push(format!("Description: {}", description));
        }
        if !feed.categories.is_empty() {
            feed_parts.push(format!("Categories: {}", feed.categories.join(", ")));
        }
        if !feed_parts.is_empty() {
            parts.push(format!("Podcast Context:\n{}", feed_parts.join("\n")));
        }
    }

    if let Some(context) = request.context.filter(|c| !c.trim().is_empty()) {
        parts.push(format!("Episode Context (from metadata):\n{}", context));
    }

    parts.push(format!("Full Transcript:\n\n{}", request.transcript));
    parts.join("\n\n")
}

/// Enricher backed by a chat model
pub struct ChatEnricher {
    client: ChatClient,
}

impl ChatEnricher {
    pub fn new(client: ChatClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Enricher for ChatEnricher {
    async fn enrich(&self, request: EnrichRequest<'_>) -> Option<String> {
        info!(title = %request.episode.title, model = self.client.model(), "Generating context");
        match self.client.complete(None, &enrich_message(&request)).await {
            Ok(context) => {
                info!(chars = context.len(), "Generated context");
                Some(context)
            }
            Err(e) => {
                error!(error = %e, "Context generation failed");
                None
            }
        }
    }
}

/// Producer (summarizer) backed by a chat model
pub struct ChatProducer {
    client: ChatClient,
    system_prompt: String,
}

impl ChatProducer {
    pub fn new(client: ChatClient, system_prompt: impl Into<String>) -> Self {
        Self {
            client,
            system_prompt: system_prompt.into(),
        }
    }
}

#[async_trait]
impl Producer for ChatProducer {
    async fn produce(&self, request: ProduceRequest<'_>) -> Result<Option<String>> {
        if request.transcript.trim().is_empty() {
            error!("Transcript is empty");
            return Ok(None);
        }

        info!(model = self.client.model(), "Generating summary");
        let summary = self
            .client
            .complete(Some(&self.system_prompt), &produce_message(&request))
            .await?;
        Ok(Some(summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Episode, FeedMetadata};

    fn episode() -> Episode {
        Episode {
            id: 1,
            feed_id: 1,
            guid: "g".to_string(),
            title: "The Episode".to_string(),
            description: None,
            link: Some("https://example.com/ep".to_string()),
            content_url: "https://example.com/ep.mp3".to_string(),
            artwork_url: None,
            published_at: Some("2024-03-15T09:00:00Z".to_string()),
            duration_minutes: None,
            file_size_mb: None,
            context: None,
            result: None,
            raw_record: None,
        }
    }

    #[test]
    fn test_enrich_message_layout() {
        let ep = episode();
        let feed = FeedMetadata {
            author: Some("Host".to_string()),
            ..Default::default()
        };
        let message = enrich_message(&EnrichRequest {
            feed_name: "Show",
            feed: Some(&feed),
            episode: &ep,
            prompt: "Describe it.",
        });

        assert!(message.starts_with("Describe it.\n\nPodcast & Episode Information:\n\n"));
        assert!(message.contains("Podcast: Show\nAuthor: Host\nEpisode: The Episode"));
        assert!(message.contains("Published: 2024-03-15"));
        assert!(message.contains("Episode Description: (not provided)"));
    }

    #[test]
    fn test_produce_message_order() {
        let feed = FeedMetadata {
            title: Some("Show".to_string()),
            categories: vec!["Tech".to_string(), "News".to_string()],
            ..Default::default()
        };
        let message = produce_message(&ProduceRequest {
            transcript: "hello world",
            prompt: "Summarize.",
            context: Some("Guests: A"),
            feed: Some(&feed),
        });

        let prompt_at = message.find("Summarize.").unwrap();
        let feed_at = message.find("Podcast Context:\nPodcast: Show\nCategories: Tech, News").unwrap();
        let context_at = message.find("Episode Context (from metadata):\nGuests: A").unwrap();
        let transcript_at = message.find("Full Transcript:\n\nhello world").unwrap();
        assert!(prompt_at < feed_at && feed_at < context_at && context_at < transcript_at);
    }

    #[test]
    fn test_api_url_trims_slash() {
        let client = ChatClient::new("https://api.example.com/v1/", "key", "model").unwrap();
        assert_eq!(client.api_url(), "https://api.example.com/v1/chat/completions");
    }
}

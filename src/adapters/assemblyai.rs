//! AssemblyAI transcription with speaker labels.
//!
//! Upload, submit, then poll until the job settles. The orchestrator sees
//! one awaited call.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, error, info};

use super::Transformer;

const API_BASE: &str = "https://api.assemblyai.com/v2";
const POLL_INTERVAL: Duration = Duration::from_secs(10);

pub struct AssemblyAiTranscriber {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    upload_url: String,
}

#[derive(Debug, Deserialize)]
struct TranscriptJob {
    id: String,
    status: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    utterances: Option<Vec<Utterance>>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Utterance {
    speaker: String,
    text: String,
}

impl AssemblyAiTranscriber {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(600))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: API_BASE.to_string(),
            poll_interval: POLL_INTERVAL,
        })
    }

    async fn upload(&self, path: &Path) -> Result<String> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let response: UploadResponse = self
            .client
            .post(format!("{}/upload", self.base_url))
            .header("authorization", &self.api_key)
            .body(bytes)
            .send()
            .await
            .context("Failed to upload audio")?
            .error_for_status()
            .context("Upload rejected")?
            .json()
            .await
            .context("Failed to parse upload response")?;

        Ok(response.upload_url)
    }

    async fn submit(&self, audio_url: &str) -> Result<TranscriptJob> {
        self.client
            .post(format!("{}/transcript", self.base_url))
            .header("authorization", &self.api_key)
            .json(&serde_json::json!({
                "audio_url": audio_url,
                "speaker_labels": true,
            }))
            .send()
            .await
            .context("Failed to submit transcription")?
            .error_for_status()
            .context("Transcription request rejected")?
            .json()
            .await
            .context("Failed to parse transcription response")
    }

    async fn poll(&self, id: &str) -> Result<TranscriptJob> {
        loop {
            let job: TranscriptJob = self
                .client
                .get(format!("{}/transcript/{}", self.base_url, id))
                .header("authorization", &self.api_key)
                .send()
                .await
                .context("Failed to poll transcription")?
                .error_for_status()
                .context("Transcription poll rejected")?
                .json()
                .await
                .context("Failed to parse transcription status")?;

            match job.status.as_str() {
                "completed" | "error" => return Ok(job),
                status => {
                    debug!(id, status, "Transcription pending");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }
}

/// "Speaker X: text" paragraphs, or the flat text without diarization
fn format_transcript(job: &TranscriptJob) -> String {
    match job.utterances.as_deref() {
        Some(utterances) if !utterances.is_empty() => utterances
            .iter()
            .map(|u| format!("Speaker {}: {}", u.speaker, u.text))
            .collect::<Vec<_>>()
            .join("\n\n"),
        _ => job.text.clone().unwrap_or_default(),
    }
}

#[async_trait]
impl Transformer for AssemblyAiTranscriber {
    async fn transform(&self, input: &Path, output: &Path) -> Result<Option<PathBuf>> {
        if tokio::fs::metadata(output).await.map(|m| m.len() > 0).unwrap_or(false) {
            info!(path = %output.display(), "Transcript already on disk");
            return Ok(Some(output.to_path_buf()));
        }

        info!(input = %input.display(), "Uploading audio for transcription");
        let upload_url = self.upload(input).await?;
        let job = self.submit(&upload_url).await?;
        info!(id = %job.id, "Transcription submitted");

        let job = self.poll(&job.id).await?;
        if job.status == "error" {
            error!(id = %job.id, error = ?job.error, "Transcription failed");
            return Ok(None);
        }

        let text = format_transcript(&job);
        if text.trim().is_empty() {
            error!(id = %job.id, "Transcription returned no text");
            return Ok(None);
        }

        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(output, text)
            .await
            .with_context(|| format!("Failed to write {}", output.display()))?;

        info!(path = %output.display(), "Saved transcript");
        Ok(Some(output.to_path_buf()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_with_speakers() {
        let job: TranscriptJob = serde_json::from_str(
            r#"{"id":"t1","status":"completed","text":"hi there",
                "utterances":[{"speaker":"A","text":"hi"},{"speaker":"B","text":"there"}]}"#,
        )
        .unwrap();
        assert_eq!(format_transcript(&job), "Speaker A: hi\n\nSpeaker B: there");
    }

    #[test]
    fn test_format_without_speakers() {
        let job: TranscriptJob =
            serde_json::from_str(r#"{"id":"t1","status":"completed","text":"plain","utterances":null}"#)
                .unwrap();
        assert_eq!(format_transcript(&job), "plain");
    }
}

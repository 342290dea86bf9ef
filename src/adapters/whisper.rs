//! Whisper transcription backend.
//!
//! Shells out to a local whisper binary.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{error, info};

use super::Transformer;

/// Whisper output JSON structure
#[derive(Debug, Deserialize)]
struct WhisperOutput {
    text: String,
    #[serde(default)]
    segments: Vec<WhisperSegment>,
}

#[derive(Debug, Deserialize)]
struct WhisperSegment {
    #[serde(default)]
    text: String,
}

pub struct WhisperTranscriber {
    binary: String,
    model: String,
    language: String,
}

impl WhisperTranscriber {
    /// Binary from `WHISPER_PATH`, else `whisper` on PATH
    pub fn new(model: impl Into<String>, language: impl Into<String>) -> Self {
        let binary = std::env::var("WHISPER_PATH").unwrap_or_else(|_| "whisper".to_string());
        Self::with_binary(binary, model, language)
    }

    pub fn with_binary(
        binary: impl Into<String>,
        model: impl Into<String>,
        language: impl Into<String>,
    ) -> Self {
        Self {
            binary: binary.into(),
            model: model.into(),
            language: language.into(),
        }
    }

    async fn run(&self, input: &Path) -> Result<String> {
        let temp_dir = tempfile::tempdir().context("Failed to create temp dir")?;

        let output = Command::new(&self.binary)
            .arg(input)
            .arg("--model")
            .arg(&self.model)
            .arg("--output_dir")
            .arg(temp_dir.path())
            .arg("--output_format")
            .arg("json")
            .arg("--language")
            .arg(&self.language)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.binary))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Whisper failed: {}", stderr.trim());
        }

        let stem = input.file_stem().unwrap_or_default().to_string_lossy();
        let json_path = temp_dir.path().join(format!("{}.json", stem));
        let json = tokio::fs::read_to_string(&json_path)
            .await
            .context("Failed to read whisper output")?;

        let whisper: WhisperOutput =
            serde_json::from_str(&json).context("Failed to parse whisper JSON")?;
        Ok(format_transcript(whisper))
    }
}

/// One paragraph per segment; falls back to the flat text
fn format_transcript(output: WhisperOutput) -> String {
    let paragraphs: Vec<&str> = output
        .segments
        .iter()
        .map(|s| s.text.trim())
        .filter(|t| !t.is_empty())
        .collect();

    if paragraphs.is_empty() {
        output.text.trim().to_string()
    } else {
        paragraphs.join("\n\n")
    }
}

#[async_trait]
impl Transformer for WhisperTranscriber {
    async fn transform(&self, input: &Path, output: &Path) -> Result<Option<PathBuf>> {
        if tokio::fs::metadata(output).await.map(|m| m.len() > 0).unwrap_or(false) {
            info!(path = %output.display(), "Transcript already on disk");
            return Ok(Some(output.to_path_buf()));
        }

        info!(input = %input.display(), model = %self.model, "Transcribing with whisper");
        let text = self.run(input).await?;
        if text.is_empty() {
            error!(input = %input.display(), "Whisper produced no text");
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

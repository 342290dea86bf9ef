//! Configuration for podmon.
//!
//! Configuration sources:
//! 1. `podcasts.yaml` and `config.yaml` in the config directory
//!    (`--config-dir`, else `$PODMON_CONFIG_DIR`, else the current directory)
//! 2. Secrets from the environment (`RESEND_API_KEY`, `OPENAI_API_KEY` or
//!    `GEMINI_API_KEY`, `ASSEMBLYAI_API_KEY`)
//! 3. State directory: `$PODMON_HOME`, else `~/.podmon`
//!
//! Everything is validated up front; a run never starts on a bad config.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::core::eligibility::EligibilityLimits;

pub const PODCASTS_FILE: &str = "podcasts.yaml";
pub const CONFIG_FILE: &str = "config.yaml";

const EMAIL_PATTERN: &str = r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{0}")]
    Invalid(String),

    #[error("missing required environment variables: {}", .0.join(", "))]
    MissingSecrets(Vec<String>),

    #[error("failed to determine home directory")]
    NoHome,
}

/// One entry of `podcasts.yaml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedConfig {
    pub name: String,
    pub slug: String,
    pub rss_url: String,
    pub active: bool,

    /// Distribution destinations
    #[serde(default)]
    pub emails: Vec<String>,

    /// Overrides `summary_default_prompt` for this feed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insights_prompt: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PodcastsFile {
    #[serde(default)]
    podcasts: Vec<FeedConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriberKind {
    #[serde(alias = "assembly_ai")]
    AssemblyAi,
    Whisper,
}

/// The `settings` section of `config.yaml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_check_last_n")]
    pub check_last_n_episodes: u32,

    #[serde(default = "default_max_age_days")]
    pub max_episode_age_days: i64,

    #[serde(default = "default_max_length_minutes")]
    pub max_audio_length_minutes: i64,

    #[serde(default = "default_max_file_size_mb")]
    pub max_audio_file_size_mb: u64,

    /// Sender address and failure-report recipient
    pub system_email: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_email: Option<String>,

    #[serde(default = "default_transcriber")]
    pub transcriber: TranscriberKind,

    #[serde(default = "default_whisper_model")]
    pub whisper_model: String,

    #[serde(default = "default_language")]
    pub transcription_language: String,

    /// OpenAI-compatible endpoint for enrich and produce; defaults to the
    /// provider whose key is set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_base_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_model: Option<String>,

    /// Failures newer than this go into the post-run report
    #[serde(default = "default_failure_report_hours")]
    pub failure_report_hours: i64,
}

fn default_check_last_n() -> u32 {
    3
}
fn default_max_age_days() -> i64 {
    3
}
fn default_max_length_minutes() -> i64 {
    240
}
fn default_max_file_size_mb() -> u64 {
    500
}
fn default_transcriber() -> TranscriberKind {
    TranscriberKind::AssemblyAi
}
fn default_whisper_model() -> String {
    "base".to_string()
}
fn default_language() -> String {
    "en".to_string()
}
fn default_failure_report_hours() -> i64 {
    24
}

impl Settings {
    pub fn eligibility(&self) -> EligibilityLimits {
        EligibilityLimits {
            max_episode_age_days: self.max_episode_age_days,
        }
    }
}

/// Raw `config.yaml` schema
#[derive(Debug, Deserialize)]
struct ConfigFile {
    settings: Option<Settings>,
    summary_default_prompt: Option<String>,
    summary_system_prompt: Option<String>,
    #[serde(default)]
    default_contextualize_prompt: String,
}

/// Chat-completion provider, chosen by which API key is present
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    #[default]
    OpenAi,
    Gemini,
}

impl LlmProvider {
    pub fn base_url(&self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com/v1",
            Self::Gemini => "https://generativelanguage.googleapis.com/v1beta/openai",
        }
    }

    pub fn context_model(&self) -> &'static str {
        match self {
            Self::OpenAi => "gpt-4o-mini",
            Self::Gemini => "gemini-2.5-flash",
        }
    }

    pub fn summary_model(&self) -> &'static str {
        match self {
            Self::OpenAi => "gpt-4o",
            Self::Gemini => "gemini-2.5-pro",
        }
    }
}

/// Resolved chat-completion endpoint and models
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LlmEndpoint {
    pub provider: LlmProvider,
    pub base_url: String,
    pub context_model: String,
    pub summary_model: String,
}

/// API keys taken from the environment
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    pub resend_api_key: Option<String>,
    pub llm_api_key: Option<String>,

    /// Provider `llm_api_key` belongs to
    pub llm_provider: LlmProvider,

    pub assemblyai_api_key: Option<String>,
}

impl Secrets {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// `OPENAI_API_KEY` wins over `GEMINI_API_KEY` when both are set
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let (llm_api_key, llm_provider) = match (var("OPENAI_API_KEY"), var("GEMINI_API_KEY")) {
            (Some(key), _) => (Some(key), LlmProvider::OpenAi),
            (None, Some(key)) => (Some(key), LlmProvider::Gemini),
            (None, None) => (None, LlmProvider::OpenAi),
        };
        Self {
            resend_api_key: var("RESEND_API_KEY"),
            llm_api_key,
            llm_provider,
            assemblyai_api_key: var("ASSEMBLYAI_API_KEY"),
        }
    }
}

/// Validated configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// State directory (database, lock, audio, transcripts, summaries)
    pub home: PathBuf,
    pub config_dir: PathBuf,
    pub feeds: Vec<FeedConfig>,
    pub settings: Settings,
    pub summary_default_prompt: String,
    pub summary_system_prompt: String,
    pub contextualize_prompt: String,
    pub secrets: Secrets,
}

/// Secret-free view for display
#[derive(Debug, Serialize)]
pub struct ConfigView<'a> {
    pub home: &'a Path,
    pub config_dir: &'a Path,
    pub settings: &'a Settings,
    pub llm: LlmEndpoint,
    pub feeds: &'a [FeedConfig],
    pub resend_api_key: String,
    pub llm_api_key: String,
    pub assemblyai_api_key: String,
}

/// Resolve the state directory: `$PODMON_HOME`, else `~/.podmon`
pub fn resolve_home() -> Result<PathBuf, ConfigError> {
    if let Ok(home) = std::env::var("PODMON_HOME") {
        if !home.trim().is_empty() {
            return Ok(PathBuf::from(home));
        }
    }
    dirs::home_dir()
        .map(|h| h.join(".podmon"))
        .ok_or(ConfigError::NoHome)
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_yaml<T: serde::de::DeserializeOwned + Default>(
    path: &Path,
    content: &str,
) -> Result<T, ConfigError> {
    // An empty document parses as null
    if content.trim().is_empty() {
        return Ok(T::default());
    }
    serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            settings: None,
            summary_default_prompt: None,
            summary_system_prompt: None,
            default_contextualize_prompt: String::new(),
        }
    }
}

/// Mask all but the last four characters
fn mask(secret: &Option<String>) -> String {
    match secret {
        Some(s) if s.chars().count() > 4 => {
            let tail: String = s.chars().skip(s.chars().count() - 4).collect();
            format!("****{}", tail)
        }
        Some(_) => "****".to_string(),
        None => "(unset)".to_string(),
    }
}

impl Config {
    /// Load and validate from `config_dir`, the environment and the home dir.
    ///
    /// Secrets are read but not required here; commands that call out to
    /// providers check them with [`Config::validate_secrets`].
    pub fn load(config_dir: &Path) -> Result<Self, ConfigError> {
        let podcasts_path = config_dir.join(PODCASTS_FILE);
        let config_path = config_dir.join(CONFIG_FILE);

        let podcasts = read_file(&podcasts_path)?;
        let app = read_file(&config_path)?;

        let config = Self::from_yaml(
            &podcasts_path,
            &podcasts,
            &config_path,
            &app,
            resolve_home()?,
            Secrets::from_env(),
        )?;

        info!(
            feeds = config.feeds.len(),
            config_dir = %config_dir.display(),
            home = %config.home.display(),
            "Configuration loaded"
        );
        Ok(Self {
            config_dir: config_dir.to_path_buf(),
            ..config
        })
    }

    /// Build from YAML text; validates everything except secrets
    pub fn from_yaml(
        podcasts_path: &Path,
        podcasts_yaml: &str,
        config_path: &Path,
        config_yaml: &str,
        home: PathBuf,
        secrets: Secrets,
    ) -> Result<Self, ConfigError> {
        let podcasts: PodcastsFile = parse_yaml(podcasts_path, podcasts_yaml)?;
        let file: ConfigFile = parse_yaml(config_path, config_yaml)?;

        let settings = file
            .settings
            .ok_or_else(|| invalid("missing 'settings' section in config.yaml"))?;
        let summary_default_prompt = file
            .summary_default_prompt
            .ok_or_else(|| invalid("missing 'summary_default_prompt' in config.yaml"))?;
        let summary_system_prompt = file
            .summary_system_prompt
            .ok_or_else(|| invalid("missing 'summary_system_prompt' in config.yaml"))?;

        let config = Self {
            home,
            config_dir: config_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default(),
            feeds: podcasts.podcasts,
            settings,
            summary_default_prompt,
            summary_system_prompt,
            contextualize_prompt: file.default_contextualize_prompt,
            secrets,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let email = Regex::new(EMAIL_PATTERN).map_err(|e| invalid(&e.to_string()))?;

        if self.feeds.is_empty() {
            return Err(invalid("no podcasts defined in podcasts.yaml"));
        }

        let mut slugs = HashSet::new();
        for (i, feed) in self.feeds.iter().enumerate() {
            if feed.name.trim().is_empty() {
                return Err(invalid(&format!("podcast {}: 'name' must be non-empty", i)));
            }
            if feed.slug.trim().is_empty() {
                return Err(invalid(&format!("podcast {}: 'slug' must be non-empty", i)));
            }
            if feed.rss_url.trim().is_empty() {
                return Err(invalid(&format!("podcast {}: 'rss_url' must be non-empty", i)));
            }
            if !slugs.insert(feed.slug.as_str()) {
                return Err(invalid(&format!("duplicate slug found: '{}'", feed.slug)));
            }
            if !(feed.rss_url.starts_with("http://") || feed.rss_url.starts_with("https://")) {
                return Err(invalid(&format!("podcast '{}': invalid RSS URL format", feed.slug)));
            }
            if feed.emails.is_empty() {
                warn!(slug = %feed.slug, "No emails configured; episodes will be skipped");
            }
            for address in &feed.emails {
                if !email.is_match(address) {
                    return Err(invalid(&format!(
                        "podcast '{}': invalid email format: {}",
                        feed.slug, address
                    )));
                }
            }
        }

        if self.summary_default_prompt.trim().is_empty() {
            return Err(invalid("'summary_default_prompt' cannot be empty"));
        }
        if self.summary_system_prompt.trim().is_empty() {
            return Err(invalid("'summary_system_prompt' cannot be empty"));
        }

        let settings = &self.settings;
        if settings.system_email.trim().is_empty() {
            return Err(invalid("'system_email' is required in settings"));
        }
        if !email.is_match(&settings.system_email) {
            return Err(invalid(&format!(
                "invalid system_email format: {}",
                settings.system_email
            )));
        }
        if let Some(reply_to) = &settings.reply_to_email {
            if !email.is_match(reply_to) {
                return Err(invalid(&format!("invalid reply_to_email format: {}", reply_to)));
            }
        }

        let numeric = [
            ("check_last_n_episodes", i64::from(settings.check_last_n_episodes)),
            ("max_episode_age_days", settings.max_episode_age_days),
            ("max_audio_length_minutes", settings.max_audio_length_minutes),
            ("max_audio_file_size_mb", settings.max_audio_file_size_mb as i64),
            ("failure_report_hours", settings.failure_report_hours),
        ];
        for (name, value) in numeric {
            if value <= 0 {
                return Err(invalid(&format!("setting '{}' must be a positive integer", name)));
            }
        }

        Ok(())
    }

    /// Check that every secret the selected adapters need is present
    pub fn validate_secrets(&self) -> Result<(), ConfigError> {
        let mut missing = Vec::new();
        if self.secrets.resend_api_key.is_none() {
            missing.push("RESEND_API_KEY".to_string());
        }
        if self.secrets.llm_api_key.is_none() {
            missing.push("OPENAI_API_KEY or GEMINI_API_KEY".to_string());
        }
        if self.settings.transcriber == TranscriberKind::AssemblyAi
            && self.secrets.assemblyai_api_key.is_none()
        {
            missing.push("ASSEMBLYAI_API_KEY".to_string());
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::MissingSecrets(missing))
        }
    }

    pub fn feed(&self, slug: &str) -> Option<&FeedConfig> {
        self.feeds.iter().find(|f| f.slug == slug)
    }

    /// `(slug, active)` pairs for registry sync
    pub fn feed_flags(&self) -> Vec<(&str, bool)> {
        self.feeds
            .iter()
            .map(|f| (f.slug.as_str(), f.active))
            .collect()
    }

    /// Summary prompt for a feed (its own, else the default)
    pub fn summary_prompt<'a>(&'a self, feed: &'a FeedConfig) -> &'a str {
        feed.insights_prompt
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or(&self.summary_default_prompt)
    }

    /// Endpoint and models for enrich and produce.
    ///
    /// Explicit settings win; anything unset follows the provider of the
    /// configured key, so a Gemini key is never sent to OpenAI by default.
    pub fn llm_endpoint(&self) -> LlmEndpoint {
        let provider = self.secrets.llm_provider;
        let settings = &self.settings;
        LlmEndpoint {
            provider,
            base_url: settings
                .llm_base_url
                .clone()
                .unwrap_or_else(|| provider.base_url().to_string()),
            context_model: settings
                .context_model
                .clone()
                .unwrap_or_else(|| provider.context_model().to_string()),
            summary_model: settings
                .summary_model
                .clone()
                .unwrap_or_else(|| provider.summary_model().to_string()),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.home.join("podmon.db")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.home.join("podmon.lock")
    }

    pub fn audio_dir(&self) -> PathBuf {
        self.home.join("audio")
    }

    pub fn transcripts_dir(&self) -> PathBuf {
        self.home.join("transcripts")
    }

    pub fn summaries_dir(&self) -> PathBuf {
        self.home.join("summaries")
    }

    pub fn view(&self) -> ConfigView<'_> {
        ConfigView {
            home: &self.home,
            config_dir: &self.config_dir,
            settings: &self.settings,
            llm: self.llm_endpoint(),
            feeds: &self.feeds,
            resend_api_key: mask(&self.secrets.resend_api_key),
            llm_api_key: mask(&self.secrets.llm_api_key),
            assemblyai_api_key: mask(&self.secrets.assemblyai_api_key),
        }
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Invalid(message.to_string())
}

//! Resend email distributor.
//!
//! One message per destination through the batch endpoint, so a bad
//! address fails alone and its outcome is reported by index.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use pulldown_cmark::{html, Event, Options, Parser};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::{Artifact, DeliveryOutcome, Distributor};
use crate::core::event_store::FailedEpisode;
use crate::domain::episode::parse_published;

const API_BASE: &str = "https://api.resend.com";

pub struct ResendDistributor {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    from: String,
    reply_to: Option<String>,

    /// Administrator address for failure digests
    system_email: String,
}

#[derive(Debug, Serialize)]
struct EmailParams<'a> {
    from: &'a str,
    to: Vec<&'a str>,
    subject: &'a str,
    html: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<Vec<&'a str>>,
}

#[derive(Debug, Default, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    errors: Vec<BatchError>,
}

#[derive(Debug, Deserialize)]
struct BatchError {
    index: usize,
    #[serde(default)]
    message: String,
}

impl ResendDistributor {
    pub fn new(
        api_key: impl Into<String>,
        system_email: impl Into<String>,
        reply_to: Option<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build HTTP client")?;
        let system_email = system_email.into();

        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: API_BASE.to_string(),
            from: format!("Podcast Summary <{}>", system_email),
            reply_to,
            system_email,
        })
    }

    fn reply_to(&self) -> Option<Vec<&str>> {
        self.reply_to.as_deref().map(|r| vec![r])
    }

    async fn send_batch(&self, batch: &[EmailParams<'_>]) -> Result<BatchResponse> {
        let response = self
            .client
            .post(format!("{}/emails/batch", self.base_url))
            .bearer_auth(&self.api_key)
            .header("x-batch-validation", "permissive")
            .json(batch)
            .send()
            .await
            .context("Failed to send batch email")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Resend API error ({}): {}", status, body);
        }

        response
            .json()
            .await
            .context("Failed to parse Resend response")
    }
}

/// Minimal HTML escaping for text interpolated into markup
fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn format_duration(minutes: i64) -> String {
    if minutes < 60 {
        return format!("{} min", minutes);
    }
    match (minutes / 60, minutes % 60) {
        (hours, 0) => format!("{}h", hours),
        (hours, mins) => format!("{}h {}m", hours, mins),
    }
}

/// "Mar 15, 2024", with the time when it is not midnight
pub fn format_published(raw: &str) -> String {
    match parse_published(raw) {
        Some(dt) if dt.format("%H:%M").to_string() != "00:00" => {
            dt.format("%b %d, %Y %I:%M %p").to_string()
        }
        Some(dt) => dt.format("%b %d, %Y").to_string(),
        None => raw.to_string(),
    }
}

fn subject(artifact: &Artifact<'_>) -> String {
    format!("SUMMARY: {}: {}", artifact.feed_name, artifact.episode.title)
}

/// Episode link, else the feed's own link
fn listen_link<'a>(artifact: &'a Artifact<'_>) -> Option<&'a str> {
    artifact
        .episode
        .link
        .as_deref()
        .or_else(|| artifact.feed.and_then(|f| f.link.as_deref()))
}

pub fn render_html(artifact: &Artifact<'_>) -> String {
    let episode = artifact.episode;
    let feed_link = artifact.feed.and_then(|f| f.link.as_deref());
    let image = episode
        .artwork_url
        .as_deref()
        .or_else(|| artifact.feed.and_then(|f| f.image_url.as_deref()));

    let mut html = String::from("<html><body style='font-family: Arial, sans-serif;'>");
    if let Some(image) = image {
        html.push_str(&format!(
            "<img src='{}' alt='Episode artwork' style='max-width: 250px; margin-bottom: 20px;'><br>",
            escape(image)
        ));
    }
    html.push_str(&format!(
        "<h2 style='margin-bottom: 8px;'>{}</h2>",
        escape(&episode.title)
    ));

    html.push_str("<div style='font-size: 0.85em; color: #666; margin-bottom: 16px;'>");
    match feed_link {
        Some(link) => html.push_str(&format!(
            "<a href='{}' style='color: #666; text-decoration: none;'>{}</a>",
            escape(link),
            escape(artifact.feed_name)
        )),
        None => html.push_str(&escape(artifact.feed_name)),
    }
    if let Some(published) = &episode.published_at {
        html.push_str(&format!(" &bull; {}", escape(&format_published(published))));
    }
    html.push_str("</div>");

    let duration = episode
        .duration_minutes
        .map(|m| format!(" ({})", format_duration(m)))
        .unwrap_or_default();
    if let Some(link) = listen_link(artifact) {
        html.push_str(&format!(
            "<p><a href='{}'>Listen to episode</a>{}</p>",
            escape(link),
            duration
        ));
    }

    html.push_str("<hr><div style='margin-top: 20px;'>");
    html.push_str(&render_markdown(artifact.summary));
    html.push_str("</div></body></html>");
    html
}

/// Summary markdown to HTML. Raw HTML in the summary is shown as text.
fn render_markdown(markdown: &str) -> String {
    let options = Options::ENABLE_TABLES | Options::ENABLE_STRIKETHROUGH;
    let parser = Parser::new_ext(markdown, options).map(|event| match event {
        Event::Html(raw) | Event::InlineHtml(raw) => Event::Text(raw),
        other => other,
    });

    let mut out = String::with_capacity(markdown.len() * 3 / 2);
    html::push_html(&mut out, parser);
    out
}

pub fn render_text(artifact: &Artifact<'_>) -> String {
    let episode = artifact.episode;
    let mut text = format!("{}\n\n{}", episode.title, artifact.feed_name);
    if let Some(published) = &episode.published_at {
        text.push_str(&format!(" - {}", format_published(published)));
    }
    text.push('\n');
    if let Some(link) = artifact.feed.and_then(|f| f.link.as_deref()) {
        text.push_str(link);
        text.push('\n');
    }
    text.push('\n');

    if let Some(link) = listen_link(artifact) {
        let duration = episode
            .duration_minutes
            .map(|m| format!(" ({})", format_duration(m)))
            .unwrap_or_default();
        text.push_str(&format!("Listen: {}{}\n\n", link, duration));
    }

    text.push_str(&"=".repeat(60));
    text.push_str("\n\n");
    text.push_str(artifact.summary);
    text
}

fn render_failures_html(failures: &[FailedEpisode]) -> String {
    let mut html = String::from("<html><body style='font-family: Arial, sans-serif;'>");
    html.push_str("<h2>Failed Episodes Report</h2>");
    html.push_str(&format!("<p>{} episodes failed to process:</p>", failures.len()));
    html.push_str("<table border='1' cellpadding='10' style='border-collapse: collapse;'>");
    html.push_str("<tr><th>Podcast</th><th>Episode</th><th>Stage</th><th>Error</th><th>Failed At</th></tr>");
    for failure in failures {
        html.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
            escape(&failure.feed_slug),
            escape(&failure.title),
            failure.failed_stage,
            escape(&failure.error_message),
            failure.failed_at.format("%Y-%m-%d %H:%M UTC")
        ));
    }
    html.push_str("</table></body></html>");
    html
}

fn render_failures_text(failures: &[FailedEpisode]) -> String {
    let mut text = format!("Failed Episodes Report\n\n{} episodes failed to process:\n\n", failures.len());
    for failure in failures {
        text.push_str(&format!(
            "- {} / {}\n  Stage: {}\n  Error: {}\n  Failed at: {}\n\n",
            failure.feed_slug,
            failure.title,
            failure.failed_stage,
            failure.error_message,
            failure.failed_at.format("%Y-%m-%d %H:%M UTC")
        ));
    }
    text
}

/// Map batch errors (by index) onto per-destination outcomes
fn outcomes(destinations: &[String], response: BatchResponse) -> Vec<DeliveryOutcome> {
    let mut outcomes: Vec<DeliveryOutcome> = destinations
        .iter()
        .map(DeliveryOutcome::delivered)
        .collect();

    for err in response.errors {
        match outcomes.get_mut(err.index) {
            Some(outcome) => {
                error!(destination = %outcome.destination, index = err.index, message = %err.message, "Email rejected");
                *outcome = DeliveryOutcome::failed(outcome.destination.clone(), err.message);
            }
            None => error!(index = err.index, message = %err.message, "Email error for unknown index"),
        }
    }
    outcomes
}

#[async_trait]
impl Distributor for ResendDistributor {
    fn render(&self, artifact: &Artifact<'_>) -> String {
        render_html(artifact)
    }

    async fn deliver(
        &self,
        artifact: &Artifact<'_>,
        destinations: &[String],
    ) -> Result<Vec<DeliveryOutcome>> {
        let subject = subject(artifact);
        let html = render_html(artifact);
        let text = render_text(artifact);

        let batch: Vec<EmailParams<'_>> = destinations
            .iter()
            .map(|to| EmailParams {
                from: &self.from,
                to: vec![to.as_str()],
                subject: &subject,
                html: &html,
                text: &text,
                reply_to: self.reply_to(),
            })
            .collect();

        info!(count = destinations.len(), "Sending batch email");
        let response = self.send_batch(&batch).await?;
        let outcomes = outcomes(destinations, response);

        let sent = outcomes.iter().filter(|o| o.delivered).count();
        info!(sent, total = destinations.len(), "Batch email finished");
        Ok(outcomes)
    }

    async fn report_failures(&self, failures: &[FailedEpisode]) -> Result<()> {
        if failures.is_empty() {
            return Ok(());
        }

        let subject = format!("Podcast Monitor: {} Failed Episodes", failures.len());
        let html = render_failures_html(failures);
        let text = render_failures_text(failures);
        let batch = [EmailParams {
            from: &self.from,
            to: vec![self.system_email.as_str()],
            subject: &subject,
            html: &html,
            text: &text,
            reply_to: self.reply_to(),
        }];

        let response = self.send_batch(&batch).await?;
        if let Some(err) = response.errors.first() {
            anyhow::bail!("Failure report rejected: {}", err.message);
        }
        info!(to = %self.system_email, count = failures.len(), "Sent failure report");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Episode, FailedStage, FeedMetadata};
    use chrono::Utc;

    fn episode() -> Episode {
        Episode {
            id: 1,
            feed_id: 1,
            guid: "g".to_string(),
            title: "Tips & <Tricks>".to_string(),
            description: None,
            link: None,
            content_url: "https://example.com/ep.mp3".to_string(),
            artwork_url: None,
            published_at: Some("2024-03-15T00:00:00Z".to_string()),
            duration_minutes: Some(95),
            file_size_mb: None,
            context: None,
            result: None,
            raw_record: None,
        }
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(45), "45 min");
        assert_eq!(format_duration(120), "2h");
        assert_eq!(format_duration(95), "1h 35m");
    }

    #[test]
    fn test_format_published() {
        assert_eq!(format_published("2024-03-15T00:00:00Z"), "Mar 15, 2024");
        assert_eq!(format_published("2024-03-15T14:30:00Z"), "Mar 15, 2024 02:30 PM");
        assert_eq!(format_published("whenever"), "whenever");
    }

    #[test]
    fn test_render_html_escapes_and_falls_back() {
        let ep = episode();
        let feed = FeedMetadata {
            link: Some("https://show.example.com".to_string()),
            image_url: Some("https://show.example.com/art.png".to_string()),
            ..Default::default()
        };
        let artifact = Artifact {
            feed_name: "Show",
            feed: Some(&feed),
            episode: &ep,
            summary: "First point.\n\nSecond point.",
        };

        let html = render_html(&artifact);
        assert!(html.contains("Tips &amp; &lt;Tricks&gt;"));
        assert!(html.contains("https://show.example.com/art.png"));
        assert!(html.contains("<a href='https://show.example.com'>Listen to episode</a> (1h 35m)"));
        assert!(html.contains("<p>First point.</p>\n<p>Second point.</p>"));

        let text = render_text(&artifact);
        assert!(text.starts_with("Tips & <Tricks>\n\nShow - Mar 15, 2024\n"));
        assert!(text.ends_with("First point.\n\nSecond point."));
    }

    #[test]
    fn test_summary_markdown_is_rendered() {
        let summary = "## Key Points\n\n- **First** idea\n- Second idea\n\n| Who | What |\n|-----|------|\n| A | B |\n\n<script>x</script>";
        let html = render_markdown(summary);

        assert!(html.contains("<h2>Key Points</h2>"));
        assert!(html.contains("<li><strong>First</strong> idea</li>"));
        assert!(html.contains("<table>"));
        assert!(html.contains("<td>B</td>"));
        assert!(!html.contains("<script>"));
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("**"));
    }

    #[test]
    fn test_outcomes_map_errors_by_index() {
        let destinations = vec!["a@example.com".to_string(), "b@example.com".to_string()];
        let response: BatchResponse =
            serde_json::from_str(r#"{"data":[{"id":"1"}],"errors":[{"index":1,"message":"bad address"}]}"#)
                .unwrap();

        let outcomes = outcomes(&destinations, response);
        assert_eq!(outcomes[0], DeliveryOutcome::delivered("a@example.com"));
        assert_eq!(outcomes[1], DeliveryOutcome::failed("b@example.com", "bad address"));
    }

    #[test]
    fn test_failure_report_lists_stage() {
        let failures = vec![FailedEpisode {
            episode_id: 1,
            feed_slug: "show".to_string(),
            guid: "g".to_string(),
            title: "Ep".to_string(),
            error_message: "Failed to transcribe audio".to_string(),
            failed_stage: FailedStage::Transform,
            audio_path: None,
            failed_at: Utc::now(),
        }];
        let html = render_failures_html(&failures);
        assert!(html.contains("<td>transform</td>"));
        assert!(render_failures_text(&failures).contains("Stage: transform"));
    }
}

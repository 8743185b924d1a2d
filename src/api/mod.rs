//! HTTP collaborator endpoints.
//!
//! Two one-shot calls live here: the multipart transcription upload and the
//! fire-and-forget prompt initialization sent once per authenticated session.
//! Every call is independent; a slow or failed request never blocks the next
//! cycle.

use anyhow::{Context, Result};
use reqwest::multipart;
use serde::Deserialize;
use std::time::Duration;

/// Outcome of one transcription upload.
#[derive(Debug, PartialEq, Eq)]
pub enum TranscribeOutcome {
    /// Trimmed, non-empty transcript text.
    Text(String),
    /// 2xx response with nothing usable in it.
    Empty,
    /// 401; the credential must be invalidated by the caller.
    Unauthorized,
}

#[derive(Deserialize)]
struct TranscribeResponse {
    #[serde(default)]
    text: String,
}

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { http, base_url })
    }

    /// Upload one WAV audio segment for transcription.
    ///
    /// Non-2xx responses other than 401 are soft failures surfaced as errors;
    /// the caller logs and moves on to the next segment.
    pub async fn transcribe(&self, token: &str, wav: Vec<u8>) -> Result<TranscribeOutcome> {
        let part = multipart::Part::bytes(wav)
            .file_name("segment.wav")
            .mime_str("audio/wav")
            .context("Invalid multipart mime")?;
        let form = multipart::Form::new().part("audio", part);

        let response = self
            .http
            .post(format!("{}/transcribe", self.base_url))
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await
            .context("Transcription request failed")?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Ok(TranscribeOutcome::Unauthorized);
        }
        if !response.status().is_success() {
            anyhow::bail!("Transcription endpoint returned {}", response.status());
        }

        let body: TranscribeResponse = response
            .json()
            .await
            .context("Malformed transcription response")?;
        let text = body.text.trim();
        if text.is_empty() {
            Ok(TranscribeOutcome::Empty)
        } else {
            Ok(TranscribeOutcome::Text(text.to_string()))
        }
    }

    /// Seed the server-side prompt once per authenticated session start.
    /// Failures are non-fatal; the caller logs and continues.
    pub async fn init_prompt(&self, token: &str) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/prompt/init", self.base_url))
            .bearer_auth(token)
            .send()
            .await
            .context("Prompt init request failed")?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            anyhow::bail!("Prompt init unauthorized");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_text_is_trimmed() {
        let body: TranscribeResponse = serde_json::from_str(r#"{"text": "  hello there  "}"#).unwrap();
        assert_eq!(body.text.trim(), "hello there");
    }

    #[test]
    fn missing_text_field_reads_as_empty() {
        let body: TranscribeResponse = serde_json::from_str("{}").unwrap();
        assert!(body.text.is_empty());
    }
}

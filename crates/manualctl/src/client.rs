//! HTTP client for manuald.

use anyhow::{anyhow, Context, Result};
use manual_shared::api::{
    AskRequest, FeedbackRequest, FeedbackResponse, HealthResponse, HistoryResponse,
    SessionResponse,
};
use manual_shared::error::ErrorBody;
use manual_shared::{RestrictionStatus, StreamEvent, USER_HEADER};
use reqwest::Response;
use serde::de::DeserializeOwned;
use std::time::Duration;

pub struct ManualClient {
    http: reqwest::Client,
    base: String,
    user: String,
}

impl ManualClient {
    pub fn new(base: &str, user: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            user: user.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Turn a non-2xx response into an error carrying the daemon's message.
    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => Err(anyhow!("{} ({})", body.message, body.code)),
            Err(_) => Err(anyhow!("HTTP {}: {}", status, text.trim())),
        }
    }

    async fn json<T: DeserializeOwned>(response: Response) -> Result<T> {
        Ok(Self::check(response).await?.json::<T>().await?)
    }

    /// Submit a question. The returned response streams NDJSON events.
    pub async fn ask(
        &self,
        product: &str,
        question: &str,
        session_id: Option<String>,
    ) -> Result<Response> {
        let response = self
            .http
            .post(self.url(&format!("/v1/products/{}/questions", product)))
            .header(USER_HEADER, &self.user)
            .json(&AskRequest {
                question: question.to_string(),
                session_id,
            })
            .send()
            .await
            .with_context(|| format!("Cannot reach manuald at {}", self.base))?;
        Self::check(response).await
    }

    pub async fn feedback(&self, product: &str, req: &FeedbackRequest) -> Result<FeedbackResponse> {
        let response = self
            .http
            .post(self.url(&format!("/v1/products/{}/feedback", product)))
            .header(USER_HEADER, &self.user)
            .json(req)
            .send()
            .await?;
        Self::json(response).await
    }

    pub async fn reset(&self, product: &str) -> Result<SessionResponse> {
        let response = self
            .http
            .post(self.url(&format!("/v1/products/{}/sessions", product)))
            .header(USER_HEADER, &self.user)
            .send()
            .await?;
        Self::json(response).await
    }

    pub async fn history(&self, session_id: &str, limit: Option<usize>) -> Result<HistoryResponse> {
        let mut request = self
            .http
            .get(self.url(&format!("/v1/sessions/{}/messages", session_id)))
            .header(USER_HEADER, &self.user);
        if let Some(limit) = limit {
            request = request.query(&[("limit", limit)]);
        }
        Self::json(request.send().await?).await
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        let response = self
            .http
            .get(self.url("/v1/health"))
            .send()
            .await
            .with_context(|| format!("Cannot reach manuald at {}", self.base))?;
        Self::json(response).await
    }

    pub async fn restriction(&self) -> Result<RestrictionStatus> {
        let response = self
            .http
            .get(self.url("/v1/restriction"))
            .header(USER_HEADER, &self.user)
            .send()
            .await?;
        Self::json(response).await
    }
}

/// Splits a chunked NDJSON body into events. Chunks may end mid-line.
#[derive(Default)]
pub struct EventDecoder {
    pending: Vec<u8>,
}

impl EventDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<StreamEvent>> {
        self.pending.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            events.push(serde_json::from_str(line).context("malformed event line")?);
        }
        Ok(events)
    }

    /// True if bytes are left over after the stream ended.
    pub fn has_partial(&self) -> bool {
        self.pending.iter().any(|b| !b.is_ascii_whitespace())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manual_shared::{EventKind, Step};

    #[test]
    fn test_decoder_handles_split_lines() {
        let mut decoder = EventDecoder::default();
        let first = StreamEvent::step_start(Step::QaSnapshot).to_line();
        let second = StreamEvent::step_timeout(Step::QaSnapshot).to_line();
        let joined = format!("{}{}", first, second);
        let (a, b) = joined.as_bytes().split_at(first.len() + 5);

        let events = decoder.push(a).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), Some(EventKind::StepStart));
        assert!(decoder.has_partial());

        let events = decoder.push(b).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), Some(EventKind::StepTimeout));
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_decoder_rejects_garbage() {
        let mut decoder = EventDecoder::default();
        assert!(decoder.push(b"not json\n").is_err());
    }
}

//! Observability sink implementations.

use super::{FeedbackSignal, ObservabilitySink, RunCorrelation};
use crate::config::FeedbackSettings;
use crate::error::{ReferatError, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, instrument};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Logs feedback and knows no runs. Used when no backend is configured.
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

#[async_trait]
impl ObservabilitySink for TracingSink {
    async fn has_run(&self, _token: &str) -> Result<bool> {
        Ok(false)
    }

    async fn find_run(&self, _correlation: &RunCorrelation) -> Result<Option<String>> {
        Ok(None)
    }

    async fn submit(&self, run_id: &str, feedback: &FeedbackSignal) -> Result<()> {
        info!(
            run = %run_id,
            score = feedback.rating.score(),
            comment = feedback.comment.as_deref().unwrap_or(""),
            "User feedback"
        );
        Ok(())
    }
}

/// Feedback backend reached over HTTP.
pub struct HttpFeedbackSink {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    project: String,
}

#[derive(Debug, Deserialize)]
struct RunQueryResponse {
    #[serde(default)]
    runs: Vec<RunSummary>,
}

#[derive(Debug, Deserialize)]
struct RunSummary {
    id: String,
}

impl HttpFeedbackSink {
    pub fn new(endpoint: &str, api_key: Option<String>, project: &str) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
            project: project.to_string(),
        })
    }

    /// `None` when no endpoint is configured.
    pub fn from_settings(settings: &FeedbackSettings) -> Result<Option<Self>> {
        let Some(endpoint) = settings.endpoint.as_deref().filter(|e| !e.trim().is_empty()) else {
            return Ok(None);
        };
        url::Url::parse(endpoint)
            .map_err(|e| ReferatError::Config(format!("Invalid feedback endpoint '{}': {}", endpoint, e)))?;
        let api_key = std::env::var(&settings.api_key_env).ok().filter(|k| !k.is_empty());
        Ok(Some(Self::new(endpoint, api_key, &settings.project)?))
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("x-api-key", key),
            None => builder,
        }
    }
}

#[async_trait]
impl ObservabilitySink for HttpFeedbackSink {
    #[instrument(skip(self))]
    async fn has_run(&self, token: &str) -> Result<bool> {
        let url = format!("{}/runs/{}", self.endpoint, token);
        let response = self.request(self.http.get(&url)).send().await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => Ok(false),
            status => Err(ReferatError::Feedback(format!("run lookup returned {}", status))),
        }
    }

    #[instrument(skip(self, correlation), fields(token = %correlation.token))]
    async fn find_run(&self, correlation: &RunCorrelation) -> Result<Option<String>> {
        let url = format!("{}/runs/query", self.endpoint);
        let body = json!({
            "project": self.project,
            "filter": {
                "session_id": correlation.session_id,
                "turn_index": correlation.turn_index,
                "token": correlation.token,
            },
            "limit": 1,
        });
        let response = self.request(self.http.post(&url)).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(ReferatError::Feedback(format!(
                "run query returned {}",
                response.status()
            )));
        }
        let parsed: RunQueryResponse = response.json().await?;
        debug!("Run query matched {} run(s)", parsed.runs.len());
        Ok(parsed.runs.into_iter().next().map(|r| r.id))
    }

    #[instrument(skip(self, feedback))]
    async fn submit(&self, run_id: &str, feedback: &FeedbackSignal) -> Result<()> {
        let url = format!("{}/feedback", self.endpoint);
        let body = json!({
            "run_id": run_id,
            "key": "user_score",
            "score": feedback.rating.score(),
            "comment": feedback.comment,
        });
        let response = self.request(self.http.post(&url)).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(ReferatError::Feedback(format!(
                "feedback submission returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedback::Rating;

    #[test]
    fn test_no_endpoint_means_no_http_sink() {
        let settings = FeedbackSettings::default();
        assert!(HttpFeedbackSink::from_settings(&settings).unwrap().is_none());

        let bad = FeedbackSettings {
            endpoint: Some("not a url".into()),
            ..FeedbackSettings::default()
        };
        assert!(HttpFeedbackSink::from_settings(&bad).is_err());
    }

    #[test]
    fn test_tracing_sink_never_finds_runs() {
        let sink = TracingSink;
        assert!(!tokio_test::block_on(sink.has_run("s-turn-0000")).unwrap());
        let correlation = RunCorrelation {
            session_id: "s".into(),
            turn_index: 0,
            token: "s-turn-0000".into(),
            project: "p".into(),
        };
        assert!(tokio_test::block_on(sink.find_run(&correlation)).unwrap().is_none());
        tokio_test::assert_ok!(tokio_test::block_on(
            sink.submit("s-turn-0000", &FeedbackSignal::new(Rating::Positive, None))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_an_error() {
        let sink = HttpFeedbackSink::new("http://127.0.0.1:9", None, "p").unwrap();
        let err = sink
            .submit("run-1", &FeedbackSignal::new(Rating::Positive, None))
            .await
            .unwrap_err();
        assert!(matches!(err, ReferatError::Http(_)));
    }
}

use std::time::Duration;
use async_trait::async_trait;
use log::debug;
use serde::Serialize;
use thiserror::Error;

use crate::report::PipelineReport;

#[derive(Error, Debug)]
pub enum Error {
    #[error("reqwest: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("webhook responded with code {0}, body: {1}")]
    Status(u16, String),
}

/// Receives the final report of every pipeline run.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, report: &PipelineReport) -> Result<(), Error>;
}

/// Slack-compatible webhook body: a summary line plus the full report.
#[derive(Serialize)]
struct WebhookPayload<'a> {
    text: String,
    report: &'a PipelineReport,
}

impl<'a> WebhookPayload<'a> {
    fn new(report: &'a PipelineReport) -> Self {
        let text = match (report.failed_stage(), &report.error) {
            (Some(failed), _) => format!(
                "{} pipeline for {} failed in {} stage: {}",
                report.app_name, report.environment, failed.stage_name, failed.message
            ),
            (None, Some(error)) => format!(
                "{} pipeline for {} failed: {error}",
                report.app_name, report.environment
            ),
            (None, None) if report.is_success() => format!(
                "{} deployed to {}: {}",
                report.app_name,
                report.environment,
                report.image.as_deref().unwrap_or("unknown image")
            ),
            (None, None) => format!("{} pipeline for {} failed", report.app_name, report.environment),
        };
        Self { text, report }
    }
}

/// Posts reports as JSON to an HTTP endpoint.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, Error> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, report: &PipelineReport) -> Result<(), Error> {
        debug!("Posting pipeline report to webhook");
        let resp = self
            .client
            .post(&self.url)
            .json(&WebhookPayload::new(report))
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(Error::Status(status.as_u16(), body))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{PipelineStatus, Stage, StageResult};
    use chrono::Utc;

    fn report(stages: Vec<StageResult>, status: PipelineStatus) -> PipelineReport {
        PipelineReport {
            app_name: "java-service".into(),
            environment: "staging".into(),
            status,
            stages,
            image: Some("registry.example.com/java-service:staging-abc".into()),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            error: None,
        }
    }

    #[test]
    fn summary_for_success() {
        let report = report(
            vec![StageResult::success(Stage::Build, "built", 1)],
            PipelineStatus::Success,
        );
        let payload = serde_json::to_value(WebhookPayload::new(&report)).unwrap();
        assert_eq!(
            payload["text"],
            "java-service deployed to staging: registry.example.com/java-service:staging-abc"
        );
        assert_eq!(payload["report"]["appName"], "java-service");
    }

    #[test]
    fn summary_names_failed_stage() {
        let report = report(
            vec![
                StageResult::success(Stage::Build, "built", 1),
                StageResult::failure(Stage::Publish, "registry authentication failed", 1),
                StageResult::not_attempted(Stage::Deploy),
            ],
            PipelineStatus::Failure,
        );
        let payload = WebhookPayload::new(&report);
        assert_eq!(
            payload.text,
            "java-service pipeline for staging failed in publish stage: registry authentication failed"
        );
    }

    #[test]
    fn summary_for_aborted_run() {
        let report = PipelineReport::aborted("java-service", "staging", "pipeline task panicked");
        let payload = WebhookPayload::new(&report);
        assert_eq!(payload.text, "java-service pipeline for staging failed: pipeline task panicked");
    }
}

use std::fmt::{Display, Formatter};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Build,
    Publish,
    Deploy,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Build, Stage::Publish, Stage::Deploy];
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Stage::Build => "build",
            Stage::Publish => "publish",
            Stage::Deploy => "deploy",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    Failure,
    NotAttempted,
}

impl Display for StageStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            StageStatus::Success => "success",
            StageStatus::Failure => "failure",
            StageStatus::NotAttempted => "not attempted",
        })
    }
}

/// Outcome of one pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResult {
    pub stage_name: Stage,
    pub status: StageStatus,
    pub message: String,
    pub duration_ms: u64,
}

impl StageResult {
    pub fn success(stage: Stage, message: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            stage_name: stage,
            status: StageStatus::Success,
            message: message.into(),
            duration_ms,
        }
    }

    pub fn failure(stage: Stage, message: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            stage_name: stage,
            status: StageStatus::Failure,
            message: message.into(),
            duration_ms,
        }
    }

    pub fn not_attempted(stage: Stage) -> Self {
        Self {
            stage_name: stage,
            status: StageStatus::NotAttempted,
            message: "not attempted".to_string(),
            duration_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Success,
    Failure,
}

/// Final result of a pipeline run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineReport {
    pub app_name: String,
    pub environment: String,
    pub status: PipelineStatus,
    pub stages: Vec<StageResult>,
    /// Image reference, once the build stage succeeded.
    pub image: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Why the run ended without reaching any stage outcome, e.g. a panicked task.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PipelineReport {
    /// A failed report for a run that died before recording its stages.
    pub fn aborted(app_name: &str, environment: &str, error: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            app_name: app_name.to_string(),
            environment: environment.to_string(),
            status: PipelineStatus::Failure,
            stages: Stage::ALL.into_iter().map(StageResult::not_attempted).collect(),
            image: None,
            started_at: now,
            finished_at: now,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == PipelineStatus::Success
    }

    /// Process exit code: 0 on success, 1 if any stage failed.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            PipelineStatus::Success => 0,
            PipelineStatus::Failure => 1,
        }
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageResult> {
        self.stages.iter().find(|result| result.stage_name == stage)
    }

    /// The stage that caused the pipeline to fail, if any.
    pub fn failed_stage(&self) -> Option<&StageResult> {
        self.stages
            .iter()
            .find(|result| result.status == StageStatus::Failure)
    }
}

impl Display for PipelineReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let status = match self.status {
            PipelineStatus::Success => "succeeded",
            PipelineStatus::Failure => "failed",
        };
        writeln!(f, "pipeline {}/{} {status}", self.app_name, self.environment)?;
        if let Some(error) = &self.error {
            writeln!(f, "  error: {error}")?;
        }
        for result in &self.stages {
            write!(f, "  {:<8} {:<14}", result.stage_name.to_string(), result.status.to_string())?;
            if result.status != StageStatus::NotAttempted {
                write!(f, " {:>7}ms  {}", result.duration_ms, result.message)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

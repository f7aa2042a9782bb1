use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use chrono::Utc;
use log::{error, info, warn};
use thiserror::Error;

use crate::build::{BuildArtifact, ImageBuilder};
use crate::config::runtime::PipelineConfig;
use crate::deploy::DeploymentDriver;
use crate::notify::Notifier;
use crate::publish::RegistryPublisher;
use crate::report::{PipelineReport, PipelineStatus, Stage, StageResult, StageStatus};

#[derive(Error, Debug)]
pub enum Error {
    #[error("pipeline for {app}/{environment} declared more than once")]
    DuplicatePipeline {
        app: String,
        environment: String,
    },
}

/// Orchestrator states. `Failed` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    Build,
    Publish,
    Deploy,
    Done,
    Failed,
}

impl State {
    /// The stage executed while in this state.
    pub fn stage(self) -> Option<Stage> {
        match self {
            State::Build => Some(Stage::Build),
            State::Publish => Some(Stage::Publish),
            State::Deploy => Some(Stage::Deploy),
            State::Init | State::Done | State::Failed => None,
        }
    }

    /// Transition after the current stage finished.
    pub fn next(self, stage_succeeded: bool) -> State {
        if !stage_succeeded {
            return State::Failed;
        }
        match self {
            State::Init => State::Build,
            State::Build => State::Publish,
            State::Publish => State::Deploy,
            State::Deploy | State::Done => State::Done,
            State::Failed => State::Failed,
        }
    }
}

/// Sequences build, publish and deploy for one application environment.
pub struct Pipeline {
    builder: Box<dyn ImageBuilder>,
    publisher: Box<dyn RegistryPublisher>,
    driver: Box<dyn DeploymentDriver>,
    notifier: Option<Box<dyn Notifier>>,
}

impl Pipeline {
    pub fn new(
        builder: Box<dyn ImageBuilder>,
        publisher: Box<dyn RegistryPublisher>,
        driver: Box<dyn DeploymentDriver>,
    ) -> Self {
        Self {
            builder,
            publisher,
            driver,
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Run every stage in order. Stage failures are recorded in the report, never returned.
    pub async fn run(&self, config: &PipelineConfig) -> PipelineReport {
        let started_at = Utc::now();
        let name = format!("{}/{}", config.app_name, config.environment);
        let mut state = State::Init.next(true);
        let mut stages = Vec::with_capacity(Stage::ALL.len());
        let mut artifact: Option<BuildArtifact> = None;

        while let Some(stage) = state.stage() {
            info!("[{name}] {stage} started");
            let start = Instant::now();
            let outcome = self.run_stage(stage, config, &mut artifact).await;
            let duration_ms = start.elapsed().as_millis() as u64;

            let result = match outcome {
                Ok(message) => {
                    info!("[{name}] {stage} succeeded in {duration_ms}ms: {message}");
                    StageResult::success(stage, message, duration_ms)
                }
                Err(message) => {
                    error!("[{name}] {stage} failed after {duration_ms}ms: {message}");
                    StageResult::failure(stage, message, duration_ms)
                }
            };
            state = state.next(result.status == StageStatus::Success);
            stages.push(result);
        }

        for stage in Stage::ALL.into_iter().skip(stages.len()) {
            stages.push(StageResult::not_attempted(stage));
        }

        let report = PipelineReport {
            app_name: config.app_name.clone(),
            environment: config.environment.clone(),
            status: if state == State::Done {
                PipelineStatus::Success
            } else {
                PipelineStatus::Failure
            },
            stages,
            image: artifact.map(|artifact| artifact.image),
            started_at,
            finished_at: Utc::now(),
            error: None,
        };

        if let Some(notifier) = &self.notifier {
            if let Err(err) = notifier.notify(&report).await {
                warn!("[{name}] notification failed: {err}");
            }
        }
        report
    }

    async fn run_stage(
        &self,
        stage: Stage,
        config: &PipelineConfig,
        artifact: &mut Option<BuildArtifact>,
    ) -> Result<String, String> {
        if stage == Stage::Build {
            let built = self.builder.build(config).await.map_err(|err| err.to_string())?;
            let message = format!("built {} ({}, {} bytes)", built.image, built.digest, built.size_bytes);
            *artifact = Some(built);
            return Ok(message);
        }

        let Some(built) = artifact.as_ref() else {
            return Err(format!("{stage} requires a build artifact"));
        };
        if stage == Stage::Publish {
            self.publisher
                .publish(built, &config.registry_url)
                .await
                .map(|_| format!("pushed {}", built.image))
                .map_err(|err| err.to_string())
        } else {
            self.driver
                .deploy(built, config)
                .await
                .map(|_| format!("rolled out {} on {}", built.image, config.cluster_name))
                .map_err(|err| err.to_string())
        }
    }
}

/// Run pipelines for distinct (app, environment) pairs concurrently.
///
/// Reports are returned in input order, one per pipeline. A pipeline whose task panics
/// gets an aborted report. Duplicate pairs are rejected before anything starts.
pub async fn run_many(
    pipelines: Vec<(Arc<Pipeline>, PipelineConfig)>,
) -> Result<Vec<PipelineReport>, Error> {
    let mut seen = HashSet::new();
    for (_, config) in &pipelines {
        if !seen.insert(config.pipeline_key()) {
            return Err(Error::DuplicatePipeline {
                app: config.app_name.clone(),
                environment: config.environment.clone(),
            });
        }
    }

    let tasks: Vec<_> = pipelines
        .into_iter()
        .map(|(pipeline, config)| {
            let key = (config.app_name.clone(), config.environment.clone());
            (key, tokio::spawn(async move { pipeline.run(&config).await }))
        })
        .collect();

    let mut reports = Vec::with_capacity(tasks.len());
    for ((app, environment), task) in tasks {
        let report = match task.await {
            Ok(report) => report,
            Err(err) => {
                error!("[{app}/{environment}] pipeline task aborted: {err}");
                PipelineReport::aborted(&app, &environment, format!("pipeline task aborted: {err}"))
            }
        };
        reports.push(report);
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::runtime::{resolve, RawConfig};
    use crate::deploy::{self, ClusterClient, DeployTarget, RolloutDriver, RolloutStatus};
    use crate::{build, config, notify, publish};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Calls {
        build: AtomicU32,
        publish: AtomicU32,
        deploy: AtomicU32,
    }

    struct FakeBuilder {
        calls: Arc<Calls>,
        fail: bool,
    }

    #[async_trait]
    impl ImageBuilder for FakeBuilder {
        async fn build(&self, config: &PipelineConfig) -> Result<BuildArtifact, build::Error> {
            self.calls.build.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(build::Error::DockerfileNotFound(PathBuf::from("Dockerfile")));
            }
            Ok(BuildArtifact {
                image: format!("{}:{}-0123456789ab", config.image_repository(), config.environment),
                image_tag: format!("{}-0123456789ab", config.environment),
                digest: "sha256:9f86d081884c7d65".into(),
                size_bytes: 123_456,
            })
        }
    }

    struct FakePublisher {
        calls: Arc<Calls>,
        fail: bool,
    }

    #[async_trait]
    impl RegistryPublisher for FakePublisher {
        async fn publish(&self, _artifact: &BuildArtifact, _registry: &str) -> Result<(), publish::Error> {
            self.calls.publish.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(publish::Error::Auth("denied: not authorized".into()));
            }
            Ok(())
        }
    }

    struct FakeDriver {
        calls: Arc<Calls>,
    }

    #[async_trait]
    impl DeploymentDriver for FakeDriver {
        async fn deploy(&self, _artifact: &BuildArtifact, _config: &PipelineConfig) -> Result<(), deploy::Error> {
            self.calls.deploy.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Cluster whose rollout never finishes.
    struct StuckCluster;

    #[async_trait]
    impl ClusterClient for StuckCluster {
        async fn connect(&self, _target: &DeployTarget) -> Result<(), deploy::Error> {
            Ok(())
        }

        async fn set_image(&self, _target: &DeployTarget, _image: &str) -> Result<(), deploy::Error> {
            Ok(())
        }

        async fn rollout_status(&self, _target: &DeployTarget) -> Result<RolloutStatus, deploy::Error> {
            Ok(RolloutStatus::Progressing("1 of 2 updated replicas are available".into()))
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        reports: Arc<Mutex<Vec<PipelineStatus>>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, report: &PipelineReport) -> Result<(), notify::Error> {
            self.reports.lock().unwrap().push(report.status);
            Ok(())
        }
    }

    struct FailingNotifier;

    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn notify(&self, _report: &PipelineReport) -> Result<(), notify::Error> {
            Err(notify::Error::Status(500, "internal error".into()))
        }
    }

    /// Builder that panics, taking its pipeline task down with it.
    struct PanickingBuilder;

    #[async_trait]
    impl ImageBuilder for PanickingBuilder {
        async fn build(&self, _config: &PipelineConfig) -> Result<BuildArtifact, build::Error> {
            panic!("builder crashed");
        }
    }

    fn declaration(app: &str, environment: &str) -> RawConfig {
        [
            ("appName", app),
            ("environment", environment),
            ("ecrRegistry", "123456789012.dkr.ecr.us-east-1.amazonaws.com"),
            ("clusterName", "staging-eks-cluster"),
            ("awsRegion", "us-east-1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn pipeline(calls: &Arc<Calls>, fail_build: bool, fail_publish: bool) -> Pipeline {
        Pipeline::new(
            Box::new(FakeBuilder { calls: calls.clone(), fail: fail_build }),
            Box::new(FakePublisher { calls: calls.clone(), fail: fail_publish }),
            Box::new(FakeDriver { calls: calls.clone() }),
        )
    }

    fn statuses(report: &PipelineReport) -> Vec<StageStatus> {
        report.stages.iter().map(|stage| stage.status).collect()
    }

    #[test]
    fn state_machine_transitions() {
        assert_eq!(State::Init.next(true), State::Build);
        assert_eq!(State::Build.next(true), State::Publish);
        assert_eq!(State::Publish.next(true), State::Deploy);
        assert_eq!(State::Deploy.next(true), State::Done);
        for state in [State::Build, State::Publish, State::Deploy] {
            assert_eq!(state.next(false), State::Failed);
        }
        assert_eq!(State::Failed.next(true), State::Failed);
        assert_eq!(State::Done.stage(), None);
        assert_eq!(State::Failed.stage(), None);
    }

    #[tokio::test]
    async fn java_service_end_to_end() {
        let config = resolve(&declaration("java-service", "staging")).unwrap();
        assert_eq!(config.dockerfile_path, "Dockerfile");

        let calls = Arc::new(Calls::default());
        let notifier = RecordingNotifier::default();
        let notified = notifier.reports.clone();
        let report = pipeline(&calls, false, false)
            .with_notifier(Box::new(notifier))
            .run(&config)
            .await;

        assert!(report.is_success());
        assert_eq!(report.exit_code(), 0);
        assert_eq!(statuses(&report), vec![StageStatus::Success; 3]);
        assert_eq!(
            report.image.as_deref(),
            Some("123456789012.dkr.ecr.us-east-1.amazonaws.com/java-service:staging-0123456789ab")
        );
        assert_eq!(calls.deploy.load(Ordering::SeqCst), 1);
        assert_eq!(*notified.lock().unwrap(), vec![PipelineStatus::Success]);
    }

    #[tokio::test]
    async fn build_failure_skips_publish_and_deploy() {
        let config = resolve(&declaration("java-service", "staging")).unwrap();
        let calls = Arc::new(Calls::default());
        let report = pipeline(&calls, true, false).run(&config).await;

        assert_eq!(report.exit_code(), 1);
        assert_eq!(
            statuses(&report),
            vec![StageStatus::Failure, StageStatus::NotAttempted, StageStatus::NotAttempted]
        );
        assert!(report.stages[0].message.starts_with("dockerfile not found"));
        assert_eq!(report.stages[1].message, "not attempted");
        assert_eq!(calls.publish.load(Ordering::SeqCst), 0);
        assert_eq!(calls.deploy.load(Ordering::SeqCst), 0);
        assert_eq!(report.image, None);
    }

    #[tokio::test]
    async fn publish_failure_skips_deploy() {
        let config = resolve(&declaration("java-service", "staging")).unwrap();
        let calls = Arc::new(Calls::default());
        let report = pipeline(&calls, false, true).run(&config).await;

        assert_eq!(
            statuses(&report),
            vec![StageStatus::Success, StageStatus::Failure, StageStatus::NotAttempted]
        );
        assert_eq!(report.failed_stage().map(|s| s.stage_name), Some(Stage::Publish));
        assert_eq!(calls.deploy.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rollout_timeout_fails_pipeline() {
        let config = resolve(&declaration("java-service", "staging")).unwrap();
        let calls = Arc::new(Calls::default());
        let driver = RolloutDriver::new(StuckCluster, &config::file::Deploy::default())
            .with_timing(Duration::from_millis(30), Duration::from_millis(5));
        let report = Pipeline::new(
            Box::new(FakeBuilder { calls: calls.clone(), fail: false }),
            Box::new(FakePublisher { calls: calls.clone(), fail: false }),
            Box::new(driver),
        )
        .run(&config)
        .await;

        assert_eq!(report.status, PipelineStatus::Failure);
        assert_ne!(report.exit_code(), 0);
        let deploy = report.stage(Stage::Deploy).unwrap();
        assert_eq!(deploy.status, StageStatus::Failure);
        assert!(deploy.message.starts_with("timeout"));
    }

    #[tokio::test]
    async fn concurrent_pipelines_report_in_order() {
        let calls = Arc::new(Calls::default());
        let shared = Arc::new(pipeline(&calls, false, false));
        let pipelines = vec![
            (shared.clone(), resolve(&declaration("java-service", "staging")).unwrap()),
            (shared.clone(), resolve(&declaration("java-service", "production")).unwrap()),
            (shared, resolve(&declaration("billing", "staging")).unwrap()),
        ];

        let reports = run_many(pipelines).await.unwrap();
        let names: Vec<_> = reports
            .iter()
            .map(|r| format!("{}/{}", r.app_name, r.environment))
            .collect();
        assert_eq!(names, vec!["java-service/staging", "java-service/production", "billing/staging"]);
        assert!(reports.iter().all(PipelineReport::is_success));
        assert_eq!(calls.build.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn duplicate_pipelines_are_rejected() {
        let calls = Arc::new(Calls::default());
        let shared = Arc::new(pipeline(&calls, false, false));
        let config = resolve(&declaration("java-service", "staging")).unwrap();
        let result = run_many(vec![(shared.clone(), config.clone()), (shared, config)]).await;

        assert!(matches!(result, Err(Error::DuplicatePipeline { .. })));
        assert_eq!(calls.build.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn notification_failure_keeps_outcome() {
        let config = resolve(&declaration("java-service", "staging")).unwrap();
        let calls = Arc::new(Calls::default());
        let report = pipeline(&calls, false, false)
            .with_notifier(Box::new(FailingNotifier))
            .run(&config)
            .await;

        assert!(report.is_success());
        assert_eq!(report.exit_code(), 0);
        assert_eq!(statuses(&report), vec![StageStatus::Success; 3]);
    }

    #[tokio::test]
    async fn panicked_pipeline_still_gets_a_report() {
        let calls = Arc::new(Calls::default());
        let crashing = Arc::new(Pipeline::new(
            Box::new(PanickingBuilder),
            Box::new(FakePublisher { calls: calls.clone(), fail: false }),
            Box::new(FakeDriver { calls: calls.clone() }),
        ));
        let healthy = Arc::new(pipeline(&calls, false, false));
        let pipelines = vec![
            (crashing, resolve(&declaration("java-service", "staging")).unwrap()),
            (healthy, resolve(&declaration("billing", "staging")).unwrap()),
        ];

        let reports = run_many(pipelines).await.unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].app_name, "java-service");
        assert_eq!(reports[0].status, PipelineStatus::Failure);
        assert!(reports[0].error.as_deref().unwrap().contains("aborted"));
        assert_eq!(statuses(&reports[0]), vec![StageStatus::NotAttempted; 3]);
        assert_eq!(reports[1].app_name, "billing");
        assert!(reports[1].is_success());
        assert_eq!(calls.publish.load(Ordering::SeqCst), 1);
    }
}

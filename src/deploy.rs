use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;
use async_trait::async_trait;
use log::{debug, info};
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;

use crate::build::BuildArtifact;
use crate::config::file;
use crate::config::runtime::PipelineConfig;
use crate::docker;

#[derive(Error, Debug)]
pub enum Error {
    #[error("timeout: rollout of deployment/{deployment} did not complete within {}s", .timeout.as_secs_f64())]
    Timeout {
        deployment: String,
        timeout: Duration,
    },

    #[error("rollout failed: {0}")]
    RolloutFailed(String),

    #[error("{command} exited with code {status}: {output}")]
    Command {
        command: &'static str,
        status: ExitStatus,
        output: String,
    },

    #[error("parse deployment status: {0}")]
    Status(#[from] serde_json::Error),

    #[error("cluster client scratch directory: {0}")]
    IOError(#[from] std::io::Error),
}

/// Where a pipeline's image is rolled out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployTarget {
    pub cluster: String,
    pub region: String,
    pub namespace: String,
    pub deployment: String,
    pub container: String,
}

/// State of a rollout as reported by the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutStatus {
    Progressing(String),
    Succeeded,
    Failed(String),
}

/// Access to a cluster control plane.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Obtain credentials for the target cluster.
    async fn connect(&self, target: &DeployTarget) -> Result<(), Error>;
    async fn set_image(&self, target: &DeployTarget, image: &str) -> Result<(), Error>;
    async fn rollout_status(&self, target: &DeployTarget) -> Result<RolloutStatus, Error>;
}

/// Rolls a built image out to a pipeline's cluster.
#[async_trait]
pub trait DeploymentDriver: Send + Sync {
    async fn deploy(&self, artifact: &BuildArtifact, config: &PipelineConfig) -> Result<(), Error>;
}

/// Applies the new image, then polls the rollout until it is terminal or the timeout passes.
pub struct RolloutDriver<C> {
    client: C,
    timeout: Duration,
    poll_interval: Duration,
    namespace: Option<String>,
    container: Option<String>,
}

impl<C: ClusterClient> RolloutDriver<C> {
    pub fn new(client: C, settings: &file::Deploy) -> Self {
        Self {
            client,
            timeout: settings.rollout_timeout(),
            poll_interval: settings.poll_interval(),
            namespace: settings.namespace.clone(),
            container: settings.container.clone(),
        }
    }

    pub fn with_timing(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.timeout = timeout;
        self.poll_interval = poll_interval;
        self
    }

    pub fn target(&self, config: &PipelineConfig) -> DeployTarget {
        DeployTarget {
            cluster: config.cluster_name.clone(),
            region: config.region.clone(),
            namespace: self.namespace.clone().unwrap_or_else(|| config.environment.clone()),
            deployment: config.app_name.clone(),
            container: self.container.clone().unwrap_or_else(|| config.app_name.clone()),
        }
    }

    async fn wait_for_rollout(&self, target: &DeployTarget) -> Result<(), Error> {
        loop {
            match self.client.rollout_status(target).await? {
                RolloutStatus::Succeeded => return Ok(()),
                RolloutStatus::Failed(reason) => return Err(Error::RolloutFailed(reason)),
                RolloutStatus::Progressing(message) => {
                    debug!("deployment/{}: {message}", target.deployment);
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }
}

#[async_trait]
impl<C: ClusterClient> DeploymentDriver for RolloutDriver<C> {
    async fn deploy(&self, artifact: &BuildArtifact, config: &PipelineConfig) -> Result<(), Error> {
        let target = self.target(config);
        self.client.connect(&target).await?;

        info!(
            "Deploying {} to deployment/{} in {}/{}",
            artifact.image, target.deployment, target.cluster, target.namespace
        );
        self.client.set_image(&target, &artifact.image).await?;

        tokio::time::timeout(self.timeout, self.wait_for_rollout(&target))
            .await
            .map_err(|_| Error::Timeout {
                deployment: target.deployment.clone(),
                timeout: self.timeout,
            })?
    }
}

/// EKS access through the `aws` and `kubectl` command line clients.
///
/// Each instance writes its own kubeconfig into a private directory.
pub struct Kubectl {
    scratch: tempfile::TempDir,
}

impl Kubectl {
    pub fn new() -> Result<Self, Error> {
        Ok(Self {
            scratch: tempfile::Builder::new().prefix("bnd-kube-").tempdir()?,
        })
    }

    fn kubeconfig(&self) -> PathBuf {
        self.scratch.path().join("config")
    }

    fn kubectl(&self, target: &DeployTarget) -> Command {
        let mut command = Command::new("kubectl");
        command
            .arg("--kubeconfig")
            .arg(self.kubeconfig())
            .arg("--namespace")
            .arg(&target.namespace)
            .kill_on_drop(true);
        command
    }
}

async fn run(command: &'static str, mut process: Command) -> Result<Vec<u8>, Error> {
    let output = process.output().await?;
    if output.status.success() {
        Ok(output.stdout)
    } else {
        Err(Error::Command {
            command,
            status: output.status,
            output: docker::diagnostics(&output),
        })
    }
}

#[async_trait]
impl ClusterClient for Kubectl {
    async fn connect(&self, target: &DeployTarget) -> Result<(), Error> {
        debug!("Updating kubeconfig for {} in {}", target.cluster, target.region);
        let mut process = Command::new("aws");
        process
            .arg("eks")
            .arg("update-kubeconfig")
            .arg("--name")
            .arg(&target.cluster)
            .arg("--region")
            .arg(&target.region)
            .arg("--kubeconfig")
            .arg(self.kubeconfig())
            .kill_on_drop(true);
        run("aws eks update-kubeconfig", process).await.map(|_| ())
    }

    async fn set_image(&self, target: &DeployTarget, image: &str) -> Result<(), Error> {
        let mut process = self.kubectl(target);
        process
            .arg("set")
            .arg("image")
            .arg(format!("deployment/{}", target.deployment))
            .arg(format!("{}={}", target.container, image));
        run("kubectl set image", process).await.map(|_| ())
    }

    async fn rollout_status(&self, target: &DeployTarget) -> Result<RolloutStatus, Error> {
        let mut process = self.kubectl(target);
        process
            .arg("get")
            .arg(format!("deployment/{}", target.deployment))
            .arg("--output")
            .arg("json");
        let stdout = run("kubectl get deployment", process).await?;
        let deployment: k8s::Deployment = serde_json::from_slice(&stdout)?;
        Ok(deployment.rollout_status())
    }
}

/// The parts of a Kubernetes Deployment object needed to judge a rollout.
mod k8s {
    use super::{Deserialize, RolloutStatus};

    const PROGRESS_DEADLINE_EXCEEDED: &str = "ProgressDeadlineExceeded";

    #[derive(Deserialize, Default)]
    pub struct Metadata {
        #[serde(default)]
        pub name: String,
        #[serde(default)]
        pub generation: i64,
    }

    #[derive(Deserialize, Default)]
    pub struct Spec {
        pub replicas: Option<i64>,
    }

    #[derive(Deserialize, Default)]
    #[serde(rename_all = "camelCase")]
    pub struct Status {
        #[serde(default)]
        pub observed_generation: i64,
        #[serde(default)]
        pub replicas: i64,
        #[serde(default)]
        pub updated_replicas: i64,
        #[serde(default)]
        pub available_replicas: i64,
        #[serde(default)]
        pub conditions: Vec<Condition>,
    }

    #[derive(Deserialize)]
    pub struct Condition {
        #[serde(rename = "type")]
        pub kind: String,
        #[serde(default)]
        pub reason: Option<String>,
        #[serde(default)]
        pub message: Option<String>,
    }

    #[derive(Deserialize)]
    pub struct Deployment {
        #[serde(default)]
        pub metadata: Metadata,
        #[serde(default)]
        pub spec: Spec,
        #[serde(default)]
        pub status: Status,
    }

    impl Deployment {
        /// Same decision procedure as `kubectl rollout status`.
        pub fn rollout_status(&self) -> RolloutStatus {
            let name = &self.metadata.name;
            let status = &self.status;

            if self.metadata.generation > status.observed_generation {
                return RolloutStatus::Progressing(format!(
                    "waiting for deployment {name} spec update to be observed"
                ));
            }

            let deadline_exceeded = status.conditions.iter().find(|condition| {
                condition.kind == "Progressing"
                    && condition.reason.as_deref() == Some(PROGRESS_DEADLINE_EXCEEDED)
            });
            if let Some(condition) = deadline_exceeded {
                let message = condition.message.clone().unwrap_or_default();
                return RolloutStatus::Failed(format!(
                    "deployment {name} exceeded its progress deadline: {message}"
                ));
            }

            let desired = self.spec.replicas.unwrap_or(1);
            if status.updated_replicas < desired {
                return RolloutStatus::Progressing(format!(
                    "{} out of {desired} new replicas have been updated",
                    status.updated_replicas
                ));
            }
            if status.replicas > status.updated_replicas {
                return RolloutStatus::Progressing(format!(
                    "{} old replicas are pending termination",
                    status.replicas - status.updated_replicas
                ));
            }
            if status.available_replicas < status.updated_replicas {
                return RolloutStatus::Progressing(format!(
                    "{} of {} updated replicas are available",
                    status.available_replicas, status.updated_replicas
                ));
            }
            RolloutStatus::Succeeded
        }
    }
}

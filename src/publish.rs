use std::future::Future;
use std::time::Duration;
use async_trait::async_trait;
use log::{debug, info, warn};
use thiserror::Error;

use crate::auth::{self, CredentialProvider, Credentials};
use crate::build::BuildArtifact;
use crate::docker::{self, Docker, PushFailure};

#[derive(Error, Debug)]
pub enum Error {
    #[error("registry authentication failed: {0}")]
    Auth(String),

    #[error("registry credentials: {0}")]
    Credentials(#[from] auth::Error),

    #[error("{operation} failed after {attempts} attempts: {message}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        message: String,
    },

    #[error("{operation} rejected: {message}")]
    Rejected {
        operation: &'static str,
        message: String,
    },
}

/// Outcome of a single failed registry operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("authentication: {0}")]
    Auth(String),

    #[error("network: {0}")]
    Network(String),

    #[error("{0}")]
    Other(String),
}

impl From<docker::Error> for RegistryError {
    fn from(err: docker::Error) -> Self {
        match &err {
            docker::Error::Login { output, .. } => match docker::classify_failure(output) {
                PushFailure::Network => RegistryError::Network(err.to_string()),
                // Any other login failure means the credentials were not accepted.
                _ => RegistryError::Auth(err.to_string()),
            },
            docker::Error::Push { output, .. } => match docker::classify_failure(output) {
                PushFailure::Auth => RegistryError::Auth(err.to_string()),
                PushFailure::Network => RegistryError::Network(err.to_string()),
                PushFailure::Other => RegistryError::Other(err.to_string()),
            },
            _ => RegistryError::Other(err.to_string()),
        }
    }
}

/// Exponential backoff bounds for transient registry failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), capped at `max_backoff`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial = self.initial_backoff.as_millis() as f64;
        let max = self.max_backoff.as_millis() as f64;
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let millis = (initial * self.multiplier.powi(exponent)).min(max);
        Duration::from_millis(millis as u64)
    }
}

/// Low-level registry operations.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn login(&self, registry: &str, credentials: &Credentials) -> Result<(), RegistryError>;
    async fn push(&self, image: &str) -> Result<(), RegistryError>;
    async fn logout(&self, registry: &str) -> Result<(), RegistryError>;
}

/// Pushes a built image to its registry.
#[async_trait]
pub trait RegistryPublisher: Send + Sync {
    async fn publish(&self, artifact: &BuildArtifact, registry: &str) -> Result<(), Error>;
}

/// Registry access through the docker client, with a private credential store.
pub struct DockerRegistry {
    docker: Docker,
    // Holds the docker config directory until the registry is dropped.
    _config_dir: tempfile::TempDir,
}

impl DockerRegistry {
    pub fn new() -> Result<Self, std::io::Error> {
        let config_dir = tempfile::Builder::new().prefix("bnd-docker-").tempdir()?;
        Ok(Self {
            docker: Docker::with_config_dir(config_dir.path()),
            _config_dir: config_dir,
        })
    }
}

#[async_trait]
impl Registry for DockerRegistry {
    async fn login(&self, registry: &str, credentials: &Credentials) -> Result<(), RegistryError> {
        Ok(self
            .docker
            .login(registry, &credentials.username, &credentials.password)
            .await?)
    }

    async fn push(&self, image: &str) -> Result<(), RegistryError> {
        Ok(self.docker.push(image).await?)
    }

    async fn logout(&self, registry: &str) -> Result<(), RegistryError> {
        Ok(self.docker.logout(registry).await?)
    }
}

/// Logs in, pushes with retries on network failures, and logs out again.
pub struct Publisher<R> {
    registry: R,
    credentials: Box<dyn CredentialProvider>,
    policy: RetryPolicy,
}

impl<R: Registry> Publisher<R> {
    pub fn new(registry: R, credentials: Box<dyn CredentialProvider>, policy: RetryPolicy) -> Self {
        Self {
            registry,
            credentials,
            policy,
        }
    }
}

#[async_trait]
impl<R: Registry> RegistryPublisher for Publisher<R> {
    async fn publish(&self, artifact: &BuildArtifact, registry: &str) -> Result<(), Error> {
        let credentials = self.credentials.credentials(registry).await?;

        with_retries(&self.policy, "login", || self.registry.login(registry, &credentials)).await?;
        info!("Pushing {} to {registry}", artifact.image);
        let pushed = with_retries(&self.policy, "push", || self.registry.push(&artifact.image)).await;

        if let Err(err) = self.registry.logout(registry).await {
            warn!("Logout from {registry} failed: {err}");
        }
        pushed
    }
}

async fn with_retries<F, Fut>(policy: &RetryPolicy, operation: &'static str, mut run: F) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), RegistryError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match run().await {
            Ok(()) => {
                debug!("{operation} succeeded after {} attempt(s)", attempt + 1);
                return Ok(());
            }
            Err(RegistryError::Network(message)) if attempt < policy.max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                attempt += 1;
                warn!(
                    "{operation} failed ({message}), retry {attempt}/{} in {}ms",
                    policy.max_retries,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }
            Err(RegistryError::Network(message)) => {
                return Err(Error::RetriesExhausted {
                    operation,
                    attempts: attempt + 1,
                    message,
                })
            }
            Err(RegistryError::Auth(message)) => return Err(Error::Auth(message)),
            Err(RegistryError::Other(message)) => return Err(Error::Rejected { operation, message }),
        }
    }
}

use std::fmt::{Debug, Formatter};
use std::process::ExitStatus;
use async_trait::async_trait;
use log::debug;
use thiserror::Error;
use tokio::process::Command;

/// Username ECR expects together with the output of `aws ecr get-login-password`.
const ECR_USERNAME: &str = "AWS";

#[derive(Error, Debug)]
pub enum Error {
    #[error("aws ecr get-login-password exited with code {status}: {output}")]
    EcrLoginPassword {
        status: ExitStatus,
        output: String,
    },

    #[error("credential provider returned an empty password")]
    EmptyPassword,

    #[error(transparent)]
    IOError(#[from] std::io::Error),
}

/// Username/password pair for a container registry.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Debug for Credentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Source of registry credentials.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credentials(&self, registry: &str) -> Result<Credentials, Error>;
}

/// Short-lived ECR credentials obtained through the AWS CLI.
#[derive(Debug, Clone)]
pub struct EcrCredentials {
    pub region: String,
}

#[async_trait]
impl CredentialProvider for EcrCredentials {
    async fn credentials(&self, registry: &str) -> Result<Credentials, Error> {
        debug!("Requesting ECR login password for {registry} in {}", self.region);
        let output = Command::new("aws")
            .arg("ecr")
            .arg("get-login-password")
            .arg("--region")
            .arg(&self.region)
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            return Err(Error::EcrLoginPassword {
                status: output.status,
                output: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let password = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if password.is_empty() {
            return Err(Error::EmptyPassword);
        }
        Ok(Credentials {
            username: ECR_USERNAME.to_string(),
            password,
        })
    }
}

/// Fixed credentials, typically injected by the CI system.
#[derive(Debug, Clone)]
pub struct StaticCredentials(pub Credentials);

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn credentials(&self, _registry: &str) -> Result<Credentials, Error> {
        Ok(self.0.clone())
    }
}

/// Pick a credential provider for a region.
///
/// `REGISTRY_USERNAME` and `REGISTRY_PASSWORD` take precedence; otherwise ECR
/// credentials are requested from the AWS CLI.
pub fn from_env(region: &str) -> Box<dyn CredentialProvider> {
    let username = std::env::var("REGISTRY_USERNAME").ok();
    let password = std::env::var("REGISTRY_PASSWORD").ok();

    match (username, password) {
        (Some(username), Some(password)) if !password.is_empty() => {
            debug!("Using registry credentials from environment");
            Box::new(StaticCredentials(Credentials { username, password }))
        }
        (_, _) => Box::new(EcrCredentials {
            region: region.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_is_redacted() {
        let creds = Credentials {
            username: "AWS".into(),
            password: "hunter2".into(),
        };
        let printed = format!("{creds:?}");
        assert!(printed.contains("AWS"));
        assert!(!printed.contains("hunter2"));
    }

    #[tokio::test]
    async fn static_credentials() {
        let creds = Credentials {
            username: "ci".into(),
            password: "token".into(),
        };
        let provider = StaticCredentials(creds.clone());
        assert_eq!(provider.credentials("registry.example.com").await.unwrap(), creds);
    }
}

use std::path::PathBuf;
use async_trait::async_trait;
use log::{debug, info};
use serde::Serialize;
use thiserror::Error;

use crate::config::runtime::PipelineConfig;
use crate::docker::{self, BuildParams, Docker};

#[derive(Error, Debug)]
pub enum Error {
    #[error("dockerfile not found: {0}")]
    DockerfileNotFound(PathBuf),

    #[error("image tag could not be generated: {0}")]
    Tag(std::io::Error),

    #[error(transparent)]
    Docker(#[from] docker::Error),

    #[error("build scratch directory: {0}")]
    Scratch(#[from] std::io::Error),
}

/// A container image produced by a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildArtifact {
    /// Fully qualified reference, `<registry>/<app>:<tag>`.
    pub image: String,
    pub image_tag: String,
    /// Content address of the image, `sha256:...`.
    pub digest: String,
    pub size_bytes: u64,
}

/// Builds a container image for a pipeline.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn build(&self, config: &PipelineConfig) -> Result<BuildArtifact, Error>;
}

/// Builds images with the local docker daemon.
pub struct DockerImageBuilder {
    docker: Docker,
    source_directory: PathBuf,
}

impl DockerImageBuilder {
    pub fn new(source_directory: impl Into<PathBuf>) -> Self {
        Self {
            docker: Docker::new(),
            source_directory: source_directory.into(),
        }
    }
}

#[async_trait]
impl ImageBuilder for DockerImageBuilder {
    async fn build(&self, config: &PipelineConfig) -> Result<BuildArtifact, Error> {
        let dockerfile = self.source_directory.join(&config.dockerfile_path);
        if !dockerfile.is_file() {
            return Err(Error::DockerfileNotFound(dockerfile));
        }

        let image_tag = docker::tag::generate(&self.source_directory, &dockerfile, &config.environment)
            .await
            .map_err(Error::Tag)?;
        let image = format!("{}:{}", config.image_repository(), image_tag);
        info!("Building image {image} from {}", dockerfile.display());

        // Removed on drop, whether the build succeeds or not.
        let scratch = tempfile::Builder::new().prefix("bnd-build-").tempdir()?;
        let iidfile = scratch.path().join("image-id");

        let mut build_args = Vec::new();
        if let Some(language) = config.language {
            build_args.push(("LANGUAGE".to_string(), language.to_string()));
        }
        let labels = vec![
            ("io.bnd.app".to_string(), config.app_name.clone()),
            ("io.bnd.environment".to_string(), config.environment.clone()),
        ];

        self.docker
            .build(BuildParams {
                dockerfile: &dockerfile,
                context: &self.source_directory,
                image: &image,
                iidfile: &iidfile,
                build_args,
                labels,
            })
            .await?;

        let digest = tokio::fs::read_to_string(&iidfile).await?.trim().to_string();
        let size_bytes = self.docker.image_size(&image).await?;
        debug!("Built {image} ({digest}, {size_bytes} bytes)");

        Ok(BuildArtifact {
            image,
            image_tag,
            digest,
            size_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::runtime::{resolve, RawConfig};

    fn config(dockerfile: &str) -> PipelineConfig {
        let raw: RawConfig = [
            ("appName", "java-service"),
            ("environment", "staging"),
            ("ecrRegistry", "123456789012.dkr.ecr.us-east-1.amazonaws.com"),
            ("clusterName", "staging-eks-cluster"),
            ("awsRegion", "us-east-1"),
            ("dockerfile", dockerfile),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        resolve(&raw).unwrap()
    }

    #[tokio::test]
    async fn missing_dockerfile_fails_before_docker_runs() {
        let dir = tempfile::tempdir().unwrap();
        let builder = DockerImageBuilder::new(dir.path());
        match builder.build(&config("Dockerfile.missing")).await {
            Err(Error::DockerfileNotFound(path)) => {
                assert_eq!(path, dir.path().join("Dockerfile.missing"))
            }
            other => panic!("expected missing dockerfile, got {other:?}"),
        }
    }
}

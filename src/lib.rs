//! bnd: build, publish and deploy container images.
//!
//! A pipeline declaration names an application, an environment, the registry to push to
//! and the cluster to roll out on:
//!
//! ```toml
//! language = "java"
//! appName = "java-service"
//! environment = "staging"
//! ecrRegistry = "123456789012.dkr.ecr.us-east-1.amazonaws.com"
//! clusterName = "staging-eks-cluster"
//! awsRegion = "us-east-1"
//! ```
//!
//! The declaration is resolved into a [`config::runtime::PipelineConfig`] and handed to a
//! [`pipeline::Pipeline`], which builds the image, pushes it and rolls it out, stopping at the
//! first stage that fails.

pub mod auth;
pub mod build;
pub mod config;
pub mod deploy;
pub mod docker;
pub mod notify;
pub mod pipeline;
pub mod publish;
pub mod report;
pub mod sdk;

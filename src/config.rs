/// Tool configuration: retry bounds, rollout timeouts and notification settings.
///
/// The built-in `default.toml` is always loaded first; a user supplied `bnd.toml`
/// is merged on top of it, key by key.
pub mod file {
    use serde::Deserialize;
    use serde_inline_default::serde_inline_default;
    use std::time::Duration;
    use thiserror::Error;

    use crate::publish::RetryPolicy;

    const DEFAULT_CONFIG: &str = include_str!("../default.toml");

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("read {path}: {err}")]
        ReadFile {
            err: std::io::Error,
            path: String,
        },

        #[error("parse: {0}")]
        Parse(#[from] toml::de::Error),
    }

    /// A bnd.toml file.
    #[derive(Deserialize, Debug, Clone, Default)]
    pub struct File {
        pub description: Option<String>,
        #[serde(default)]
        pub publish: Publish,
        #[serde(default)]
        pub deploy: Deploy,
        #[serde(default)]
        pub notify: Notify,
    }

    #[serde_inline_default]
    #[derive(Deserialize, Debug, Clone)]
    pub struct Publish {
        /// Retries after the first push attempt; network failures only.
        #[serde_inline_default(3)]
        pub max_retries: u32,
        #[serde_inline_default(1000)]
        pub initial_backoff_ms: u64,
        #[serde_inline_default(30_000)]
        pub max_backoff_ms: u64,
        #[serde_inline_default(2.0)]
        pub multiplier: f64,
    }

    impl Default for Publish {
        fn default() -> Self {
            Self {
                max_retries: 3,
                initial_backoff_ms: 1000,
                max_backoff_ms: 30_000,
                multiplier: 2.0,
            }
        }
    }

    impl Publish {
        pub fn retry_policy(&self) -> RetryPolicy {
            RetryPolicy {
                max_retries: self.max_retries,
                initial_backoff: Duration::from_millis(self.initial_backoff_ms),
                max_backoff: Duration::from_millis(self.max_backoff_ms),
                multiplier: self.multiplier,
            }
        }
    }

    #[serde_inline_default]
    #[derive(Deserialize, Debug, Clone)]
    pub struct Deploy {
        #[serde_inline_default(600)]
        pub rollout_timeout_secs: u64,
        #[serde_inline_default(5)]
        pub poll_interval_secs: u64,
        /// Kubernetes namespace; defaults to the pipeline environment.
        #[serde(default)]
        pub namespace: Option<String>,
        /// Container to update inside the deployment; defaults to the app name.
        #[serde(default)]
        pub container: Option<String>,
    }

    impl Default for Deploy {
        fn default() -> Self {
            Self {
                rollout_timeout_secs: 600,
                poll_interval_secs: 5,
                namespace: None,
                container: None,
            }
        }
    }

    impl Deploy {
        pub fn rollout_timeout(&self) -> Duration {
            Duration::from_secs(self.rollout_timeout_secs)
        }

        pub fn poll_interval(&self) -> Duration {
            Duration::from_secs(self.poll_interval_secs.max(1))
        }
    }

    #[serde_inline_default]
    #[derive(Deserialize, Debug, Clone)]
    pub struct Notify {
        #[serde(default)]
        pub webhook_url: Option<String>,
        #[serde_inline_default(10)]
        pub timeout_secs: u64,
    }

    impl Default for Notify {
        fn default() -> Self {
            Self {
                webhook_url: None,
                timeout_secs: 10,
            }
        }
    }

    impl File {
        /// Parse the configuration compiled into the program.
        pub fn builtin() -> Result<Self, Error> {
            Ok(toml::from_str(DEFAULT_CONFIG)?)
        }

        /// Built-in configuration overlaid with the contents of `path`.
        pub fn default_with_user_config_file(path: &str) -> Result<Self, Error> {
            let user = std::fs::read_to_string(path).map_err(|err| Error::ReadFile {
                err,
                path: path.to_string(),
            })?;
            Self::default_with_user_config(&user)
        }

        pub fn default_with_user_config(user: &str) -> Result<Self, Error> {
            let mut base: toml::Table = toml::from_str(DEFAULT_CONFIG)?;
            let user: toml::Table = toml::from_str(user)?;
            merge(&mut base, user);
            Ok(toml::Value::Table(base).try_into()?)
        }
    }

    /// Recursively overlay `overlay` onto `base`. Tables merge, everything else is replaced.
    fn merge(base: &mut toml::Table, overlay: toml::Table) {
        for (key, value) in overlay {
            match (base.get_mut(&key), value) {
                (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                    merge(existing, incoming)
                }
                (_, value) => {
                    base.insert(key, value);
                }
            }
        }
    }

    #[cfg(test)]
    pub mod test {
        use super::File;

        #[test]
        pub fn load_default_configuration() {
            let cfg = File::builtin().unwrap();
            assert_eq!(cfg.description, Some("Default configuration file".into()));
            assert_eq!(cfg.publish.max_retries, 3);
            assert_eq!(cfg.deploy.rollout_timeout_secs, 600);
            assert!(cfg.notify.webhook_url.is_none());
        }

        #[test]
        pub fn user_config_overrides_defaults() {
            let cfg = File::default_with_user_config(
                r#"
                [publish]
                max_retries = 5

                [deploy]
                namespace = "apps"
                "#,
            )
            .unwrap();
            assert_eq!(cfg.publish.max_retries, 5);
            assert_eq!(cfg.publish.initial_backoff_ms, 1000);
            assert_eq!(cfg.deploy.namespace.as_deref(), Some("apps"));
            assert_eq!(cfg.deploy.poll_interval_secs, 5);
            assert_eq!(cfg.description, Some("Default configuration file".into()));
        }

        #[test]
        pub fn missing_sections_use_inline_defaults() {
            let cfg: File = toml::from_str("[deploy]\nrollout_timeout_secs = 30").unwrap();
            assert_eq!(cfg.deploy.rollout_timeout_secs, 30);
            assert_eq!(cfg.deploy.poll_interval_secs, 5);
            assert_eq!(cfg.publish.multiplier, 2.0);
        }
    }
}

/// Pipeline declaration: resolution of the raw key/value map into a [`runtime::PipelineConfig`].
pub mod runtime {
    use crate::sdk::Language;
    use log::warn;
    use serde::Serialize;
    use std::collections::BTreeMap;
    use std::path::Path;
    use thiserror::Error;

    pub const DEFAULT_DOCKERFILE: &str = "Dockerfile";

    const KEY_LANGUAGE: &str = "language";
    const KEY_APP_NAME: &str = "appName";
    const KEY_ENVIRONMENT: &str = "environment";
    const KEY_REGISTRY: &str = "ecrRegistry";
    const KEY_CLUSTER: &str = "clusterName";
    const KEY_REGION: &str = "awsRegion";
    const KEY_DOCKERFILE: &str = "dockerfile";

    const KNOWN_KEYS: [&str; 7] = [
        KEY_LANGUAGE,
        KEY_APP_NAME,
        KEY_ENVIRONMENT,
        KEY_REGISTRY,
        KEY_CLUSTER,
        KEY_REGION,
        KEY_DOCKERFILE,
    ];

    /// Pipeline declaration as written by the user, before validation.
    pub type RawConfig = BTreeMap<String, String>;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("missing required field '{0}'")]
        MissingField(&'static str),

        #[error("invalid field '{field}': {reason}")]
        InvalidField {
            field: String,
            reason: String,
        },

        #[error("read {path}: {err}")]
        ReadFile {
            err: std::io::Error,
            path: String,
        },

        #[error("parse toml: {0}")]
        Toml(#[from] toml::de::Error),

        #[error("parse yaml: {0}")]
        Yaml(#[from] serde_yaml::Error),
    }

    fn invalid(field: &str, reason: impl Into<String>) -> Error {
        Error::InvalidField {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Validated pipeline parameters.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct PipelineConfig {
        pub language: Option<Language>,
        pub app_name: String,
        pub environment: String,
        #[serde(rename = "registryURL")]
        pub registry_url: String,
        pub cluster_name: String,
        pub region: String,
        pub dockerfile_path: String,
    }

    impl PipelineConfig {
        /// Image repository without tag, e.g. `123.dkr.ecr.us-east-1.amazonaws.com/java-service`.
        pub fn image_repository(&self) -> String {
            format!("{}/{}", self.registry_url, self.app_name)
        }

        /// Key used to tell concurrent pipelines apart.
        pub fn pipeline_key(&self) -> (String, String) {
            (self.app_name.clone(), self.environment.clone())
        }
    }

    /// Validate and normalize a raw pipeline declaration.
    pub fn resolve(raw: &RawConfig) -> Result<PipelineConfig, Error> {
        for key in raw.keys().filter(|key| !KNOWN_KEYS.contains(&key.as_str())) {
            warn!("Ignoring unknown pipeline key '{key}'");
        }

        let app_name = required(raw, KEY_APP_NAME)?;
        validate_dns_label(KEY_APP_NAME, &app_name)?;

        let environment = required(raw, KEY_ENVIRONMENT)?;
        validate_dns_label(KEY_ENVIRONMENT, &environment)?;

        let registry_url = required(raw, KEY_REGISTRY)?;
        validate_registry(&registry_url)?;

        let cluster_name = required(raw, KEY_CLUSTER)?;
        if cluster_name.chars().any(char::is_whitespace) {
            return Err(invalid(KEY_CLUSTER, "must not contain whitespace"));
        }

        let region = required(raw, KEY_REGION)?;
        if !region
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(invalid(KEY_REGION, format!("'{region}' is not a valid region name")));
        }

        let language = optional(raw, KEY_LANGUAGE)
            .map(|lang| lang.parse::<Language>().map_err(|reason| invalid(KEY_LANGUAGE, reason)))
            .transpose()?;

        let dockerfile_path =
            optional(raw, KEY_DOCKERFILE).unwrap_or_else(|| DEFAULT_DOCKERFILE.to_string());

        Ok(PipelineConfig {
            language,
            app_name,
            environment,
            registry_url,
            cluster_name,
            region,
            dockerfile_path,
        })
    }

    fn optional(raw: &RawConfig, key: &str) -> Option<String> {
        raw.get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }

    fn required(raw: &RawConfig, key: &'static str) -> Result<String, Error> {
        optional(raw, key).ok_or(Error::MissingField(key))
    }

    /// RFC 1123 label, as required for Kubernetes object and namespace names.
    fn validate_dns_label(field: &str, value: &str) -> Result<(), Error> {
        const MAX_LENGTH: usize = 63;
        if value.len() > MAX_LENGTH {
            return Err(invalid(field, format!("longer than {MAX_LENGTH} characters")));
        }
        if !value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(invalid(
                field,
                format!("'{value}' may only contain lowercase letters, digits and '-'"),
            ));
        }
        if value.starts_with('-') || value.ends_with('-') {
            return Err(invalid(field, format!("'{value}' must start and end with a letter or digit")));
        }
        Ok(())
    }

    fn validate_registry(value: &str) -> Result<(), Error> {
        if value.contains("://") {
            return Err(invalid(KEY_REGISTRY, "must be a registry host without scheme"));
        }
        if value.contains('/') {
            return Err(invalid(KEY_REGISTRY, "must not contain a path"));
        }
        if value.chars().any(char::is_whitespace) {
            return Err(invalid(KEY_REGISTRY, "must not contain whitespace"));
        }
        Ok(())
    }

    /// Read a pipeline declaration from a TOML or YAML file (decided by extension).
    ///
    /// The file must be a flat table of string values.
    pub fn load_file(path: &str) -> Result<RawConfig, Error> {
        let content = std::fs::read_to_string(path).map_err(|err| Error::ReadFile {
            err,
            path: path.to_string(),
        })?;
        let extension = Path::new(path)
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default();
        match extension {
            "yaml" | "yml" => parse_yaml(&content),
            _ => parse_toml(&content),
        }
    }

    pub fn parse_toml(content: &str) -> Result<RawConfig, Error> {
        let table: BTreeMap<String, toml::Value> = toml::from_str(content)?;
        table
            .into_iter()
            .map(|(key, value)| match value {
                toml::Value::String(s) => Ok((key, s)),
                other => Err(invalid(&key, format!("expected a string, found {}", other.type_str()))),
            })
            .collect()
    }

    pub fn parse_yaml(content: &str) -> Result<RawConfig, Error> {
        let table: BTreeMap<String, serde_yaml::Value> = serde_yaml::from_str(content)?;
        table
            .into_iter()
            .map(|(key, value)| match value {
                serde_yaml::Value::String(s) => Ok((key, s)),
                _ => Err(invalid(&key, "expected a string")),
            })
            .collect()
    }

    /// Apply `key=value` overrides on top of a raw declaration.
    pub fn apply_overrides(raw: &mut RawConfig, overrides: &[String]) -> Result<(), Error> {
        for entry in overrides {
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| invalid(entry, "override must have the form key=value"))?;
            raw.insert(key.trim().to_string(), value.to_string());
        }
        Ok(())
    }

}

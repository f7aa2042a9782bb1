use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output, Stdio};
use log::debug;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;

/// Number of output lines kept as diagnostics when a docker command fails.
const DIAGNOSTIC_LINES: usize = 40;

#[derive(Error, Debug)]
pub enum Error {
    #[error("docker build failed with exit code {status}:\n{output}")]
    Build {
        status: ExitStatus,
        output: String,
    },

    #[error("docker image inspect failed with exit code {status}: {output}")]
    Inspect {
        status: ExitStatus,
        output: String,
    },

    #[error("docker login failed with exit code {status}: {output}")]
    Login {
        status: ExitStatus,
        output: String,
    },

    #[error("docker logout failed with exit code {0}")]
    Logout(ExitStatus),

    #[error("docker push failed with exit code {status}: {output}")]
    Push {
        status: ExitStatus,
        output: String,
    },

    #[error("unexpected docker output: {0}")]
    UnexpectedOutput(String),

    #[error(transparent)]
    IOError(#[from] std::io::Error),
}

/// How a failed push should be treated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushFailure {
    /// Credentials were rejected; retrying will not help.
    Auth,
    /// Transient transport problem.
    Network,
    Other,
}

/// Classify push/login diagnostics printed by the docker client.
pub fn classify_failure(output: &str) -> PushFailure {
    const AUTH_MARKERS: [&str; 6] = [
        "denied",
        "unauthorized",
        "authentication required",
        "no basic auth credentials",
        "authorization token has expired",
        "403 forbidden",
    ];
    const NETWORK_MARKERS: [&str; 12] = [
        "timeout",
        "timed out",
        "connection reset",
        "connection refused",
        "broken pipe",
        "tls handshake",
        "no such host",
        "network is unreachable",
        "unexpected eof",
        "502 bad gateway",
        "503 service unavailable",
        "504 gateway",
    ];

    let lowered = output.to_lowercase();
    // Go's net/http reports a dropped connection as a bare `EOF` after the request URL.
    let bare_eof = lowered.lines().any(|line| {
        let line = line.trim_end();
        line == "eof" || line.ends_with(": eof")
    });
    if AUTH_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        PushFailure::Auth
    } else if bare_eof || NETWORK_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        PushFailure::Network
    } else {
        PushFailure::Other
    }
}

/// Keep the last lines of stdout and stderr, which is where build tools report errors.
pub fn diagnostics(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let lines: Vec<&str> = stdout.lines().chain(stderr.lines()).collect();
    let start = lines.len().saturating_sub(DIAGNOSTIC_LINES);
    lines[start..].join("\n")
}

/// The most recent lines of a streamed process output.
#[derive(Debug, Default)]
struct Tail {
    lines: VecDeque<String>,
}

impl Tail {
    fn push(&mut self, line: String) {
        if self.lines.len() == DIAGNOSTIC_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// Join two tails (stdout first), keeping at most `DIAGNOSTIC_LINES` lines.
    fn join(self, other: Tail) -> String {
        let lines: Vec<String> = self.lines.into_iter().chain(other.lines).collect();
        let start = lines.len().saturating_sub(DIAGNOSTIC_LINES);
        lines[start..].join("\n")
    }
}

/// Log every line of `reader` as it arrives and keep the tail.
async fn follow<R: AsyncRead + Unpin>(reader: Option<R>, image: &str) -> std::io::Result<Tail> {
    let mut tail = Tail::default();
    let Some(reader) = reader else {
        return Ok(tail);
    };
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        debug!("[build {image}] {line}");
        tail.push(line);
    }
    Ok(tail)
}

pub struct BuildParams<'a> {
    pub dockerfile: &'a Path,
    pub context: &'a Path,
    pub image: &'a str,
    /// File the image ID is written to once the build succeeds.
    pub iidfile: &'a Path,
    pub build_args: Vec<(String, String)>,
    pub labels: Vec<(String, String)>,
}

/// Thin wrapper around the `docker` command line client.
///
/// When `config_dir` is set, credentials from `docker login` are stored there
/// instead of the user's global docker configuration, so that concurrent
/// pipelines never share a credential store.
#[derive(Debug, Clone, Default)]
pub struct Docker {
    config_dir: Option<PathBuf>,
}

impl Docker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config_dir(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: Some(config_dir.into()),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new("docker");
        if let Some(dir) = &self.config_dir {
            command.arg("--config").arg(dir);
        }
        command.stdin(Stdio::null()).kill_on_drop(true);
        command
    }

    pub async fn build(&self, params: BuildParams<'_>) -> Result<(), Error> {
        let mut command = self.command();
        command
            .arg("build")
            .arg("--file")
            .arg(params.dockerfile)
            .arg("--tag")
            .arg(params.image)
            .arg("--iidfile")
            .arg(params.iidfile);
        for (key, value) in &params.build_args {
            command.arg("--build-arg").arg(format!("{key}={value}"));
        }
        for (key, value) in &params.labels {
            command.arg("--label").arg(format!("{key}={value}"));
        }
        command.arg(params.context);

        debug!("Running docker build for {}", params.image);
        let mut child = command.stdout(Stdio::piped()).stderr(Stdio::piped()).spawn()?;
        let (stdout, stderr) = tokio::try_join!(
            follow(child.stdout.take(), params.image),
            follow(child.stderr.take(), params.image),
        )?;
        let status = child.wait().await?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::Build {
                status,
                output: stdout.join(stderr),
            })
        }
    }

    /// Size of a local image in bytes.
    pub async fn image_size(&self, image: &str) -> Result<u64, Error> {
        let output = self
            .command()
            .arg("image")
            .arg("inspect")
            .arg("--format")
            .arg("{{.Size}}")
            .arg(image)
            .output()
            .await?;
        if !output.status.success() {
            return Err(Error::Inspect {
                status: output.status,
                output: diagnostics(&output),
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .trim()
            .parse()
            .map_err(|_| Error::UnexpectedOutput(stdout.trim().to_string()))
    }

    pub async fn login(&self, registry: &str, username: &str, password: &str) -> Result<(), Error> {
        debug!("Logging in to Docker registry {}", registry);
        let mut child = self
            .command()
            .arg("login")
            .arg(registry)
            .arg("--username")
            .arg(username)
            .arg("--password-stdin")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(password.as_bytes()).await?;
            // Closing stdin signals end of password.
            drop(stdin);
        }
        let output = child.wait_with_output().await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::Login {
                status: output.status,
                output: diagnostics(&output),
            })
        }
    }

    pub async fn logout(&self, registry: &str) -> Result<(), Error> {
        let output = self.command().arg("logout").arg(registry).output().await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::Logout(output.status))
        }
    }

    pub async fn push(&self, image: &str) -> Result<(), Error> {
        debug!("Pushing image {}", image);
        let output = self.command().arg("push").arg(image).output().await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::Push {
                status: output.status,
                output: diagnostics(&output),
            })
        }
    }
}

/// Deterministic image tags.
pub mod tag {
    use std::path::Path;
    use log::debug;
    use tokio::process::Command;

    const SHORT_SHA_LENGTH: usize = 12;

    /// `<environment>-<short commit sha>`.
    ///
    /// Falls back to a hash of the Dockerfile when the source directory is not a git checkout.
    pub async fn generate(
        source_directory: &Path,
        dockerfile: &Path,
        environment: &str,
    ) -> Result<String, std::io::Error> {
        let revision = match git_revision(source_directory).await {
            Some(sha) => sha,
            None => {
                debug!("No git revision found in {}, hashing Dockerfile", source_directory.display());
                content_hash(&tokio::fs::read(dockerfile).await?)
            }
        };
        Ok(format(environment, &revision))
    }

    pub fn format(environment: &str, revision: &str) -> String {
        let revision = &revision[..revision.len().min(SHORT_SHA_LENGTH)];
        format!("{environment}-{revision}")
    }

    pub fn content_hash(content: &[u8]) -> String {
        sha256::digest(content)[..SHORT_SHA_LENGTH].to_string()
    }

    async fn git_revision(source_directory: &Path) -> Option<String> {
        let output = Command::new("git")
            .arg("-C")
            .arg(source_directory)
            .arg("rev-parse")
            .arg(format!("--short={SHORT_SHA_LENGTH}"))
            .arg("HEAD")
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!sha.is_empty()).then_some(sha)
    }

}

//! Builds contestant submissions from git into runnable binaries.
//!
//! A submission is a Rust crate exposing a `player` binary. Building fetches
//! the requested ref into a per-build directory, compiles it in release mode
//! and registers the produced binary under a content-addressed image id
//! (SHA-256 of the binary). Compile output is captured into a log file and
//! returned to the caller, success or failure; fetch output never leaves the
//! server.

use std::collections::HashMap;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Context};
use sha2::{Digest, Sha256};
use tracing::{info, instrument};

use crate::cancel::{has_cause, CancelToken, Cause};

const BIN_NAME: &str = "player";

// Supplies the credential from the environment: the token never enters argv,
// remote URLs or anything git prints.
const GIT_CREDENTIAL_HELPER: &str =
    "credential.helper=!f() { echo username=x-access-token; echo password=$GIT_AUTH_TOKEN; }; f";

/// Error class a failed build is reported under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildErrorKind {
    /// The repository or ref could not be fetched, or was malformed.
    BadRepo,
    /// The build deadline elapsed.
    Timeout,
    /// Compilation failed, or anything else went wrong.
    Unknown,
}

#[derive(Debug)]
pub struct BuildError {
    pub kind: BuildErrorKind,
    pub logs: String,
    pub error: anyhow::Error,
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.error)
    }
}

impl std::error::Error for BuildError {}

#[derive(Debug)]
pub struct BuildOutput {
    pub image_id: String,
    pub logs: String,
}

/// Fetches, compiles and registers submissions.
pub struct SubmissionBuilder {
    builds_dir: PathBuf,
    git_token: String,
    store: Mutex<HashMap<String, PathBuf>>,
}

impl SubmissionBuilder {
    pub fn new(builds_dir: PathBuf, git_token: String) -> SubmissionBuilder {
        SubmissionBuilder {
            builds_dir,
            git_token,
            store: Mutex::new(HashMap::new()),
        }
    }

    /// The binary previously registered under `image_id`.
    pub fn resolve(&self, image_id: &str) -> Option<PathBuf> {
        self.store
            .lock()
            .expect("submission store poisoned")
            .get(image_id)
            .cloned()
    }

    #[instrument(skip(self, token))]
    pub fn build(
        &self,
        token: &CancelToken,
        repo: &str,
        reference: &str,
    ) -> Result<BuildOutput, BuildError> {
        // Caller-supplied values are positional git arguments; a leading '-'
        // would be parsed as an option.
        if repo.starts_with('-') || reference.starts_with('-') {
            return Err(BuildError {
                kind: BuildErrorKind::BadRepo,
                logs: String::new(),
                error: anyhow!("repository and ref must not start with '-'"),
            });
        }

        let dir = self.builds_dir.join(build_key(repo, reference));
        let fetch_log = dir.join("fetch.log");
        let build_log = dir.join("build.log");

        let prepared = (|| {
            if dir.exists() {
                std::fs::remove_dir_all(&dir).context("could not clear build directory")?;
            }
            std::fs::create_dir_all(&dir).context("could not create build directory")
        })();

        if let Err(error) = prepared {
            return Err(BuildError {
                kind: BuildErrorKind::Unknown,
                logs: String::new(),
                error,
            });
        }

        let result = self.run_build(token, repo, reference, &dir, &fetch_log, &build_log);
        // Only the compile log goes back to the caller; fetch output can name
        // the remote and stays on the server.
        let logs = std::fs::read_to_string(&build_log).unwrap_or_default();

        match result {
            Ok(binary) => {
                let image_id = match image_id_of(&binary) {
                    Ok(id) => id,
                    Err(error) => {
                        return Err(BuildError {
                            kind: BuildErrorKind::Unknown,
                            logs,
                            error,
                        })
                    }
                };
                self.store
                    .lock()
                    .expect("submission store poisoned")
                    .insert(image_id.clone(), binary);
                info!(%image_id, "submission built");
                Ok(BuildOutput { image_id, logs })
            }
            Err((kind, error)) => {
                let kind = if has_cause(&error, Cause::BuildTimeout) {
                    BuildErrorKind::Timeout
                } else {
                    kind
                };
                Err(BuildError { kind, logs, error })
            }
        }
    }

    fn run_build(
        &self,
        token: &CancelToken,
        repo: &str,
        reference: &str,
        dir: &Path,
        fetch_log: &Path,
        build_log: &Path,
    ) -> Result<PathBuf, (BuildErrorKind, anyhow::Error)> {
        let credentials = [("GIT_AUTH_TOKEN", self.git_token.as_str())];

        log_step(fetch_log, &format!("fetching {repo} at {reference}"));
        run_step(token, dir, fetch_log, "git", &["init", "-q"], &[])
            .map_err(|e| (BuildErrorKind::BadRepo, e))?;
        run_step(
            token,
            dir,
            fetch_log,
            "git",
            &[
                "-c",
                GIT_CREDENTIAL_HELPER,
                "fetch",
                "--depth",
                "1",
                "--",
                repo,
                reference,
            ],
            &credentials,
        )
        .map_err(|e| (BuildErrorKind::BadRepo, e))?;
        run_step(
            token,
            dir,
            fetch_log,
            "git",
            &["checkout", "-q", "FETCH_HEAD"],
            &[],
        )
        .map_err(|e| (BuildErrorKind::BadRepo, e))?;

        log_step(build_log, "compiling");
        run_step(
            token,
            dir,
            build_log,
            "cargo",
            &[
                "build",
                "--release",
                "--bin",
                BIN_NAME,
                "--message-format",
                "short",
            ],
            &[],
        )
        .map_err(|e| (BuildErrorKind::Unknown, e))?;

        let binary = dir.join("target/release").join(BIN_NAME);
        if !binary.is_file() {
            return Err((
                BuildErrorKind::Unknown,
                anyhow!("build produced no {BIN_NAME} binary"),
            ));
        }
        Ok(binary)
    }
}

fn log_step(log_path: &Path, message: &str) {
    if let Ok(mut log) = OpenOptions::new().create(true).append(true).open(log_path) {
        let _ = writeln!(log, "== {message}");
    }
}

/// Runs one external step, output appended to `log_path`, polling the token
/// so a cancelled build kills its child promptly.
fn run_step(
    token: &CancelToken,
    dir: &Path,
    log_path: &Path,
    program: &str,
    args: &[&str],
    envs: &[(&str, &str)],
) -> anyhow::Result<()> {
    let stdout = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .context("could not open build log")?;
    let stderr = stdout.try_clone().context("could not open build log")?;

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .env("GIT_TERMINAL_PROMPT", "0");
    for (key, value) in envs {
        command.env(key, value);
    }
    let mut child = command
        .spawn()
        .with_context(|| format!("could not launch '{program}'"))?;

    loop {
        if let Some(cause) = token.cause() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(anyhow::Error::new(cause).context(format!("{program} interrupted")));
        }

        match child
            .try_wait()
            .with_context(|| format!("failed to wait on '{program}'"))?
        {
            Some(status) if status.success() => return Ok(()),
            Some(status) => return Err(anyhow!("{program} exited with {status}")),
            None => std::thread::sleep(Duration::from_millis(50)),
        }
    }
}

fn build_key(repo: &str, reference: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(repo.as_bytes());
    hasher.update([0]);
    hasher.update(reference.as_bytes());
    let digest = hasher.finalize();
    hex_string(&digest[..8])
}

fn image_id_of(binary: &Path) -> anyhow::Result<String> {
    let bytes = std::fs::read(binary).context("could not read built binary")?;
    Ok(hex_string(&Sha256::digest(&bytes)))
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_keys_are_stable_and_distinct() {
        let a = build_key("https://example.com/a.git", "main");
        let b = build_key("https://example.com/a.git", "main");
        let c = build_key("https://example.com/a.git", "dev");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn leading_dash_arguments_are_rejected() {
        let builder = SubmissionBuilder::new(PathBuf::from("/tmp"), "s3cret".into());
        let token = CancelToken::new();

        let err = builder
            .build(&token, "--upload-pack=/bin/true", "main")
            .unwrap_err();
        assert_eq!(err.kind, BuildErrorKind::BadRepo);

        let err = builder
            .build(&token, "https://example.com/a.git", "-main")
            .unwrap_err();
        assert_eq!(err.kind, BuildErrorKind::BadRepo);
    }

    #[test]
    fn unknown_image_does_not_resolve() {
        let builder = SubmissionBuilder::new(PathBuf::from("/tmp"), String::new());
        assert!(builder.resolve("cafebabe").is_none());
    }
}

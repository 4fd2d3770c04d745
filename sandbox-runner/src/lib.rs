//! Runs contestant submissions as sandboxed OS processes.
//!
//! A [`Sandbox`] is a child process confined to its own cgroup v2 with a hard
//! memory limit, a pid cap and a CPU quota, talking to the host over piped
//! stdin/stdout. Each sandbox also owns a scratch directory which serves as
//! the child's working directory; files the submission is asked to produce
//! (e.g. a field dump) land there and can be read back with
//! [`Sandbox::read_file`].
//!
//! # Linux-Only
//!
//! Resource limits require Linux with cgroups v2.
//! [`SandboxRunner::spawn_unconstrained`] skips the cgroup entirely and is
//! meant for tests.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use cgroups_rs::Cgroup;
use tempfile::TempDir;
use tracing::warn;

/// Resource limits applied to every sandboxed submission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limits {
    /// Memory hard limit in bytes.
    pub memory_bytes: i64,
    /// CPU quota expressed in virtual CPUs (1.0 = one full core).
    pub vcpus: f64,
    /// Maximum number of pids inside the sandbox at any time.
    pub max_pids: i64,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            memory_bytes: 70 * 1024 * 1024,
            vcpus: 1.0,
            max_pids: 100,
        }
    }
}

fn get_current_user_id() -> anyhow::Result<String> {
    let output = Command::new("id")
        .arg("-u")
        .output()
        .context("Could not launch 'id -u'")?;
    let stdout = output.stdout;
    let untrimmed_id = std::str::from_utf8(&stdout).context("id is not a valid string")?;
    Ok(untrimmed_id.trim().to_string())
}

fn get_cgroup_path(user_id: &str, group_name: &str) -> String {
    format!("user.slice/user-{user_id}.slice/user@{user_id}.service/{group_name}")
}

/// Create a cgroup at `path` carrying `limits`.
///
/// CPU time is constrained through a quota over a fixed 100ms period rather
/// than through a cpuset, so fractional vCPU budgets work on any core.
fn create_cgroup(path: &str, limits: &Limits) -> anyhow::Result<Cgroup> {
    const CPU_PERIOD_US: u64 = 100_000;

    let mut builder = cgroups_rs::cgroup_builder::CgroupBuilder::new(path);
    if limits.memory_bytes > 0 {
        builder = builder.memory().memory_hard_limit(limits.memory_bytes).done();
    }
    if limits.max_pids > 0 {
        builder = builder
            .pid()
            .maximum_number_of_processes(cgroups_rs::MaxValue::Value(limits.max_pids))
            .done();
    }
    if limits.vcpus > 0.0 {
        let quota = (limits.vcpus * CPU_PERIOD_US as f64) as i64;
        builder = builder.cpu().quota(quota).period(CPU_PERIOD_US).done();
    }
    builder
        .build(cgroups_rs::hierarchies::auto())
        .context("could not create cgroup")
}

fn wait_for_process_cleanup(
    cgroup: &Cgroup,
    pid: u64,
    max_duration: Duration,
) -> anyhow::Result<()> {
    let deadline = Instant::now() + max_duration;
    while cgroup.tasks().iter().any(|cpid| cpid.pid == pid) {
        if Instant::now() > deadline {
            return Err(anyhow!("process cleanup timed out"));
        }
        std::thread::sleep(std::cmp::min(Duration::from_millis(10), max_duration / 10));
    }
    Ok(())
}

/// Exit summary of a finished sandbox.
///
/// If the sandbox was torn down by the host (cancellation, close), `cause`
/// carries the reason and takes precedence over the exit code, which will be
/// a meaningless 137 after a cgroup kill. An exit code of `-1` means the
/// status could not be determined.
#[derive(Debug)]
pub struct RunResult {
    pub exit_code: i64,
    pub cause: Option<anyhow::Error>,
}

#[derive(Default)]
struct ExitRecord {
    cause: Option<anyhow::Error>,
    killed: bool,
}

/// The part of a sandbox that other threads may touch: enough to kill the
/// process group and remember why. The `Cgroup` handle itself stays with the
/// owning [`Sandbox`].
struct Shared {
    // `/sys/fs/cgroup/<path>/cgroup.kill` when the sandbox is constrained.
    kill_file: Option<PathBuf>,
    pid: u64,
    record: Mutex<ExitRecord>,
}

impl Shared {
    /// Kill everything inside the sandbox, recording `cause` if given.
    ///
    /// First cause wins; repeated kills are no-ops.
    fn kill(&self, cause: Option<anyhow::Error>) {
        let mut record = self.record.lock().expect("sandbox record poisoned");
        if record.killed {
            return;
        }
        record.killed = true;
        record.cause = cause;
        drop(record);

        let killed = match &self.kill_file {
            Some(kill_file) => std::fs::write(kill_file, "1").is_ok(),
            None => false,
        };
        if !killed {
            // No cgroup (or a v1 hierarchy without cgroup.kill): signal the
            // child directly, the same way the host would from a shell.
            let _ = Command::new("kill")
                .arg("-KILL")
                .arg(self.pid.to_string())
                .status();
        }
    }
}

/// A handle onto a running sandbox that can terminate it from another thread.
///
/// This is what cancellation hooks hold: the owning [`Sandbox`] stays with
/// the player session, while the handle only carries enough to kill the
/// process and record why.
#[derive(Clone)]
pub struct SandboxHandle {
    shared: Arc<Shared>,
}

impl SandboxHandle {
    /// Tear the sandbox down, attaching `cause` to the eventual [`RunResult`].
    pub fn terminate(&self, cause: anyhow::Error) {
        self.shared.kill(Some(cause));
    }
}

/// Spawns sandboxes with a fixed set of [`Limits`].
#[derive(Debug, Clone)]
pub struct SandboxRunner {
    limits: Limits,
}

impl SandboxRunner {
    pub fn new(limits: Limits) -> SandboxRunner {
        SandboxRunner { limits }
    }

    /// Launch `program` inside a fresh cgroup with this runner's limits.
    ///
    /// The child runs with its scratch directory as working directory, stdin
    /// and stdout piped, stderr discarded.
    pub fn spawn(&self, program: &Path) -> anyhow::Result<Sandbox> {
        // Generate a new cgroup name for each sandbox.
        static COUNTER: AtomicU32 = AtomicU32::new(1);
        let user_id = get_current_user_id().context("could not get user id")?;
        let group_name = format!("SANDBOX_{}", COUNTER.fetch_add(1, Ordering::Relaxed));
        let path = get_cgroup_path(&user_id, &group_name);
        let cgroup = create_cgroup(&path, &self.limits).context("could not create cgroup")?;

        Sandbox::launch(program, Some(cgroup))
    }

    /// Launch `program` with no cgroup attached, constraining nothing.
    ///
    /// Only timing limits imposed by the caller apply. Used by tests and as a
    /// fallback on hosts without cgroups v2.
    pub fn spawn_unconstrained(&self, program: &Path) -> anyhow::Result<Sandbox> {
        Sandbox::launch(program, None)
    }
}

/// A running submission process.
pub struct Sandbox {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    scratch: TempDir,
    cgroup: Option<Cgroup>,
    shared: Arc<Shared>,
    exit: Option<i64>,
    closed: bool,
}

impl Sandbox {
    fn launch(program: &Path, cgroup: Option<Cgroup>) -> anyhow::Result<Sandbox> {
        let scratch = tempfile::Builder::new()
            .prefix("sandbox-")
            .tempdir()
            .context("could not create scratch directory")?;

        let mut child = Command::new(program)
            .current_dir(scratch.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| {
                if let Some(cgroup) = &cgroup {
                    let _ = cgroup.delete();
                }
                format!("could not launch {}", program.display())
            })?;

        let pid = child.id() as u64;
        if let Some(cgroup) = &cgroup {
            let addition = cgroup.add_task_by_tgid(cgroups_rs::CgroupPid { pid });
            if addition.is_err() {
                let kill = child.kill();
                addition.with_context(|| {
                    if let Err(err) = kill {
                        format!(
                            "could not add process to cgroup, and process could not be killed either ({err})"
                        )
                    } else {
                        "could not add process to cgroup".to_string()
                    }
                })?;
            }
        }

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let kill_file = cgroup
            .as_ref()
            .map(|cgroup| PathBuf::from(format!("/sys/fs/cgroup/{}/cgroup.kill", cgroup.path())));

        Ok(Sandbox {
            shared: Arc::new(Shared {
                kill_file,
                pid,
                record: Mutex::new(ExitRecord::default()),
            }),
            child,
            stdin,
            stdout,
            scratch,
            cgroup,
            exit: None,
            closed: false,
        })
    }

    /// Cross-thread handle used to terminate the sandbox on cancellation.
    pub fn handle(&self) -> SandboxHandle {
        SandboxHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn stdin(&mut self) -> &mut ChildStdin {
        self.stdin.as_mut().expect("sandbox stdin already taken")
    }

    /// Takes the child's stdout. May be called once.
    pub fn take_stdout(&mut self) -> ChildStdout {
        self.stdout.take().expect("sandbox stdout already taken")
    }

    pub fn scratch_path(&self) -> &Path {
        self.scratch.path()
    }

    /// Open a file produced by the submission.
    ///
    /// Paths already inside the scratch directory are used as-is. Any other
    /// path is reinterpreted relative to it, so a conventional
    /// `/tmp/field.txt` from the protocol maps onto `<scratch>/tmp/field.txt`.
    pub fn read_file(&self, path: &Path) -> std::io::Result<BufReader<File>> {
        let resolved = if path.starts_with(self.scratch.path()) {
            path.to_path_buf()
        } else {
            let relative: PathBuf = path.components().filter(|c| c.as_os_str() != "/").collect();
            self.scratch.path().join(relative)
        };
        File::open(resolved).map(BufReader::new)
    }

    /// Whether the child process is still running.
    pub fn is_alive(&mut self) -> bool {
        if self.exit.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit = Some(exit_code(status));
                false
            }
            Ok(None) => true,
            Err(_) => false,
        }
    }

    /// Block until the child has exited and report how it went.
    ///
    /// A recorded termination cause is handed out once; later calls see only
    /// the exit code.
    pub fn wait_result(&mut self) -> RunResult {
        let exit_code = match self.exit {
            Some(code) => code,
            None => {
                let code = match self.child.wait() {
                    Ok(status) => exit_code(status),
                    Err(_) => -1,
                };
                self.exit = Some(code);
                code
            }
        };
        let cause = self
            .shared
            .record
            .lock()
            .expect("sandbox record poisoned")
            .cause
            .take();
        RunResult { exit_code, cause }
    }

    /// Tear the sandbox down: kill the process, reap the child, delete the
    /// cgroup. Idempotent.
    pub fn close(&mut self) -> anyhow::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        self.shared.kill(None);
        if self.exit.is_none() {
            let code = self.child.wait().map(exit_code).unwrap_or(-1);
            self.exit = Some(code);
        }

        if let Some(cgroup) = &self.cgroup {
            wait_for_process_cleanup(cgroup, self.shared.pid, Duration::from_secs(1))?;
            if let Err(e) = cgroup.delete() {
                // The processes are dead either way.
                warn!("failed to remove cgroup: {e}");
            }
        }
        Ok(())
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close() {
                warn!("sandbox cleanup on drop failed: {e:#}");
            }
        }
    }
}

fn exit_code(status: ExitStatus) -> i64 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + i64::from(signal);
        }
    }
    status.code().map(i64::from).unwrap_or(-1)
}

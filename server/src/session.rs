//! Sandbox-backed player sessions.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::ChildStdout;

use anyhow::Context;
use sandbox_runner::{Sandbox, SandboxRunner};
use tracing::{instrument, trace};

use crate::cancel::CancelToken;
use crate::field::{parse_ships, Configuration, Field, ShipField};
use crate::player::{Player, PlayerFactory, Terminated};

/// A contestant process adapted into the request/response [`Player`] shape.
///
/// Commands go down the sandbox's stdin, one line each; exactly one reply
/// line is read back. The field dump is fetched from the sandbox scratch
/// directory, bypassing the pipes entirely.
pub struct SandboxPlayer {
    sandbox: Sandbox,
    stdout: BufReader<ChildStdout>,
    field_file: PathBuf,
}

impl SandboxPlayer {
    /// Spawns the submission and wires cancellation into the sandbox: when
    /// `token` is cancelled, the process is torn down and outstanding reads
    /// complete with the cause attached.
    pub fn new(
        runner: &SandboxRunner,
        token: &CancelToken,
        program: &Path,
    ) -> anyhow::Result<SandboxPlayer> {
        let mut sandbox = runner.spawn(program)?;
        let stdout = BufReader::new(sandbox.take_stdout());
        let field_file = sandbox.scratch_path().join("field.txt");

        let handle = sandbox.handle();
        token.on_cancel(move |cause| handle.terminate(anyhow::Error::new(cause)));

        Ok(SandboxPlayer {
            sandbox,
            stdout,
            field_file,
        })
    }

    /// The error that explains a vanished player: the recorded cancellation
    /// cause if there is one, the exit-code classification otherwise.
    fn terminated(&mut self) -> anyhow::Error {
        let result = self.sandbox.wait_result();
        match result.cause {
            Some(cause) => cause,
            None => anyhow::Error::new(Terminated::from_exit_code(result.exit_code)),
        }
    }
}

impl Player for SandboxPlayer {
    #[instrument(skip(self))]
    fn send_command(&mut self, cmd: &str) -> anyhow::Result<String> {
        let stdin = self.sandbox.stdin();
        stdin
            .write_all(cmd.as_bytes())
            .and_then(|()| stdin.write_all(b"\n"))
            .and_then(|()| stdin.flush())
            .context("could not send command")?;

        let mut line = String::new();
        let n = self
            .stdout
            .read_line(&mut line)
            .context("could not read response")?;
        if n == 0 {
            return Err(self.terminated());
        }

        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        trace!(response = %line);
        Ok(line)
    }

    fn retrieve_field(&mut self, conf: &Configuration) -> anyhow::Result<Box<dyn Field>> {
        let reader = match self.sandbox.read_file(&self.field_file) {
            Ok(reader) => reader,
            Err(e) => {
                if !self.sandbox.is_alive() {
                    return Err(self.terminated());
                }
                return Err(e).context("could not open field dump");
            }
        };

        let field = ShipField::load(*conf, parse_ships(reader))?;
        Ok(Box::new(field))
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.sandbox.close()
    }

    fn dump_path(&self) -> String {
        self.field_file.display().to_string()
    }
}

/// Builds [`SandboxPlayer`] sessions for one submission binary.
pub struct SandboxPlayerFactory {
    runner: SandboxRunner,
    program: PathBuf,
}

impl SandboxPlayerFactory {
    pub fn new(runner: SandboxRunner, program: PathBuf) -> SandboxPlayerFactory {
        SandboxPlayerFactory { runner, program }
    }
}

impl PlayerFactory for SandboxPlayerFactory {
    fn new_player(&self, token: &CancelToken) -> anyhow::Result<Box<dyn Player>> {
        let player = SandboxPlayer::new(&self.runner, token, &self.program)
            .context("could not launch player sandbox")?;
        Ok(Box::new(player))
    }
}

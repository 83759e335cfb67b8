//! This module contains the concrete execution sandbox: a separate OS process
//! that runs invocations of the instrumented program, so that a crash,
//! an exit request or a runaway loop in the program cannot take the generator
//! down with it.
//!
//! The generator side of the sandbox is [`Sandbox`], which owns one process
//! and respawns it whenever it has to be killed. [`pool::SandboxPool`] hands
//! out sandboxes to concurrent workers. The process side is [`child::serve`],
//! run by the `stg-sandbox` binary.

pub mod child;
pub mod interpreter;
pub mod pool;
pub mod protocol;

use std::{
    io::{BufRead, BufReader, Write},
    path::PathBuf,
    process::{Child, ChildStdin, Command, Stdio},
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError},
        Arc,
    },
    thread,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;
use wait_timeout::ChildExt;

use crate::{
    constant::{
        DEFAULT_CONCRETE_TIMEOUT_MS,
        DEFAULT_SANDBOX_STARTUP_TIMEOUT_MS,
        SANDBOX_ENVIRONMENT,
        SANDBOX_EXECUTABLE,
        SANDBOX_SHUTDOWN_GRACE_MS,
    },
    error::sandbox::{Error, Result},
    program::Program,
    sandbox::protocol::{Invocation, InvocationRequest, InvocationResponse, Outcome, Request, Response},
};

/// The configuration for the sandbox processes.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The sandbox executable to spawn.
    ///
    /// Defaults to [`SANDBOX_EXECUTABLE`], looked up on the `PATH`.
    pub executable: PathBuf,

    /// The time a fresh process has to acknowledge the program.
    ///
    /// Defaults to [`DEFAULT_SANDBOX_STARTUP_TIMEOUT_MS`].
    pub startup_timeout_ms: u64,

    /// The budget of an invocation that does not name its own.
    ///
    /// Defaults to [`DEFAULT_CONCRETE_TIMEOUT_MS`].
    pub default_timeout_ms: u64,

    /// The limits of the interpreter inside the process.
    pub interpreter: interpreter::Config,
}

impl Config {
    /// Sets the `executable` config parameter to `value`.
    #[must_use]
    pub fn with_executable(mut self, value: impl Into<PathBuf>) -> Self {
        self.executable = value.into();
        self
    }

    /// Sets the `startup_timeout_ms` config parameter to `value`.
    #[must_use]
    pub fn with_startup_timeout_ms(mut self, value: u64) -> Self {
        self.startup_timeout_ms = value;
        self
    }

    /// Sets the `default_timeout_ms` config parameter to `value`.
    #[must_use]
    pub fn with_default_timeout_ms(mut self, value: u64) -> Self {
        self.default_timeout_ms = value;
        self
    }

    /// Sets the `interpreter` config parameter to `value`.
    #[must_use]
    pub fn with_interpreter(mut self, value: interpreter::Config) -> Self {
        self.interpreter = value;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            executable:         PathBuf::from(SANDBOX_EXECUTABLE),
            startup_timeout_ms: DEFAULT_SANDBOX_STARTUP_TIMEOUT_MS,
            default_timeout_ms: DEFAULT_CONCRETE_TIMEOUT_MS,
            interpreter:        interpreter::Config::default(),
        }
    }
}

/// A running sandbox process.
#[derive(Debug)]
struct Process {
    child:     Child,
    stdin:     ChildStdin,
    responses: Receiver<String>,
}

/// A handle to a sandbox process with a program loaded into it.
///
/// The process is killed when an invocation exceeds its budget, and is
/// replaced by a fresh one on the next invocation.
#[derive(Debug)]
pub struct Sandbox {
    id:           Uuid,
    config:       Config,
    program:      Arc<Program>,
    process:      Option<Process>,
    next_request: u64,
}

impl Sandbox {
    /// Spawns a sandbox process and loads `program` into it.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the process cannot be started or does not accept the
    /// program in time.
    pub fn spawn(config: Config, program: Arc<Program>) -> Result<Self> {
        let mut sandbox = Self {
            id: Uuid::new_v4(),
            config,
            program,
            process: None,
            next_request: 0,
        };
        sandbox.process()?;
        Ok(sandbox)
    }

    /// Gets the unique identifier of the sandbox.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Gets the configuration of the sandbox.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Gets the number of invocations sent to the sandbox so far.
    #[must_use]
    pub fn invocations(&self) -> u64 {
        self.next_request
    }

    /// Checks if a process is currently running for the sandbox.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.process.is_some()
    }

    /// Prepares the loaded program for invocations.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the process does not acknowledge the request.
    pub fn warmup(&mut self) -> Result<()> {
        let timeout = Duration::from_millis(self.config.startup_timeout_ms);
        let process = self.process()?;
        write_line(&mut process.stdin, &Request::Warmup)?;
        match receive(process, timeout)? {
            Response::WarmedUp => Ok(()),
            Response::Rejected { message } => Err(Error::Rejected { message }),
            other => Err(unexpected(&other)),
        }
    }

    /// Runs `invocation` in the sandbox.
    ///
    /// An invocation that exceeds its budget kills the process and is reported
    /// as [`Outcome::Timeout`]. One during which the process dies, for
    /// example because the program asked to exit, is reported as
    /// [`Outcome::SandboxCrashed`].
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if no process can be started, or if the process rejects
    /// the invocation or answers with something other than its result.
    pub fn invoke(&mut self, invocation: Invocation) -> Result<InvocationResponse> {
        let id = self.next_request;
        self.next_request += 1;
        let timeout_ms = invocation.timeout_ms;
        let method = invocation.method.clone();

        let process = self.process()?;
        let request = Request::Invoke(InvocationRequest { id, invocation });
        if let Err(e) = write_line(&mut process.stdin, &request) {
            debug!(sandbox = %self.id, error = %e, "Could not send invocation");
            return Ok(self.crashed(id));
        }

        match process.responses.recv_timeout(Duration::from_millis(timeout_ms)) {
            Ok(line) => match serde_json::from_str::<Response>(&line)? {
                Response::Invoked(response) if response.id == id => Ok(response),
                Response::Invoked(response) => Err(Error::MismatchedResponse {
                    expected: id,
                    received: response.id,
                }),
                Response::Rejected { message } => Err(Error::Rejected { message }),
                other => Err(unexpected(&other)),
            },
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    sandbox = %self.id,
                    method = %method,
                    timeout_ms,
                    "Invocation timed out, killing sandbox"
                );
                self.kill();
                Ok(InvocationResponse::without_observations(id, Outcome::Timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Ok(self.crashed(id)),
        }
    }

    /// Runs `invocation`, running it once more in a fresh process if the
    /// first attempt timed out or crashed.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] under the same conditions as [`Self::invoke`].
    pub fn invoke_with_retry(&mut self, invocation: Invocation) -> Result<InvocationResponse> {
        self.invoke_with_retry_unless(invocation, |_| false)
    }

    /// Runs `invocation` like [`Self::invoke_with_retry`], except that a
    /// timeout or crash for which `expected` holds is returned without
    /// running the invocation again.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] under the same conditions as [`Self::invoke`].
    pub fn invoke_with_retry_unless(
        &mut self,
        invocation: Invocation,
        expected: impl Fn(&Outcome) -> bool,
    ) -> Result<InvocationResponse> {
        let response = self.invoke(invocation.clone())?;
        if response.outcome.is_undetermined() && !expected(&response.outcome) {
            debug!(sandbox = %self.id, outcome = %response.outcome, "Retrying invocation");
            return self.invoke(invocation);
        }
        Ok(response)
    }

    /// Gets the running process, spawning and loading a fresh one if needed.
    fn process(&mut self) -> Result<&mut Process> {
        let process = match self.process.take() {
            Some(process) => process,
            None => self.start()?,
        };
        Ok(self.process.insert(process))
    }

    fn start(&self) -> Result<Process> {
        let mut command = Command::new(&self.config.executable);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .env_clear();
        for name in SANDBOX_ENVIRONMENT {
            if let Ok(value) = std::env::var(name) {
                command.env(name, value);
            }
        }

        let spawn_error = |reason: String| Error::Spawn {
            executable: self.config.executable.display().to_string(),
            reason,
        };
        let mut child = command.spawn().map_err(|e| spawn_error(e.to_string()))?;
        let stdin = child.stdin.take().ok_or_else(|| spawn_error("no stdin".into()))?;
        let stdout = child.stdout.take().ok_or_else(|| spawn_error("no stdout".into()))?;

        let (sender, responses) = mpsc::channel();
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                if sender.send(line).is_err() {
                    break;
                }
            }
        });

        let mut process = Process {
            child,
            stdin,
            responses,
        };
        let load = Request::Load {
            program: self.program.clone(),
            config:  self.config.interpreter.clone(),
        };
        let timeout = Duration::from_millis(self.config.startup_timeout_ms);
        let loaded = write_line(&mut process.stdin, &load).and_then(|()| receive(&process, timeout));
        match loaded {
            Ok(Response::Loaded) => {
                info!(sandbox = %self.id, pid = process.child.id(), "Started sandbox process");
                Ok(process)
            }
            other => {
                terminate(process, Duration::ZERO);
                match other {
                    Ok(Response::Rejected { message }) => Err(Error::Rejected { message }),
                    Ok(response) => Err(unexpected(&response)),
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Kills the running process, if any.
    fn kill(&mut self) {
        if let Some(process) = self.process.take() {
            terminate(process, Duration::ZERO);
        }
    }

    /// Reaps a process that stopped answering, producing the response that
    /// describes it.
    fn crashed(&mut self, id: u64) -> InvocationResponse {
        let exit_code = self
            .process
            .take()
            .and_then(|p| terminate(p, Duration::from_millis(SANDBOX_SHUTDOWN_GRACE_MS)));
        warn!(sandbox = %self.id, ?exit_code, "Sandbox process died during invocation");
        InvocationResponse::without_observations(id, Outcome::SandboxCrashed { exit_code })
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if let Some(mut process) = self.process.take() {
            let _ = write_line(&mut process.stdin, &Request::Shutdown);
            terminate(process, Duration::from_millis(SANDBOX_SHUTDOWN_GRACE_MS));
        }
    }
}

/// Waits up to `grace` for `process` to exit on its own and kills it
/// otherwise, returning its exit code if it had one.
fn terminate(process: Process, grace: Duration) -> Option<i32> {
    let Process { mut child, stdin, .. } = process;
    drop(stdin);
    match child.wait_timeout(grace) {
        Ok(Some(status)) => status.code(),
        _ => {
            let _ = child.kill();
            child.wait().ok().and_then(|status| status.code())
        }
    }
}

fn write_line(stdin: &mut ChildStdin, request: &Request) -> Result<()> {
    let mut line = serde_json::to_vec(request)?;
    line.push(b'\n');
    stdin.write_all(&line)?;
    stdin.flush()?;
    Ok(())
}

fn receive(process: &Process, timeout: Duration) -> Result<Response> {
    match process.responses.recv_timeout(timeout) {
        Ok(line) => Ok(serde_json::from_str(&line)?),
        Err(RecvTimeoutError::Timeout) => Err(Error::StartupTimeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
        Err(RecvTimeoutError::Disconnected) => Err(Error::Io {
            reason: "sandbox process closed its output".to_string(),
        }),
    }
}

fn unexpected(response: &Response) -> Error {
    Error::Protocol {
        reason: format!("unexpected response {response:?}"),
    }
}

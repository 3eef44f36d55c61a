//! Test doubles shared across unit and integration tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex, MutexGuard as StdMutexGuard, PoisonError};

use camino::Utf8Path;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

use crate::process::{LaunchFuture, ProcessError, ProcessLauncher, ProcessOutcome, ProcessSpec};
use crate::runner::{CommandOutput, CommandRunner, RunnerError};
use crate::store::{ObjectStore, StoreError, StoreKind};

fn lock<T>(mutex: &Mutex<T>) -> StdMutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a specific exit code.
    pub fn push_exit_code(&self, code: i32) {
        self.push_output(Some(code), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, RunnerError> {
        lock(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        lock(&self.responses)
            .pop_front()
            .ok_or_else(|| RunnerError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// Scripted process launcher recording every spec it is asked to start.
#[derive(Clone, Debug, Default)]
pub struct ScriptedLauncher {
    outcomes: Arc<Mutex<VecDeque<Result<ProcessOutcome, ProcessError>>>>,
    specs: Arc<Mutex<Vec<ProcessSpec>>>,
}

impl ScriptedLauncher {
    /// Creates a launcher with no queued outcomes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a completed process with the given exit code and stdout.
    pub fn push_exit(&self, code: i32, stdout: impl Into<String>) {
        lock(&self.outcomes).push_back(Ok(ProcessOutcome::Exited {
            code: Some(code),
            stdout: stdout.into(),
            stderr: String::new(),
        }));
    }

    /// Queues an arbitrary outcome.
    pub fn push_outcome(&self, outcome: Result<ProcessOutcome, ProcessError>) {
        lock(&self.outcomes).push_back(outcome);
    }

    /// Specs launched so far, in order.
    #[must_use]
    pub fn specs(&self) -> Vec<ProcessSpec> {
        lock(&self.specs).clone()
    }
}

impl ProcessLauncher for ScriptedLauncher {
    fn launch<'a>(&'a self, spec: &'a ProcessSpec) -> LaunchFuture<'a> {
        lock(&self.specs).push(spec.clone());
        let outcome = lock(&self.outcomes).pop_front().unwrap_or_else(|| {
            Err(ProcessError::Spawn {
                program: spec.program.clone(),
                message: String::from("no scripted outcome available"),
            })
        });
        Box::pin(async move { outcome })
    }
}

/// In-memory object store recording every transfer.
#[derive(Clone, Debug)]
pub struct MemoryStore {
    kind: StoreKind,
    objects: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    uploads: Arc<Mutex<Vec<String>>>,
}

impl MemoryStore {
    /// Creates an empty store of the given flavour.
    #[must_use]
    pub fn new(kind: StoreKind) -> Self {
        Self {
            kind,
            objects: Arc::default(),
            uploads: Arc::default(),
        }
    }

    /// URIs uploaded so far, in order.
    #[must_use]
    pub fn uploads(&self) -> Vec<String> {
        lock(&self.uploads).clone()
    }

    /// Contents stored at `uri`, if any.
    #[must_use]
    pub fn object(&self, uri: &str) -> Option<Vec<u8>> {
        lock(&self.objects).get(uri).cloned()
    }
}

impl ObjectStore for MemoryStore {
    fn kind(&self) -> StoreKind {
        self.kind
    }

    fn exists(&self, uri: &str) -> Result<bool, StoreError> {
        Ok(lock(&self.objects).contains_key(uri))
    }

    fn upload(&self, local: &Utf8Path, uri: &str) -> Result<(), StoreError> {
        let bytes = std::fs::read(local).map_err(|err| StoreError::Archive {
            path: local.to_string(),
            message: err.to_string(),
        })?;
        lock(&self.objects).insert(uri.to_owned(), bytes);
        lock(&self.uploads).push(uri.to_owned());
        Ok(())
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets an environment variable while holding a global mutex.
    pub async fn set_var(key: &str, value: &str) -> Self {
        Self::set_vars(&[(key, value)]).await
    }

    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}

//! Runs bundles on a remote host over SSH.

use std::ffi::OsString;

use super::{
    BackendError, BackendFuture, BackendOptions, CommandPlan, LaunchBackend, LaunchOutcome,
    LaunchRequest, execute_plan,
};
use crate::config::SatchelConfig;
use crate::credentials::SshCredentials;
use crate::process::{GroupProcessLauncher, ProcessLauncher, ProcessSpec};
use crate::script::quote;

/// Remote path the bundle is copied to, relative to the login directory.
pub const REMOTE_SCRIPT: &str = "./satchel_script.sh";

/// `ssh`/`scp` executables and connection options.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshOptions {
    /// Path to the `ssh` executable.
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    pub scp_bin: String,
    /// Force batch mode to avoid password prompts.
    pub batch_mode: bool,
    /// Enforce host key checking.
    pub strict_host_key_checking: bool,
    /// Known hosts file override; blank leaves the default.
    pub known_hosts_file: String,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self::from_config(&SatchelConfig::default())
    }
}

impl SshOptions {
    /// Options taken from the tool configuration.
    #[must_use]
    pub fn from_config(config: &SatchelConfig) -> Self {
        Self {
            ssh_bin: config.ssh_bin.clone(),
            scp_bin: config.scp_bin.clone(),
            batch_mode: config.ssh_batch_mode,
            strict_host_key_checking: config.ssh_strict_host_key_checking,
            known_hosts_file: config.ssh_known_hosts_file.clone(),
        }
    }
}

/// Backend copying the bundle with `scp`, running it with `ssh` and removing
/// it afterwards.
#[derive(Clone, Debug)]
pub struct SshBackend<L: ProcessLauncher> {
    launcher: L,
    credentials: SshCredentials,
    ssh: SshOptions,
    options: BackendOptions,
}

impl SshBackend<GroupProcessLauncher> {
    /// Creates a backend spawning real processes.
    #[must_use]
    pub fn with_process_launcher(
        credentials: SshCredentials,
        ssh: SshOptions,
        options: BackendOptions,
    ) -> Self {
        Self::new(GroupProcessLauncher::default(), credentials, ssh, options)
    }
}

impl<L: ProcessLauncher> SshBackend<L> {
    /// Creates a backend using `launcher`.
    pub const fn new(
        launcher: L,
        credentials: SshCredentials,
        ssh: SshOptions,
        options: BackendOptions,
    ) -> Self {
        Self {
            launcher,
            credentials,
            ssh,
            options,
        }
    }

    /// Commands this backend runs for `request`.
    #[must_use]
    pub fn plan(&self, request: &LaunchRequest) -> CommandPlan {
        let copy = ProcessSpec::new(&self.ssh.scp_bin)
            .args(self.common_options())
            .args([
                OsString::from(request.script.as_str()),
                OsString::from(format!("{}:{REMOTE_SCRIPT}", self.credentials.user_host())),
            ]);

        let mut remote = vec![
            quote(&self.options.shell_interpreter),
            String::from(REMOTE_SCRIPT),
            String::from("--quiet"),
            String::from("--"),
        ];
        remote.extend(request.cli_args.iter().map(|arg| quote(arg)));
        let run = self.remote(&remote.join(" "));
        let remove = self.remote(&format!("rm -f {REMOTE_SCRIPT}"));

        CommandPlan {
            setup: vec![copy],
            main: Some(run),
            cleanup: vec![remove],
        }
    }

    fn remote(&self, command: &str) -> ProcessSpec {
        ProcessSpec::new(&self.ssh.ssh_bin)
            .args(self.common_options())
            .args([
                OsString::from(self.credentials.user_host()),
                OsString::from(command),
            ])
    }

    fn common_options(&self) -> Vec<OsString> {
        let mut args = Vec::new();
        if let Some(identity_file) = &self.credentials.identity_file {
            args.push(OsString::from("-i"));
            args.push(OsString::from(identity_file));
        }
        if self.ssh.batch_mode {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }
        if !self.ssh.strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }
        if !self.ssh.known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.ssh.known_hosts_file
            )));
        }
        args
    }
}

impl<L: ProcessLauncher> LaunchBackend for SshBackend<L> {
    fn name(&self) -> &'static str {
        "ssh"
    }

    fn launch<'a>(
        &'a self,
        request: &'a LaunchRequest,
    ) -> BackendFuture<'a, LaunchOutcome, BackendError> {
        Box::pin(async move {
            tracing::info!(host = %self.credentials.hostname, "launching over ssh");
            execute_plan(&self.launcher, self.plan(request), request, &self.options).await
        })
    }
}

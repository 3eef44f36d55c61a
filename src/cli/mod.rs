//! Command-line interface definitions for the `satchel` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Parser, ValueEnum};

/// Top-level CLI for the `satchel` binary.
#[derive(Debug, Parser)]
#[command(
    name = "satchel",
    about = "Package code, data and a command into one bundle and run it anywhere",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Bundle a command with its mounts and run it on a backend.
    #[command(
        name = "run-command",
        about = "Bundle a command with its mounts and run it on a backend"
    )]
    RunCommand(RunCommandArgs),
}

/// Where the bundle runs.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub(crate) enum Mode {
    /// The local shell.
    #[default]
    Local,
    /// A remote host over SSH.
    Ssh,
    /// A local Docker container.
    Docker,
    /// An EC2 spot instance.
    Ec2,
    /// A GCE instance.
    Gce,
}

/// Arguments for `satchel run-command`.
#[derive(Debug, Parser)]
pub(crate) struct RunCommandArgs {
    /// Shell command executed inside the bundle.
    #[arg(required = true, value_name = "COMMAND")]
    pub(crate) command: String,
    /// Arguments forwarded to the command as "$@" (must come last).
    #[arg(
        long = "cli-args",
        value_name = "ARG",
        num_args = 1..,
        allow_hyphen_values = true
    )]
    pub(crate) cli_args: Vec<String>,
    /// Backend running the bundle.
    #[arg(long, value_enum, default_value_t = Mode::Local)]
    pub(crate) mode: Mode,
    /// Read-only local directory, optionally followed by `:MOUNT_POINT`.
    #[arg(long = "mount-local", value_name = "SOURCE[:MOUNT_POINT]")]
    pub(crate) mount_local: Vec<String>,
    /// Output mount. Local, SSH and Docker runs take `SOURCE:MOUNT_POINT`;
    /// cloud runs take a path relative to `/satchel` that is synced to the
    /// bucket.
    #[arg(long = "mount-output", value_name = "SPEC")]
    pub(crate) mount_output: Vec<String>,
    /// Git repository cloned at run time, as `URL:MOUNT_POINT`.
    #[arg(long = "mount-git", value_name = "URL:MOUNT_POINT")]
    pub(crate) mount_git: Vec<String>,
    /// Add local and git mounts to the interpreter search path.
    #[arg(long = "search-path")]
    pub(crate) search_path: bool,
    /// Print bundle metadata and enable info logging.
    #[arg(long)]
    pub(crate) verbose: bool,
    /// Print the commands that would run without running them.
    #[arg(long = "dry-run")]
    pub(crate) dry_run: bool,
    /// Return as soon as a local, SSH or Docker run has started.
    #[arg(long)]
    pub(crate) detach: bool,
    /// Kill local, SSH or Docker runs after this many seconds.
    #[arg(long, value_name = "SECONDS")]
    pub(crate) timeout: Option<u64>,
    /// Image used by the Docker backend.
    #[arg(long, value_name = "IMAGE")]
    pub(crate) image: Option<String>,
    /// Run the payload inside this Docker image from within the bundle.
    #[arg(long, value_name = "IMAGE")]
    pub(crate) container: Option<String>,
    /// Pass GPUs through to containers; with `--mode gce`, the accelerator
    /// as `MODEL[:COUNT]`.
    #[arg(long, value_name = "MODEL[:COUNT]", num_args = 0..=1, default_missing_value = "all")]
    pub(crate) gpu: Option<String>,
    /// SSH destination for `--mode ssh`.
    #[arg(long = "ssh-host", value_name = "USER@HOST")]
    pub(crate) ssh_host: Option<String>,
    /// Region for `--mode ec2`.
    #[arg(long, value_name = "REGION", default_value = "auto")]
    pub(crate) region: String,
    /// Zone for `--mode gce`.
    #[arg(long, value_name = "ZONE", default_value = "auto")]
    pub(crate) zone: String,
    /// Project for `--mode gce`.
    #[arg(long, value_name = "PROJECT")]
    pub(crate) project: Option<String>,
    /// Bucket for `--mode gce`; EC2 runs use the autoconfig bucket.
    #[arg(long, value_name = "BUCKET")]
    pub(crate) bucket: Option<String>,
    /// Instance type for cloud runs.
    #[arg(long = "instance-type", value_name = "TYPE")]
    pub(crate) instance_type: Option<String>,
}

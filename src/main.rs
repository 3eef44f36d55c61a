//! Binary entry point for the satchel CLI.

use std::io::{self, Write};
use std::process;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use satchel::{
    Autoconfig, BackendOptions, ComputeConfig, ComputeInstanceBackend, ConfigError,
    ContainerSpec, CredentialsError, DockerBackend, GcpCredentials, GitMount, GpuSpec,
    GroupProcessLauncher, LaunchBackend, LaunchError, LaunchOutcome, Launcher, LocalBackend,
    LocalMount, Mount, MountError, ObjectStoreMount, Placement, RunOptions, SatchelConfig,
    SpotConfig, SpotInstanceBackend, SshBackend, SshCredentials, SshOptions, StoreLocation,
};

mod cli;

use cli::{Cli, Mode, RunCommandArgs};

/// Exit status for failures that happen before the payload runs.
const PACKAGING_FAILURE_EXIT: i32 = 125;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid mount: {0}")]
    Mount(#[from] MountError),
    #[error("credentials error: {0}")]
    Credentials(#[from] CredentialsError),
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error("payload terminated without an exit status")]
    MissingExitCode,
}

impl CliError {
    const fn exit_code(&self) -> i32 {
        match self {
            Self::Mount(_) => PACKAGING_FAILURE_EXIT,
            Self::Launch(err) if err.is_packaging_failure() => PACKAGING_FAILURE_EXIT,
            _ => 1,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let Cli::RunCommand(ref args) = cli;
    init_logging(args.verbose);

    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            err.exit_code()
        }
    };

    process::exit(exit_code);
}

fn init_logging(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_env("SATCHEL_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .compact()
        .init();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::RunCommand(args) => run_command(args).await,
    }
}

async fn run_command(args: RunCommandArgs) -> Result<i32, CliError> {
    let config = SatchelConfig::load_without_cli_args()?;
    config.validate()?;

    let backend = build_backend(&args, &config)?;
    let options = run_options(&args, &config)?;
    let launcher = Launcher::from_boxed(config.archive_builder()?, backend);
    tracing::info!(backend = launcher.backend_name(), "running command");

    let outcome = launcher.run_command(&args.command, options).await?;
    report_outcome(&outcome)
}

fn build_backend(
    args: &RunCommandArgs,
    config: &SatchelConfig,
) -> Result<Box<dyn LaunchBackend>, CliError> {
    let options = BackendOptions::new(&config.shell_interpreter).with_run_async(args.detach);
    let launcher = GroupProcessLauncher::new(config.grace_period());
    let backend: Box<dyn LaunchBackend> = match args.mode {
        Mode::Local => Box::new(LocalBackend::new(launcher, options)),
        Mode::Ssh => {
            let destination = args.ssh_host.as_deref().ok_or_else(|| {
                CliError::InvalidArgument(String::from("--mode ssh requires --ssh-host"))
            })?;
            let credentials = SshCredentials::from_environment(destination)?;
            Box::new(SshBackend::new(
                launcher,
                credentials,
                SshOptions::from_config(config),
                options,
            ))
        }
        Mode::Docker => {
            let image = args.image.as_deref().ok_or_else(|| {
                CliError::InvalidArgument(String::from("--mode docker requires --image"))
            })?;
            Box::new(
                DockerBackend::new(launcher, image, options)
                    .with_docker_bin(&config.docker_bin)
                    .with_gpu(args.gpu.is_some()),
            )
        }
        Mode::Ec2 => {
            let autoconfig = Autoconfig::load(&config.autoconfig_path())?;
            let mut spot = match Placement::parse(&args.region) {
                Placement::Auto => SpotConfig::new(Placement::Auto, autoconfig.s3_bucket(), ""),
                Placement::Named(region) => SpotConfig::from_autoconfig(&autoconfig, &region)?,
            };
            config.shell_interpreter.clone_into(&mut spot.shell_interpreter);
            config.aws_bin.clone_into(&mut spot.aws_bin);
            if let Some(instance_type) = &args.instance_type {
                instance_type.clone_into(&mut spot.instance_type);
            }
            Box::new(SpotInstanceBackend::with_credentials(
                spot,
                &autoconfig.credentials(),
            ))
        }
        Mode::Gce => {
            let project = args.project.as_deref().ok_or_else(|| {
                CliError::InvalidArgument(String::from("--mode gce requires --project"))
            })?;
            let bucket = gce_bucket(args)?;
            let mut compute = ComputeConfig::new(project, Placement::parse(&args.zone), bucket);
            config.shell_interpreter.clone_into(&mut compute.shell_interpreter);
            config.gcloud_bin.clone_into(&mut compute.gcloud_bin);
            config.gsutil_bin.clone_into(&mut compute.gsutil_bin);
            if let Some(instance_type) = &args.instance_type {
                instance_type.clone_into(&mut compute.instance_type);
            }
            compute.gpu = args.gpu.as_deref().map(parse_gpu).transpose()?;
            Box::new(ComputeInstanceBackend::with_credentials(
                compute,
                &GcpCredentials::new(project),
            ))
        }
    };
    Ok(backend)
}

fn run_options(args: &RunCommandArgs, config: &SatchelConfig) -> Result<RunOptions, CliError> {
    let mut options = RunOptions::default()
        .cli_args(args.cli_args.clone())
        .dry(args.dry_run)
        .verbose(args.verbose)
        .return_output(!args.detach && matches!(args.mode, Mode::Local | Mode::Ssh | Mode::Docker))
        .timeout(args.timeout.map(Duration::from_secs))
        .container(
            args.container
                .as_ref()
                .map(|image| ContainerSpec::docker(image).with_gpu(args.gpu.is_some())),
        );

    for spec in &args.mount_local {
        let (source, mount_point) = split_local(spec);
        let mount = LocalMount::read_only(source, mount_point)?.with_search_path(args.search_path);
        options = options.mount(mount);
    }
    for spec in &args.mount_git {
        let (url, mount_point) = split_git(spec)?;
        options = options.mount(GitMount::new(url, mount_point)?.with_search_path(args.search_path));
    }
    for spec in &args.mount_output {
        options = options.mount(output_mount(args, config, spec)?);
    }
    Ok(options)
}

fn output_mount(
    args: &RunCommandArgs,
    config: &SatchelConfig,
    spec: &str,
) -> Result<Mount, CliError> {
    let mount: Mount = match args.mode {
        Mode::Local | Mode::Ssh | Mode::Docker => {
            let (source, mount_point) = split_local(spec);
            LocalMount::writable(source, mount_point)?.into()
        }
        Mode::Ec2 => {
            let autoconfig = Autoconfig::load(&config.autoconfig_path())?;
            ObjectStoreMount::output(StoreLocation::s3(autoconfig.s3_bucket()), spec)?.into()
        }
        Mode::Gce => ObjectStoreMount::output(StoreLocation::gcs(gce_bucket(args)?), spec)?.into(),
    };
    Ok(mount)
}

fn gce_bucket(args: &RunCommandArgs) -> Result<&str, CliError> {
    args.bucket
        .as_deref()
        .ok_or_else(|| CliError::InvalidArgument(String::from("--mode gce requires --bucket")))
}

fn split_local(spec: &str) -> (&str, Option<&str>) {
    spec.split_once(':')
        .map_or((spec, None), |(source, mount_point)| (source, Some(mount_point)))
}

fn split_git(spec: &str) -> Result<(&str, &str), CliError> {
    spec.rsplit_once(':')
        .filter(|(url, mount_point)| !url.is_empty() && mount_point.starts_with('/'))
        .ok_or_else(|| {
            CliError::InvalidArgument(format!(
                "--mount-git expects URL:/ABSOLUTE/MOUNT_POINT, got '{spec}'"
            ))
        })
}

fn parse_gpu(spec: &str) -> Result<GpuSpec, CliError> {
    let (model, count) = spec.split_once(':').unwrap_or((spec, "1"));
    let parsed = count.parse::<u32>().map_err(|_| {
        CliError::InvalidArgument(format!("invalid GPU count '{count}' in '{spec}'"))
    })?;
    Ok(GpuSpec {
        model: model.to_owned(),
        count: parsed,
    })
}

fn report_outcome(outcome: &LaunchOutcome) -> Result<i32, CliError> {
    let mut stdout = io::stdout();
    match outcome {
        LaunchOutcome::Captured { output, .. } => {
            write!(stdout, "{output}").ok();
        }
        LaunchOutcome::DryRun { commands } => {
            for command in commands {
                writeln!(stdout, "{command}").ok();
            }
        }
        LaunchOutcome::Detached { pid } => {
            if let Some(pid) = pid {
                writeln!(stdout, "started process group {pid}").ok();
            }
        }
        LaunchOutcome::Provisioned(receipt) => {
            writeln!(stdout, "job {} launched on {}", receipt.exp_name, receipt.backend).ok();
            writeln!(stdout, "outputs sync to {}", receipt.log_uri).ok();
            for warning in &receipt.warnings {
                writeln!(io::stderr(), "warning: {warning}").ok();
            }
        }
        LaunchOutcome::Completed { .. } => {}
    }
    stdout.flush().ok();
    outcome.exit_code().ok_or(CliError::MissingExitCode)
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "satchel: {err}").ok();
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("/data/in", ("/data/in", None))]
    #[case("/data/in:/sandbox/in", ("/data/in", Some("/sandbox/in")))]
    fn split_local_accepts_optional_mount_point(
        #[case] spec: &str,
        #[case] expected: (&str, Option<&str>),
    ) {
        assert_eq!(split_local(spec), expected);
    }

    #[rstest]
    #[case("https://github.com/acme/tools.git:/opt/tools", "https://github.com/acme/tools.git")]
    #[case("git@github.com:acme/tools.git:/opt/tools", "git@github.com:acme/tools.git")]
    fn split_git_takes_the_last_separator(#[case] spec: &str, #[case] url: &str) {
        assert_eq!(split_git(spec).expect("valid spec"), (url, "/opt/tools"));
    }

    #[test]
    fn split_git_rejects_relative_mount_points() {
        let err = split_git("https://github.com/acme/tools.git").expect_err("no mount point");

        assert!(matches!(err, CliError::InvalidArgument(_)));
        assert_eq!(err.exit_code(), 1);
    }

    #[rstest]
    #[case("nvidia-tesla-v100:2", "nvidia-tesla-v100", 2)]
    #[case("nvidia-tesla-p4", "nvidia-tesla-p4", 1)]
    fn parse_gpu_defaults_to_one(#[case] spec: &str, #[case] model: &str, #[case] count: u32) {
        assert_eq!(
            parse_gpu(spec).expect("gpu"),
            GpuSpec {
                model: model.to_owned(),
                count,
            }
        );
    }

    #[test]
    fn mount_errors_map_to_packaging_exit_code() {
        let err = CliError::from(
            LocalMount::writable("/tmp", Some("relative")).expect_err("relative mount point"),
        );

        assert_eq!(err.exit_code(), PACKAGING_FAILURE_EXIT);
    }

    #[test]
    fn completed_outcomes_report_the_child_exit_code() {
        assert_eq!(
            report_outcome(&LaunchOutcome::Completed { exit_code: Some(4) }).expect("code"),
            4
        );
        assert!(matches!(
            report_outcome(&LaunchOutcome::Completed { exit_code: None }),
            Err(CliError::MissingExitCode)
        ));
    }

    #[test]
    fn write_error_prefixes_the_tool_name() {
        let mut buf = Vec::new();
        write_error(&mut buf, &CliError::MissingExitCode);
        let rendered = String::from_utf8(buf).expect("utf8");

        assert_eq!(rendered, "satchel: payload terminated without an exit status\n");
    }
}

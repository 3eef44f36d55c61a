//! Runs bundles inside a container on the local host.

use std::ffi::OsString;

use super::{
    BackendError, BackendFuture, BackendOptions, CommandPlan, LaunchBackend, LaunchOutcome,
    LaunchRequest, execute_plan,
};
use crate::process::{GroupProcessLauncher, ProcessLauncher, ProcessSpec};

/// Directory the bundle's host directory is bound to inside the container.
pub const SCRIPT_MOUNT_ROOT: &str = "/satchel_launch";

/// Backend running the bundle with `docker run`.
#[derive(Clone, Debug)]
pub struct DockerBackend<L: ProcessLauncher> {
    launcher: L,
    docker_bin: String,
    image: String,
    gpu: bool,
    options: BackendOptions,
}

impl DockerBackend<GroupProcessLauncher> {
    /// Creates a backend spawning real processes.
    #[must_use]
    pub fn with_process_launcher(image: impl Into<String>, options: BackendOptions) -> Self {
        Self::new(GroupProcessLauncher::default(), image, options)
    }
}

impl<L: ProcessLauncher> DockerBackend<L> {
    /// Creates a backend running `image` through `launcher`.
    pub fn new(launcher: L, image: impl Into<String>, options: BackendOptions) -> Self {
        Self {
            launcher,
            docker_bin: String::from("docker"),
            image: image.into(),
            gpu: false,
            options,
        }
    }

    /// Overrides the `docker` executable.
    #[must_use]
    pub fn with_docker_bin(mut self, docker_bin: impl Into<String>) -> Self {
        self.docker_bin = docker_bin.into();
        self
    }

    /// Requests GPU passthrough.
    #[must_use]
    pub const fn with_gpu(mut self, gpu: bool) -> Self {
        self.gpu = gpu;
        self
    }

    /// Commands this backend runs for `request`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::InvalidScript`] when the bundle path has no
    /// file name.
    pub fn plan(&self, request: &LaunchRequest) -> Result<CommandPlan, BackendError> {
        let file_name = request.script_file_name()?;
        let mut args = vec![OsString::from("run"), OsString::from("--rm")];
        if self.gpu {
            args.push(OsString::from("--gpus"));
            args.push(OsString::from("all"));
        }
        args.extend([
            OsString::from("-v"),
            OsString::from(format!("{}:{SCRIPT_MOUNT_ROOT}", request.script_dir())),
            OsString::from(&self.image),
            OsString::from(&self.options.shell_interpreter),
            OsString::from(format!("{SCRIPT_MOUNT_ROOT}/{file_name}")),
            OsString::from("--quiet"),
            OsString::from("--"),
        ]);
        args.extend(request.cli_args.iter().map(OsString::from));
        Ok(CommandPlan::single(ProcessSpec::new(&self.docker_bin).args(args)))
    }
}

impl<L: ProcessLauncher> LaunchBackend for DockerBackend<L> {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn launch<'a>(
        &'a self,
        request: &'a LaunchRequest,
    ) -> BackendFuture<'a, LaunchOutcome, BackendError> {
        Box::pin(async move {
            let plan = self.plan(request)?;
            execute_plan(&self.launcher, plan, request, &self.options).await
        })
    }
}

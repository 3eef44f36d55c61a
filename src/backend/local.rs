//! Runs bundles with the host's shell.

use super::{
    BackendError, BackendFuture, BackendOptions, CommandPlan, LaunchBackend, LaunchOutcome,
    LaunchRequest, execute_plan,
};
use crate::archive::bundle_invocation;
use crate::process::{GroupProcessLauncher, ProcessLauncher};

/// Backend executing `<interpreter> <bundle> --quiet -- <args>` locally.
#[derive(Clone, Debug)]
pub struct LocalBackend<L: ProcessLauncher> {
    launcher: L,
    options: BackendOptions,
}

impl LocalBackend<GroupProcessLauncher> {
    /// Creates a backend spawning real process groups.
    #[must_use]
    pub fn with_process_launcher(options: BackendOptions) -> Self {
        Self::new(GroupProcessLauncher::default(), options)
    }
}

impl<L: ProcessLauncher> LocalBackend<L> {
    /// Creates a backend using `launcher`.
    pub const fn new(launcher: L, options: BackendOptions) -> Self {
        Self { launcher, options }
    }

    /// Commands this backend runs for `request`.
    #[must_use]
    pub fn plan(&self, request: &LaunchRequest) -> CommandPlan {
        CommandPlan::single(bundle_invocation(
            &self.options.shell_interpreter,
            &request.script,
            &request.cli_args,
        ))
    }
}

impl<L: ProcessLauncher> LaunchBackend for LocalBackend<L> {
    fn name(&self) -> &'static str {
        "local"
    }

    fn launch<'a>(
        &'a self,
        request: &'a LaunchRequest,
    ) -> BackendFuture<'a, LaunchOutcome, BackendError> {
        Box::pin(async move {
            execute_plan(&self.launcher, self.plan(request), request, &self.options).await
        })
    }
}

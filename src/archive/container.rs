//! Container hook scripts that run `run.sh` inside an image.

use crate::mount::Mount;
use crate::script::{ScriptBuilder, quote};

/// Directory the extracted bundle is bound to inside the container.
pub const CONTAINER_PAYLOAD_ROOT: &str = "/satchel_payload";

/// Supported container engines.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ContainerEngine {
    /// `docker run`.
    Docker,
    /// `singularity exec`.
    Singularity,
}

impl ContainerEngine {
    /// Default executable name.
    #[must_use]
    pub const fn binary(self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Singularity => "singularity",
        }
    }
}

/// Image and engine options for running a bundle in a container.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ContainerSpec {
    /// Image reference.
    pub image: String,
    /// Engine used to start the image.
    pub engine: ContainerEngine,
    /// Pass host GPUs through.
    pub gpu: bool,
}

impl ContainerSpec {
    /// Docker image without GPU passthrough.
    pub fn docker(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            engine: ContainerEngine::Docker,
            gpu: false,
        }
    }

    /// Enables GPU passthrough.
    #[must_use]
    pub const fn with_gpu(mut self, gpu: bool) -> Self {
        self.gpu = gpu;
        self
    }
}

/// Renders the hook invoking the engine with one bind per writable local
/// mount plus the current directory at [`CONTAINER_PAYLOAD_ROOT`].
pub(crate) fn container_script(spec: &ContainerSpec, mounts: &[Mount], entry: &str) -> ScriptBuilder {
    let (run, gpu_flag, bind_flag, workdir_flag) = match spec.engine {
        ContainerEngine::Docker => ("run --rm", "--gpus all", "-v", "-w"),
        ContainerEngine::Singularity => ("exec", "--nv", "--bind", "--pwd"),
    };

    let mut args = vec![run.to_owned()];
    if spec.gpu {
        args.push(gpu_flag.to_owned());
    }
    for (source, target) in mounts.iter().filter_map(Mount::container_bind) {
        args.push(format!("{bind_flag} {}", quote(&format!("{source}:{target}"))));
    }
    args.push(format!("{bind_flag} \"$(pwd)\":{CONTAINER_PAYLOAD_ROOT}"));
    args.push(format!("{workdir_flag} {CONTAINER_PAYLOAD_ROOT}"));
    args.push(quote(&spec.image));
    args.push(format!("/bin/sh ./{entry} \"$@\""));

    let mut script = ScriptBuilder::new();
    script.append(spec.engine.binary(), args);
    script
}

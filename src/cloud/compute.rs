//! Standard or preemptible compute instances driven through `gcloud`.

use std::ffi::OsString;
use std::sync::Arc;

use uuid::Uuid;

use super::bootstrap::{BootstrapScript, Provider};
use super::{
    CloudError, Placement, ProvisionReceipt, exp_name, job_base_path, scratch_dir, write_scratch,
};
use crate::backend::{BackendError, BackendFuture, LaunchBackend, LaunchOutcome, LaunchRequest};
use crate::credentials::GcpCredentials;
use crate::mount::DEFAULT_SYNC_INTERVAL_SECS;
use crate::process::ProcessSpec;
use crate::runner::{CommandRunner, EnvCommandRunner};
use crate::store::{GcsStore, ObjectStore, StoreLocation};

const BACKEND_NAME: &str = "compute instance";

/// Accelerator models accepted for GPU instances.
pub const ALLOWED_GPUS: [&str; 4] = [
    "nvidia-tesla-p4",
    "nvidia-tesla-k80",
    "nvidia-tesla-v100",
    "nvidia-tesla-p100",
];

/// Accelerator attached to the instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GpuSpec {
    /// Model name, one of [`ALLOWED_GPUS`].
    pub model: String,
    /// Number of accelerators.
    pub count: u32,
}

impl GpuSpec {
    fn validate(&self) -> Result<(), CloudError> {
        if ALLOWED_GPUS.contains(&self.model.as_str()) && self.count > 0 {
            Ok(())
        } else {
            Err(CloudError::InvalidGpu {
                model: self.model.clone(),
            })
        }
    }
}

/// Instance settings.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ComputeConfig {
    /// Project owning the instance.
    pub project: String,
    /// Zone to launch in; `auto` is rejected.
    pub zone: Placement,
    /// Machine type.
    pub instance_type: String,
    /// Boot image.
    pub image: String,
    /// Project the boot image belongs to.
    pub image_project: String,
    /// Boot disk size in GB.
    pub disk_size_gb: u32,
    /// Request a preemptible instance.
    pub preemptible: bool,
    /// Delete the instance after the payload exits.
    pub terminate_on_end: bool,
    /// Optional accelerator.
    pub gpu: Option<GpuSpec>,
    /// Job name prefix, also used as a label.
    pub label: String,
    /// Bucket receiving the bundle, outputs and logs.
    pub bucket: String,
    /// Path inside the bucket for job logs.
    pub log_path: String,
    /// Interpreter running the bundle on the instance.
    pub shell_interpreter: String,
    /// Seconds between periodic output syncs.
    pub sync_interval_secs: u64,
    /// Path to the `gcloud` executable.
    pub gcloud_bin: String,
    /// Path to the `gsutil` executable used for uploads.
    pub gsutil_bin: String,
}

impl ComputeConfig {
    /// Configuration with defaults for everything but project, zone and
    /// bucket.
    pub fn new(project: impl Into<String>, zone: Placement, bucket: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            zone,
            instance_type: String::from("f1-micro"),
            image: String::from("ubuntu-1804-bionic-v20181222"),
            image_project: String::from("ubuntu-os-cloud"),
            disk_size_gb: 64,
            preemptible: true,
            terminate_on_end: true,
            gpu: None,
            label: String::from("satchel"),
            bucket: bucket.into(),
            log_path: String::from("satchel/logs"),
            shell_interpreter: String::from("sh"),
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            gcloud_bin: String::from("gcloud"),
            gsutil_bin: String::from("gsutil"),
        }
    }
}

/// Backend creating one compute instance per launch.
pub struct ComputeInstanceBackend<R: CommandRunner> {
    runner: R,
    store: Arc<dyn ObjectStore>,
    config: ComputeConfig,
}

impl<R: CommandRunner> std::fmt::Debug for ComputeInstanceBackend<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeInstanceBackend")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ComputeInstanceBackend<EnvCommandRunner> {
    /// Creates a backend whose `gcloud` and `gsutil` calls use `credentials`.
    #[must_use]
    pub fn with_credentials(config: ComputeConfig, credentials: &GcpCredentials) -> Self {
        let runner = EnvCommandRunner::new(credentials.env());
        let store = GcsStore::new(runner.clone()).with_gsutil_bin(&config.gsutil_bin);
        Self::new(runner, Arc::new(store), config)
    }
}

impl<R: CommandRunner> ComputeInstanceBackend<R> {
    /// Creates a backend from its parts.
    pub fn new(runner: R, store: Arc<dyn ObjectStore>, config: ComputeConfig) -> Self {
        Self {
            runner,
            store,
            config,
        }
    }

    fn provision(&self, request: &LaunchRequest, zone: &str) -> Result<LaunchOutcome, BackendError> {
        let config = &self.config;
        let file_name = request.script_file_name()?;
        let location = StoreLocation::gcs(&config.bucket);
        let bundle_uri = location.mount_uri(file_name);
        let name = exp_name(&config.label);
        let base = job_base_path(&config.log_path, &config.label, &name);
        let bootstrap = BootstrapScript {
            provider: Provider::Gce {
                zone: zone.to_owned(),
            },
            bundle_uri: bundle_uri.clone(),
            log_uri: location.uri(&format!("{base}/logs")),
            stdout_log_uri: location.uri(&format!("{base}/stdout.log")),
            shell_interpreter: config.shell_interpreter.clone(),
            exp_name: name.clone(),
            exp_prefix: config.label.clone(),
            cli_args: request.cli_args.clone(),
            swap_size_mib: 0,
            sync_interval_secs: config.sync_interval_secs,
            terminate_on_end: config.terminate_on_end,
        };
        let instance_name = format!("satchel{}", Uuid::new_v4().simple());

        if request.dry {
            let args = self.create_args(&instance_name, zone, &name, "startup.sh", "shutdown.sh");
            return Ok(LaunchOutcome::DryRun {
                commands: vec![
                    location
                        .kind
                        .copy_command(request.script.as_str(), &bundle_uri),
                    ProcessSpec::new(&config.gcloud_bin).args(args).command_line(),
                ],
            });
        }

        self.store
            .upload(&request.script, &bundle_uri)
            .map_err(CloudError::from)?;

        let scratch = scratch_dir("satchel-gce-")?;
        let startup = write_scratch(&scratch, "startup.sh", &bootstrap.render())?;
        let shutdown = write_scratch(&scratch, "shutdown.sh", &bootstrap.render_shutdown())?;
        let args = self.create_args(&instance_name, zone, &name, startup.as_str(), shutdown.as_str());
        tracing::info!(instance = %instance_name, zone, "creating compute instance");
        self.runner
            .run_checked(&config.gcloud_bin, &args)
            .map_err(CloudError::from)?;

        Ok(LaunchOutcome::Provisioned(ProvisionReceipt {
            backend: BACKEND_NAME,
            exp_name: name,
            instance_name: Some(instance_name),
            bundle_uri,
            log_uri: bootstrap.log_uri,
            tagged: true,
            ..ProvisionReceipt::default()
        }))
    }

    fn create_args(
        &self,
        instance_name: &str,
        zone: &str,
        exp_name: &str,
        startup: &str,
        shutdown: &str,
    ) -> Vec<OsString> {
        let config = &self.config;
        let mut args: Vec<OsString> = vec![
            "compute".into(),
            "instances".into(),
            "create".into(),
            instance_name.into(),
            "--project".into(),
            config.project.as_str().into(),
            "--zone".into(),
            zone.into(),
            "--machine-type".into(),
            config.instance_type.as_str().into(),
            "--image".into(),
            config.image.as_str().into(),
            "--image-project".into(),
            config.image_project.as_str().into(),
            "--boot-disk-size".into(),
            format!("{}GB", config.disk_size_gb).into(),
            "--scopes".into(),
            "cloud-platform".into(),
            "--maintenance-policy".into(),
            "TERMINATE".into(),
            "--no-restart-on-failure".into(),
            "--labels".into(),
            format!("exp_name={exp_name},exp_prefix={}", config.label).into(),
            "--metadata-from-file".into(),
            format!("startup-script={startup},shutdown-script={shutdown}").into(),
        ];
        if config.preemptible {
            args.push("--preemptible".into());
        }
        if let Some(gpu) = &config.gpu {
            args.push("--accelerator".into());
            args.push(format!("type={},count={}", gpu.model, gpu.count).into());
        }
        args.push("--format".into());
        args.push("json".into());
        args
    }
}

impl<R: CommandRunner> LaunchBackend for ComputeInstanceBackend<R> {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn launch<'a>(
        &'a self,
        request: &'a LaunchRequest,
    ) -> BackendFuture<'a, LaunchOutcome, BackendError> {
        Box::pin(async move {
            if request.return_output {
                return Err(CloudError::UnsupportedOperation {
                    backend: BACKEND_NAME,
                    operation: "return_output",
                }
                .into());
            }
            let zone = self.config.zone.resolve("zone")?.to_owned();
            if let Some(gpu) = &self.config.gpu {
                gpu.validate()?;
            }
            self.provision(request, &zone)
        })
    }
}

//! Spot-instance backend driven through the `aws` CLI.

use std::ffi::OsString;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::bootstrap::{BootstrapScript, OVERSIZE_PREFIX, Provider, exceeds_user_data_limit};
use super::tag::{TAG_ATTEMPTS, TagOutcome, tag_with_retry};
use super::{
    CloudError, Placement, ProvisionReceipt, exp_name, job_base_path, scratch_dir, write_scratch,
};
use crate::backend::{BackendError, BackendFuture, LaunchBackend, LaunchOutcome, LaunchRequest};
use crate::credentials::{Autoconfig, AwsCredentials, CredentialsError};
use crate::mount::DEFAULT_SYNC_INTERVAL_SECS;
use crate::process::ProcessSpec;
use crate::runner::{CommandRunner, EnvCommandRunner};
use crate::store::{ObjectStore, S3Store, StoreLocation};

const BACKEND_NAME: &str = "spot instance";

/// Spot request settings.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SpotConfig {
    /// Region to launch in; `auto` is rejected.
    pub region: Placement,
    /// Instance type.
    pub instance_type: String,
    /// Maximum hourly price; the on-demand price when unset.
    pub spot_price: Option<String>,
    /// IAM instance profile granting bucket access.
    pub iam_instance_profile: String,
    /// Machine image.
    pub image_id: String,
    /// Key pair for SSH access to the instance.
    pub key_name: Option<String>,
    /// Security group names.
    pub security_groups: Vec<String>,
    /// Security group ids.
    pub security_group_ids: Vec<String>,
    /// Terminate the instance after the payload exits.
    pub terminate_on_end: bool,
    /// Swap file size in MiB.
    pub swap_size_mib: u64,
    /// Seconds between periodic output syncs.
    pub sync_interval_secs: u64,
    /// Bucket receiving the bundle, outputs and logs.
    pub bucket: String,
    /// Path inside the bucket for job logs.
    pub log_path: String,
    /// Job name prefix.
    pub log_prefix: String,
    /// Interpreter running the bundle on the instance.
    pub shell_interpreter: String,
    /// Path to the `aws` executable.
    pub aws_bin: String,
    /// Pause between tag attempts.
    pub tag_retry_delay: Duration,
}

impl SpotConfig {
    /// Configuration with defaults for everything but placement, bucket and
    /// image.
    pub fn new(region: Placement, bucket: impl Into<String>, image_id: impl Into<String>) -> Self {
        Self {
            region,
            instance_type: String::from("t3.micro"),
            spot_price: None,
            iam_instance_profile: String::from("satchel"),
            image_id: image_id.into(),
            key_name: None,
            security_groups: Vec::new(),
            security_group_ids: Vec::new(),
            terminate_on_end: true,
            swap_size_mib: 4096,
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            bucket: bucket.into(),
            log_path: String::from("satchel/logs"),
            log_prefix: String::from("satchel"),
            shell_interpreter: String::from("sh"),
            aws_bin: String::from("aws"),
            tag_retry_delay: Duration::from_secs(1),
        }
    }

    /// Configuration for `region` filled from the autoconfig file.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialsError::MissingRegion`] when the file has no
    /// image for `region`.
    pub fn from_autoconfig(autoconfig: &Autoconfig, region: &str) -> Result<Self, CredentialsError> {
        let mut config = Self::new(
            Placement::parse(region),
            autoconfig.s3_bucket(),
            autoconfig.image_id(region)?,
        );
        config.key_name = autoconfig.key_name(region).ok().map(str::to_owned);
        autoconfig.iam_profile_name().clone_into(&mut config.iam_instance_profile);
        config.security_groups = autoconfig.security_groups().to_vec();
        config.security_group_ids = autoconfig.security_group_ids(region).to_vec();
        Ok(config)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct LaunchSpecification<'a> {
    image_id: &'a str,
    instance_type: &'a str,
    user_data: String,
    iam_instance_profile: IamProfile<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    key_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    security_groups: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    security_group_ids: Option<&'a [String]>,
    ebs_optimized: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct IamProfile<'a> {
    name: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SpotResponse {
    spot_instance_requests: Vec<SpotRequest>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SpotRequest {
    spot_instance_request_id: String,
}

/// Backend requesting one spot instance per launch.
pub struct SpotInstanceBackend<R: CommandRunner> {
    runner: R,
    store: Arc<dyn ObjectStore>,
    config: SpotConfig,
}

impl<R: CommandRunner> std::fmt::Debug for SpotInstanceBackend<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpotInstanceBackend")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SpotInstanceBackend<EnvCommandRunner> {
    /// Creates a backend whose `aws` calls use `credentials`.
    #[must_use]
    pub fn with_credentials(config: SpotConfig, credentials: &AwsCredentials) -> Self {
        let runner = EnvCommandRunner::new(credentials.env());
        let region = match &config.region {
            Placement::Named(region) => Some(region.clone()),
            Placement::Auto => None,
        };
        let store = S3Store::new(runner.clone(), region).with_aws_bin(&config.aws_bin);
        Self::new(runner, Arc::new(store), config)
    }
}

impl<R: CommandRunner> SpotInstanceBackend<R> {
    /// Creates a backend from its parts.
    pub fn new(runner: R, store: Arc<dyn ObjectStore>, config: SpotConfig) -> Self {
        Self {
            runner,
            store,
            config,
        }
    }

    async fn provision(
        &self,
        request: &LaunchRequest,
        region: &str,
    ) -> Result<LaunchOutcome, BackendError> {
        let config = &self.config;
        let file_name = request.script_file_name()?;
        let location = StoreLocation::s3(&config.bucket);
        let bundle_uri = location.mount_uri(file_name);
        let name = exp_name(&config.log_prefix);
        let base = job_base_path(&config.log_path, &config.log_prefix, &name);
        let bootstrap = BootstrapScript {
            provider: Provider::Ec2 {
                region: region.to_owned(),
            },
            bundle_uri: bundle_uri.clone(),
            log_uri: location.uri(&format!("{base}/logs")),
            stdout_log_uri: location.uri(&format!("{base}/stdout.log")),
            shell_interpreter: config.shell_interpreter.clone(),
            exp_name: name.clone(),
            exp_prefix: config.log_prefix.clone(),
            cli_args: request.cli_args.clone(),
            swap_size_mib: config.swap_size_mib,
            sync_interval_secs: config.sync_interval_secs,
            terminate_on_end: config.terminate_on_end,
        };
        let script = bootstrap.render();
        let oversize = exceeds_user_data_limit(&script).then(|| {
            location.mount_uri(&format!("{OVERSIZE_PREFIX}/{}", Uuid::new_v4()))
        });
        let user_data = match &oversize {
            Some(uri) => bootstrap.oversize_stub(uri),
            None => script.clone(),
        };
        let args = self.request_args(region, &user_data)?;

        if request.dry {
            let mut commands = vec![
                location
                    .kind
                    .copy_command(request.script.as_str(), &bundle_uri),
            ];
            if let Some(uri) = &oversize {
                commands.push(location.kind.copy_command("<bootstrap>", uri));
            }
            commands.push(ProcessSpec::new(&config.aws_bin).args(args).command_line());
            return Ok(LaunchOutcome::DryRun { commands });
        }

        self.store
            .upload(&request.script, &bundle_uri)
            .map_err(CloudError::from)?;
        if let Some(uri) = &oversize {
            self.upload_bootstrap(&script, uri)?;
        }

        tracing::info!(exp_name = %name, region, "requesting spot instance");
        let output = self
            .runner
            .run_checked(&config.aws_bin, &args)
            .map_err(CloudError::from)?;
        let response: SpotResponse =
            serde_json::from_str(&output.stdout).map_err(|err| CloudError::Parse {
                what: "request-spot-instances response",
                message: err.to_string(),
            })?;
        let request_id = response
            .spot_instance_requests
            .into_iter()
            .next()
            .map(|req| req.spot_instance_request_id)
            .ok_or_else(|| CloudError::Parse {
                what: "request-spot-instances response",
                message: String::from("no spot instance requests returned"),
            })?;

        let mut receipt = ProvisionReceipt {
            backend: BACKEND_NAME,
            exp_name: name,
            request_id: Some(request_id),
            bundle_uri,
            log_uri: bootstrap.log_uri,
            ..ProvisionReceipt::default()
        };
        self.tag(region, &mut receipt).await;
        Ok(LaunchOutcome::Provisioned(receipt))
    }

    fn request_args(&self, region: &str, user_data: &str) -> Result<Vec<OsString>, CloudError> {
        let config = &self.config;
        let spec = LaunchSpecification {
            image_id: &config.image_id,
            instance_type: &config.instance_type,
            user_data: STANDARD.encode(user_data),
            iam_instance_profile: IamProfile {
                name: &config.iam_instance_profile,
            },
            key_name: config.key_name.as_deref(),
            security_groups: non_empty(&config.security_groups),
            security_group_ids: non_empty(&config.security_group_ids),
            ebs_optimized: false,
        };
        let spec_json = serde_json::to_string(&spec).map_err(|err| CloudError::Parse {
            what: "launch specification",
            message: err.to_string(),
        })?;

        let mut args: Vec<OsString> = [
            "ec2",
            "request-spot-instances",
            "--region",
            region,
            "--instance-count",
            "1",
            "--type",
            "one-time",
        ]
        .into_iter()
        .map(OsString::from)
        .collect();
        if let Some(price) = &config.spot_price {
            args.push(OsString::from("--spot-price"));
            args.push(OsString::from(price));
        }
        args.extend([
            OsString::from("--launch-specification"),
            OsString::from(spec_json),
            OsString::from("--output"),
            OsString::from("json"),
        ]);
        Ok(args)
    }

    fn upload_bootstrap(&self, script: &str, uri: &str) -> Result<(), CloudError> {
        let scratch = scratch_dir("satchel-bootstrap-")?;
        let path = write_scratch(&scratch, "bootstrap.sh", script)?;
        tracing::info!(%uri, "bootstrap exceeds the user-data limit, uploading it");
        self.store.upload(&path, uri)?;
        Ok(())
    }

    async fn tag(&self, region: &str, receipt: &mut ProvisionReceipt) {
        let Some(request_id) = receipt.request_id.clone() else {
            return;
        };
        let args: Vec<OsString> = [
            String::from("ec2"),
            String::from("create-tags"),
            String::from("--region"),
            region.to_owned(),
            String::from("--resources"),
            request_id,
            String::from("--tags"),
            format!("Key=Name,Value={}", receipt.exp_name),
            format!("Key=exp_prefix,Value={}", self.config.log_prefix),
        ]
        .into_iter()
        .map(OsString::from)
        .collect();

        let outcome = tag_with_retry(TAG_ATTEMPTS, self.config.tag_retry_delay, || {
            self.runner
                .run_checked(&self.config.aws_bin, &args)
                .map(|_| ())
        })
        .await;
        match outcome {
            TagOutcome::Tagged { .. } => receipt.tagged = true,
            TagOutcome::Exhausted { last_error } => receipt
                .warnings
                .push(format!("tagging spot request failed after {TAG_ATTEMPTS} attempts: {last_error}")),
        }
    }
}

impl<R: CommandRunner> LaunchBackend for SpotInstanceBackend<R> {
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
            let region = self.config.region.resolve("region")?.to_owned();
            self.provision(request, &region).await
        })
    }
}

fn non_empty(values: &[String]) -> Option<&[String]> {
    (!values.is_empty()).then_some(values)
}

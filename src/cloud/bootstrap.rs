//! Instance bootstrap scripts.
//!
//! The bootstrap downloads the bundle, keeps `/satchel` synced to the bucket
//! while the payload runs, flushes it once more when the provider announces
//! termination, and optionally terminates the instance at the end. Its own
//! output is appended to a log file that is synced alongside.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::mount::SANDBOX_SYNC_ROOT;
use crate::script::{BackgroundTask, ScriptBuilder, Trigger, quote};
use crate::store::StoreKind;

/// Largest user-data payload sent inline, in bytes of base64.
pub const USER_DATA_LIMIT: usize = 10_000;

/// Prefix below the mount prefix for bootstraps that exceed the limit.
pub const OVERSIZE_PREFIX: &str = "oversize_bash_scripts";

/// Bootstrap log on spot instances.
pub const EC2_LOG_FILE: &str = "/home/ubuntu/user_data.log";

/// Bootstrap log on compute instances.
pub const GCE_LOG_FILE: &str = "/var/log/satchel_startup.log";

const REMOTE_BUNDLE: &str = "/tmp/satchel_bundle.sh";
const OVERSIZE_LOCAL: &str = "/home/ubuntu/remote_script.sh";
const SWAP_FILE: &str = "/var/swap.1";
const INSTANCE_VAR: &str = "SATCHEL_INSTANCE_ID";
const EC2_METADATA: &str = "http://169.254.169.254/latest/meta-data";
const GCE_METADATA: &str = "http://metadata.google.internal/computeMetadata/v1/instance";
const TERMINATION_POLL_SECS: u64 = 3;

/// Cloud provider the bootstrap targets.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Provider {
    /// EC2 spot instance in `region`.
    Ec2 {
        /// Region the instance runs in.
        region: String,
    },
    /// GCE instance in `zone`.
    Gce {
        /// Zone the instance runs in.
        zone: String,
    },
}

impl Provider {
    /// Object store reachable from the instance.
    #[must_use]
    pub const fn store_kind(&self) -> StoreKind {
        match self {
            Self::Ec2 { .. } => StoreKind::S3,
            Self::Gce { .. } => StoreKind::Gcs,
        }
    }

    /// File the bootstrap appends its output to.
    #[must_use]
    pub const fn log_file(&self) -> &'static str {
        match self {
            Self::Ec2 { .. } => EC2_LOG_FILE,
            Self::Gce { .. } => GCE_LOG_FILE,
        }
    }

    fn instance_lookup(&self) -> String {
        match self {
            Self::Ec2 { .. } => format!("{INSTANCE_VAR}=\"$(curl -s {EC2_METADATA}/instance-id)\""),
            Self::Gce { .. } => format!(
                "{INSTANCE_VAR}=\"$(curl -s -H 'Metadata-Flavor: Google' {GCE_METADATA}/name)\""
            ),
        }
    }

    /// Succeeds while no termination notice has been posted.
    fn termination_check(&self) -> String {
        match self {
            Self::Ec2 { .. } => format!(
                "curl -Is {EC2_METADATA}/spot/termination-time | head -1 | grep -q 404"
            ),
            Self::Gce { .. } => format!(
                "[ \"$(curl -s -H 'Metadata-Flavor: Google' {GCE_METADATA}/preempted)\" != \"TRUE\" ]"
            ),
        }
    }

    fn install_cli(&self, script: &mut ScriptBuilder) {
        match self {
            Self::Ec2 { region } => {
                script.line(format!("export AWS_DEFAULT_REGION={}", quote(region)));
                script.line(
                    "command -v aws >/dev/null 2>&1 || { curl -s \
                     https://awscli.amazonaws.com/awscli-exe-linux-x86_64.zip -o /tmp/awscliv2.zip \
                     && unzip -q -o /tmp/awscliv2.zip -d /tmp && sudo /tmp/aws/install; }",
                );
            }
            Self::Gce { .. } => {
                script.line(
                    "command -v gsutil >/dev/null 2>&1 || { echo 'gsutil not found' >&2; exit 1; }",
                );
            }
        }
    }

    /// Tags the running instance with the job name and prefix. Compute
    /// instances are labelled at creation instead.
    fn self_tag(&self, exp_name: &str, exp_prefix: &str, script: &mut ScriptBuilder) {
        let Self::Ec2 { region } = self else {
            return;
        };
        for (key, value) in [("Name", exp_name), ("exp_prefix", exp_prefix)] {
            script.line(format!(
                "aws ec2 create-tags --resources \"${INSTANCE_VAR}\" --tags {} --region {}",
                quote(&format!("Key={key},Value={value}")),
                quote(region)
            ));
        }
    }

    fn start_container_engine(&self, script: &mut ScriptBuilder) {
        if matches!(self, Self::Ec2 { .. }) {
            script.line("command -v docker >/dev/null 2>&1 && sudo service docker start");
        }
    }

    fn terminate_command(&self) -> String {
        match self {
            Self::Ec2 { region } => format!(
                "aws ec2 terminate-instances --instance-ids \"${INSTANCE_VAR}\" --region {}",
                quote(region)
            ),
            Self::Gce { zone } => format!(
                "gcloud compute instances delete \"${INSTANCE_VAR}\" --zone {} --quiet",
                quote(zone)
            ),
        }
    }
}

/// Inputs to the bootstrap script.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BootstrapScript {
    /// Target provider.
    pub provider: Provider,
    /// Uploaded bundle.
    pub bundle_uri: String,
    /// Prefix receiving `/satchel`.
    pub log_uri: String,
    /// Object receiving the bootstrap log.
    pub stdout_log_uri: String,
    /// Interpreter running the bundle.
    pub shell_interpreter: String,
    /// Job name the instance is tagged with.
    pub exp_name: String,
    /// Job prefix the instance is tagged with.
    pub exp_prefix: String,
    /// Arguments forwarded to the payload.
    pub cli_args: Vec<String>,
    /// Swap file size in MiB; zero skips swap.
    pub swap_size_mib: u64,
    /// Seconds between periodic syncs.
    pub sync_interval_secs: u64,
    /// Terminate the instance after the payload finishes.
    pub terminate_on_end: bool,
}

impl BootstrapScript {
    /// Full startup script.
    #[must_use]
    pub fn render(&self) -> String {
        let log = self.provider.log_file();
        let kind = self.provider.store_kind();
        let mut body = ScriptBuilder::new();
        body.line(self.provider.instance_lookup());

        if self.swap_size_mib > 0 {
            body.line(format!(
                "sudo dd if=/dev/zero of={SWAP_FILE} bs=1M count={}",
                self.swap_size_mib
            ))
            .line(format!("sudo mkswap {SWAP_FILE}"))
            .line(format!("sudo chmod 600 {SWAP_FILE}"))
            .line(format!("sudo swapon {SWAP_FILE}"));
        }

        self.provider.start_container_engine(&mut body);
        self.provider.install_cli(&mut body);
        self.provider
            .self_tag(&self.exp_name, &self.exp_prefix, &mut body);
        body.line(format!(
            "{} || exit 1",
            kind.copy_command(&self.bundle_uri, REMOTE_BUNDLE)
        ));
        body.line(format!("mkdir -p {SANDBOX_SYNC_ROOT}"));

        let mut periodic = ScriptBuilder::new();
        periodic
            .line(kind.sync_command(SANDBOX_SYNC_ROOT, &self.log_uri))
            .line(kind.copy_command(log, &self.stdout_log_uri));
        body.line(
            BackgroundTask::new(
                Trigger::Every {
                    seconds: self.sync_interval_secs,
                    guard: String::from("true"),
                },
                periodic,
            )
            .render(),
        );

        let mut on_termination = ScriptBuilder::new();
        on_termination
            .echo("termination notice received, flushing outputs")
            .nest(self.final_copy());
        body.line(
            BackgroundTask::new(
                Trigger::WhenCheckFails {
                    check: self.provider.termination_check(),
                    poll_seconds: TERMINATION_POLL_SECS,
                },
                on_termination,
            )
            .render(),
        );

        let mut run = vec![
            quote(&self.shell_interpreter),
            String::from(REMOTE_BUNDLE),
            String::from("--quiet"),
            String::from("--"),
        ];
        run.extend(self.cli_args.iter().map(|arg| quote(arg)));
        body.line(run.join(" "));
        body.nest(self.final_copy());
        if self.terminate_on_end {
            body.line(self.provider.terminate_command());
        }

        format!(
            "#!/bin/bash\ntruncate -s 0 {log}\n{{\n{}}} >> {log} 2>&1\n",
            body.dump_script()
        )
    }

    /// Script flushing outputs, used as the compute-instance shutdown hook.
    #[must_use]
    pub fn render_shutdown(&self) -> String {
        format!("#!/bin/bash\n{}", self.final_copy().dump_script())
    }

    /// Synchronous copy of `/satchel` and the log to the bucket.
    #[must_use]
    pub fn final_copy(&self) -> ScriptBuilder {
        let kind = self.provider.store_kind();
        let mut script = ScriptBuilder::new();
        script
            .line(kind.recursive_copy_command(SANDBOX_SYNC_ROOT, &self.log_uri))
            .line(kind.copy_command(self.provider.log_file(), &self.stdout_log_uri));
        script
    }

    /// Stub that downloads and runs a bootstrap stored at `uri`.
    #[must_use]
    pub fn oversize_stub(&self, uri: &str) -> String {
        let fetch = self.provider.store_kind().copy_command(uri, OVERSIZE_LOCAL);
        format!(
            "#!/bin/bash\n{fetch} && chmod +x {OVERSIZE_LOCAL} && bash {OVERSIZE_LOCAL}\n"
        )
    }
}

/// Whether `script` must be uploaded instead of passed inline. User data is
/// sent base64 encoded, so the encoded length is what counts.
#[must_use]
pub fn exceeds_user_data_limit(script: &str) -> bool {
    script.len() > USER_DATA_LIMIT || STANDARD.encode(script).len() > USER_DATA_LIMIT
}

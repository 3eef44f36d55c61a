//! Unit tests for bootstraps, tagging and the cloud backends.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::backend::{BackendError, LaunchBackend, LaunchOutcome, LaunchRequest};
use crate::credentials::Autoconfig;
use crate::runner::RunnerError;
use crate::store::StoreKind;
use crate::test_support::{MemoryStore, ScriptedRunner};

const SPOT_RESPONSE: &str = r#"{"SpotInstanceRequests":[{"SpotInstanceRequestId":"sir-123"}]}"#;

struct Bundle {
    _dir: TempDir,
    path: Utf8PathBuf,
}

#[fixture]
fn bundle() -> Bundle {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = Utf8PathBuf::from_path_buf(dir.path().join("satchel_abc.sh")).expect("utf8 path");
    fs::write(&path, "#!/bin/sh\necho hi\n").expect("write bundle");
    Bundle { _dir: dir, path }
}

fn ec2_bootstrap(swap_size_mib: u64) -> BootstrapScript {
    BootstrapScript {
        provider: Provider::Ec2 {
            region: String::from("us-east-1"),
        },
        bundle_uri: String::from("s3://bucket/satchel/mount/x.sh"),
        log_uri: String::from("s3://bucket/satchel/logs/satchel/satchel-1/logs"),
        stdout_log_uri: String::from("s3://bucket/satchel/logs/satchel/satchel-1/stdout.log"),
        shell_interpreter: String::from("sh"),
        exp_name: String::from("satchel-1"),
        exp_prefix: String::from("satchel"),
        cli_args: vec![String::from("--epochs"), String::from("3")],
        swap_size_mib,
        sync_interval_secs: 15,
        terminate_on_end: true,
    }
}

fn spot_config() -> SpotConfig {
    let mut config = SpotConfig::new(Placement::parse("us-west-2"), "bucket", "ami-0123");
    config.tag_retry_delay = Duration::ZERO;
    config
}

fn spot_backend(runner: ScriptedRunner, store: MemoryStore) -> SpotInstanceBackend<ScriptedRunner> {
    SpotInstanceBackend::new(runner, Arc::new(store), spot_config())
}

fn compute_config() -> ComputeConfig {
    ComputeConfig::new("satchel-project", Placement::parse("us-central1-a"), "bucket")
}

#[rstest]
#[case("auto", Placement::Auto)]
#[case(" AUTO ", Placement::Auto)]
#[case("us-west-2", Placement::Named(String::from("us-west-2")))]
fn placement_parses_auto_and_names(#[case] input: &str, #[case] expected: Placement) {
    assert_eq!(Placement::parse(input), expected);
}

#[test]
fn automatic_placement_is_not_implemented() {
    let err = Placement::Auto.resolve("region").expect_err("auto rejected");

    assert_eq!(err.to_string(), "not implemented: automatic region selection");
}

#[test]
fn exp_name_appends_milliseconds() {
    let name = exp_name("satchel");

    let millis = name.strip_prefix("satchel-").expect("prefix");
    assert!(millis.parse::<u128>().is_ok(), "unexpected suffix in {name}");
}

#[rstest]
#[case("/satchel/logs/", "my_exp", "my_exp-1", "satchel/logs/my-exp/my_exp-1")]
#[case("", "plain", "plain-2", "plain/plain-2")]
fn job_base_path_joins_segments(
    #[case] log_path: &str,
    #[case] prefix: &str,
    #[case] name: &str,
    #[case] expected: &str,
) {
    assert_eq!(job_base_path(log_path, prefix, name), expected);
}

#[test]
fn ec2_bootstrap_runs_steps_in_order() {
    let script = ec2_bootstrap(4096).render();

    let steps = [
        "#!/bin/bash\ntruncate -s 0 /home/ubuntu/user_data.log\n{",
        "SATCHEL_INSTANCE_ID=\"$(curl -s http://169.254.169.254/latest/meta-data/instance-id)\"",
        "sudo swapon /var/swap.1",
        "sudo service docker start",
        "export AWS_DEFAULT_REGION=us-east-1",
        "--tags Key=Name,Value=satchel-1 --region us-east-1",
        "--tags Key=exp_prefix,Value=satchel --region us-east-1",
        "/tmp/satchel_bundle.sh || exit 1",
        "mkdir -p /satchel",
        "sleep 15; done",
        "spot/termination-time",
        "sh /tmp/satchel_bundle.sh --quiet -- --epochs 3",
        "aws ec2 terminate-instances",
        "} >> /home/ubuntu/user_data.log 2>&1",
    ];
    let positions: Vec<usize> = steps
        .iter()
        .map(|step| script.find(step).unwrap_or_else(|| panic!("missing {step:?}")))
        .collect();
    assert!(
        positions.windows(2).all(|pair| pair.first() < pair.get(1)),
        "steps out of order:\n{script}"
    );

    let final_copy = script
        .rfind("aws s3 cp --quiet --recursive /satchel")
        .expect("final copy");
    let run = script.find("sh /tmp/satchel_bundle.sh --quiet").expect("run line");
    assert!(final_copy > run);
}

#[test]
fn bootstrap_skips_swap_and_termination_when_disabled() {
    let mut bootstrap = ec2_bootstrap(0);
    bootstrap.terminate_on_end = false;

    let script = bootstrap.render();

    assert!(!script.contains("swapon"));
    assert!(!script.contains("terminate-instances"));
}

#[test]
fn gce_bootstrap_uses_gsutil_and_zone_scoped_delete() {
    let mut bootstrap = ec2_bootstrap(0);
    bootstrap.provider = Provider::Gce {
        zone: String::from("us-central1-a"),
    };
    bootstrap.bundle_uri = String::from("gs://bucket/satchel/mount/x.sh");

    let script = bootstrap.render();

    assert!(script.starts_with("#!/bin/bash\ntruncate -s 0 /var/log/satchel_startup.log\n"));
    assert!(script.contains("gsutil -q cp 'gs://bucket/satchel/mount/x.sh' /tmp/satchel_bundle.sh"));
    assert!(script.contains(
        "gcloud compute instances delete \"$SATCHEL_INSTANCE_ID\" --zone us-central1-a --quiet"
    ));
    assert!(bootstrap.render_shutdown().contains("gsutil -m -q cp -r /satchel"));
    assert!(!script.contains("create-tags"));
    assert!(!script.contains("service docker start"));
}

#[rstest]
#[case(7000, false)]
#[case(7600, true)]
#[case(USER_DATA_LIMIT + 1, true)]
fn user_data_limit_counts_encoded_bytes(#[case] len: usize, #[case] expected: bool) {
    assert_eq!(exceeds_user_data_limit(&"a".repeat(len)), expected);
}

#[test]
fn oversize_stub_fetches_and_runs_the_upload() {
    let stub = ec2_bootstrap(0).oversize_stub("s3://bucket/satchel/mount/oversize_bash_scripts/1");

    assert!(stub.starts_with("#!/bin/bash\naws s3 cp --quiet "));
    assert!(stub.contains("&& bash /home/ubuntu/remote_script.sh"));
}

#[tokio::test]
async fn tag_retry_stops_at_first_success() {
    let mut calls = 0;

    let outcome = tag_with_retry(TAG_ATTEMPTS, Duration::ZERO, || {
        calls += 1;
        if calls < 3 {
            Err(RunnerError::Spawn {
                program: String::from("aws"),
                message: String::from("not found yet"),
            })
        } else {
            Ok(())
        }
    })
    .await;

    assert_eq!(outcome, TagOutcome::Tagged { attempt: 3 });
    assert_eq!(calls, 3);
}

#[tokio::test]
async fn tag_retry_gives_up_after_every_attempt() {
    let mut calls = 0;

    let outcome = tag_with_retry(TAG_ATTEMPTS, Duration::ZERO, || {
        calls += 1;
        Err(RunnerError::Spawn {
            program: String::from("aws"),
            message: format!("failure {calls}"),
        })
    })
    .await;

    assert_eq!(calls, TAG_ATTEMPTS);
    let TagOutcome::Exhausted { last_error } = outcome else {
        panic!("expected exhaustion, got {outcome:?}");
    };
    assert!(last_error.contains("failure 10"));
}

#[rstest]
#[tokio::test]
async fn spot_dry_run_touches_nothing(bundle: Bundle) {
    let runner = ScriptedRunner::new();
    let store = MemoryStore::new(StoreKind::S3);
    let backend = spot_backend(runner.clone(), store.clone());

    let outcome = backend
        .launch(&LaunchRequest::new(bundle.path.clone()).dry(true))
        .await
        .expect("dry run");

    let LaunchOutcome::DryRun { commands } = outcome else {
        panic!("expected a dry run");
    };
    assert_eq!(commands.len(), 2);
    assert!(
        commands
            .first()
            .is_some_and(|cmd| cmd.ends_with("'s3://bucket/satchel/mount/satchel_abc.sh'"))
    );
    assert!(commands.last().is_some_and(|cmd| {
        cmd.starts_with("aws ec2 request-spot-instances --region us-west-2 --instance-count 1")
    }));
    assert!(runner.invocations().is_empty());
    assert!(store.uploads().is_empty());
}

#[rstest]
#[tokio::test]
async fn spot_dry_run_uploads_oversize_bootstraps_separately(bundle: Bundle) {
    let backend = spot_backend(ScriptedRunner::new(), MemoryStore::new(StoreKind::S3));
    let request = LaunchRequest::new(bundle.path.clone())
        .cli_args(vec!["x".repeat(USER_DATA_LIMIT)])
        .dry(true);

    let outcome = backend.launch(&request).await.expect("dry run");

    let LaunchOutcome::DryRun { commands } = outcome else {
        panic!("expected a dry run");
    };
    assert_eq!(commands.len(), 3);
    assert!(
        commands
            .get(1)
            .is_some_and(|cmd| cmd.contains("satchel/mount/oversize_bash_scripts/"))
    );
}

#[rstest]
#[tokio::test]
async fn spot_launch_uploads_requests_and_tags(bundle: Bundle) {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(0), SPOT_RESPONSE, "");
    runner.push_success();
    let store = MemoryStore::new(StoreKind::S3);
    let backend = spot_backend(runner.clone(), store.clone());

    let outcome = backend
        .launch(&LaunchRequest::new(bundle.path.clone()))
        .await
        .expect("launch");

    let LaunchOutcome::Provisioned(receipt) = outcome else {
        panic!("expected a receipt");
    };
    assert_eq!(receipt.request_id.as_deref(), Some("sir-123"));
    assert!(receipt.tagged);
    assert!(receipt.warnings.is_empty());
    assert_eq!(receipt.bundle_uri, "s3://bucket/satchel/mount/satchel_abc.sh");
    assert!(receipt.log_uri.starts_with("s3://bucket/satchel/logs/satchel/satchel-"));
    assert_eq!(store.uploads(), vec![receipt.bundle_uri.clone()]);

    let commands: Vec<String> = runner
        .invocations()
        .iter()
        .map(|invocation| invocation.command_string())
        .collect();
    assert_eq!(commands.len(), 2);
    assert!(commands.first().is_some_and(|cmd| {
        cmd.starts_with("aws ec2 request-spot-instances --region us-west-2")
            && cmd.contains("\"ImageId\":\"ami-0123\"")
            && cmd.contains("\"IamInstanceProfile\":{\"Name\":\"satchel\"}")
            && !cmd.contains("SecurityGroups")
    }));
    assert!(commands.last().is_some_and(|cmd| {
        cmd.starts_with("aws ec2 create-tags --region us-west-2 --resources sir-123 --tags")
            && cmd.contains(&format!("Key=Name,Value={}", receipt.exp_name))
    }));
}

#[rstest]
#[tokio::test]
async fn spot_launch_records_exhausted_tagging(bundle: Bundle) {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(0), SPOT_RESPONSE, "");
    for _ in 0..TAG_ATTEMPTS {
        runner.push_failure(254);
    }
    let backend = spot_backend(runner.clone(), MemoryStore::new(StoreKind::S3));

    let outcome = backend
        .launch(&LaunchRequest::new(bundle.path.clone()))
        .await
        .expect("tag failures are not fatal");

    let LaunchOutcome::Provisioned(receipt) = outcome else {
        panic!("expected a receipt");
    };
    assert!(!receipt.tagged);
    assert_eq!(receipt.warnings.len(), 1);
    assert_eq!(runner.invocations().len(), 11);
}

#[rstest]
#[tokio::test]
async fn spot_launch_rejects_unparseable_responses(bundle: Bundle) {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(0), "{\"SpotInstanceRequests\":[]}", "");
    let backend = spot_backend(runner, MemoryStore::new(StoreKind::S3));

    let err = backend
        .launch(&LaunchRequest::new(bundle.path.clone()))
        .await
        .expect_err("empty response");

    assert!(matches!(err, BackendError::Cloud(CloudError::Parse { .. })));
}

#[rstest]
#[tokio::test]
async fn spot_rejects_output_capture_before_any_call(bundle: Bundle) {
    let runner = ScriptedRunner::new();
    let store = MemoryStore::new(StoreKind::S3);
    let backend = spot_backend(runner.clone(), store.clone());

    let err = backend
        .launch(&LaunchRequest::new(bundle.path.clone()).return_output(true))
        .await
        .expect_err("return_output rejected");

    assert!(matches!(
        err,
        BackendError::Cloud(CloudError::UnsupportedOperation {
            operation: "return_output",
            ..
        })
    ));
    assert!(runner.invocations().is_empty());
    assert!(store.uploads().is_empty());
}

#[rstest]
#[tokio::test]
async fn spot_rejects_automatic_region(bundle: Bundle) {
    let runner = ScriptedRunner::new();
    let mut config = spot_config();
    config.region = Placement::Auto;
    let backend =
        SpotInstanceBackend::new(runner.clone(), Arc::new(MemoryStore::new(StoreKind::S3)), config);

    let err = backend
        .launch(&LaunchRequest::new(bundle.path.clone()))
        .await
        .expect_err("auto rejected");

    assert!(matches!(err, BackendError::Cloud(CloudError::NotImplemented { .. })));
    assert!(runner.invocations().is_empty());
}

#[test]
fn spot_config_reads_autoconfig_tables() {
    let autoconfig = Autoconfig::parse(
        r#"
[default]
s3_bucket_name = "satchel-bucket"
aws_security_groups = ["satchel-sg"]
aws_access_key = "AKIAEXAMPLE"
aws_access_secret = "very-secret"

[aws_image_ids]
us-west-1 = "ami-0123"

[aws_key_names]
us-west-1 = "satchel-us-west-1"
"#,
    )
    .expect("parse");

    let config = SpotConfig::from_autoconfig(&autoconfig, "us-west-1").expect("config");

    assert_eq!(config.bucket, "satchel-bucket");
    assert_eq!(config.image_id, "ami-0123");
    assert_eq!(config.key_name.as_deref(), Some("satchel-us-west-1"));
    assert_eq!(config.security_groups, ["satchel-sg"]);
    assert!(SpotConfig::from_autoconfig(&autoconfig, "eu-west-1").is_err());
}

#[rstest]
#[tokio::test]
async fn compute_dry_run_renders_instance_creation(bundle: Bundle) {
    let runner = ScriptedRunner::new();
    let mut config = compute_config();
    config.gpu = Some(GpuSpec {
        model: String::from("nvidia-tesla-v100"),
        count: 2,
    });
    let backend =
        ComputeInstanceBackend::new(runner.clone(), Arc::new(MemoryStore::new(StoreKind::Gcs)), config);

    let outcome = backend
        .launch(&LaunchRequest::new(bundle.path.clone()).dry(true))
        .await
        .expect("dry run");

    let LaunchOutcome::DryRun { commands } = outcome else {
        panic!("expected a dry run");
    };
    assert!(commands.first().is_some_and(|cmd| cmd.starts_with("gsutil -q cp ")));
    let create = commands.last().expect("create command");
    assert!(create.starts_with("gcloud compute instances create satchel"));
    for fragment in [
        "--project satchel-project --zone us-central1-a --machine-type f1-micro",
        "--boot-disk-size 64GB",
        "--labels exp_name=satchel-",
        "--metadata-from-file startup-script=startup.sh,shutdown-script=shutdown.sh",
        "--preemptible",
        "--accelerator type=nvidia-tesla-v100,count=2",
        "--format json",
    ] {
        assert!(create.contains(fragment), "missing {fragment} in {create}");
    }
    assert!(runner.invocations().is_empty());
}

#[rstest]
#[tokio::test]
async fn compute_launch_uploads_and_creates_the_instance(bundle: Bundle) {
    let runner = ScriptedRunner::new();
    runner.push_success();
    let store = MemoryStore::new(StoreKind::Gcs);
    let backend = ComputeInstanceBackend::new(runner.clone(), Arc::new(store.clone()), compute_config());

    let outcome = backend
        .launch(&LaunchRequest::new(bundle.path.clone()))
        .await
        .expect("launch");

    let LaunchOutcome::Provisioned(receipt) = outcome else {
        panic!("expected a receipt");
    };
    assert!(receipt.tagged);
    assert!(
        receipt
            .instance_name
            .as_deref()
            .is_some_and(|name| name.starts_with("satchel") && name.len() == 39)
    );
    assert_eq!(store.uploads(), vec![String::from("gs://bucket/satchel/mount/satchel_abc.sh")]);
    let invocation = runner.invocations().pop().expect("create call");
    assert_eq!(invocation.program, "gcloud");
    let command = invocation.command_string();
    assert!(command.contains("startup-script=") && command.contains("/startup.sh,shutdown-script="));
    assert!(!command.contains("--accelerator"));
}

#[rstest]
#[tokio::test]
async fn compute_rejects_unknown_gpus_before_any_call(bundle: Bundle) {
    let runner = ScriptedRunner::new();
    let store = MemoryStore::new(StoreKind::Gcs);
    let mut config = compute_config();
    config.gpu = Some(GpuSpec {
        model: String::from("nvidia-tesla-t4"),
        count: 1,
    });
    let backend = ComputeInstanceBackend::new(runner.clone(), Arc::new(store.clone()), config);

    let err = backend
        .launch(&LaunchRequest::new(bundle.path.clone()))
        .await
        .expect_err("invalid gpu");

    assert!(matches!(err, BackendError::Cloud(CloudError::InvalidGpu { ref model }) if model == "nvidia-tesla-t4"));
    assert!(runner.invocations().is_empty());
    assert!(store.uploads().is_empty());
}

#[rstest]
#[tokio::test]
async fn compute_rejects_output_capture(bundle: Bundle) {
    let backend = ComputeInstanceBackend::new(
        ScriptedRunner::new(),
        Arc::new(MemoryStore::new(StoreKind::Gcs)),
        compute_config(),
    );

    let err = backend
        .launch(&LaunchRequest::new(bundle.path.clone()).return_output(true))
        .await
        .expect_err("return_output rejected");

    assert!(matches!(err, BackendError::Cloud(CloudError::UnsupportedOperation { .. })));
}

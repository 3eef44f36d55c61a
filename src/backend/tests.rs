//! Unit tests for the local, SSH and Docker backends.

use std::fs;
use std::time::Duration;

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};

use super::*;
use crate::credentials::SshCredentials;
use crate::process::ProcessError;
use crate::test_support::ScriptedLauncher;

fn request() -> LaunchRequest {
    LaunchRequest::new("/tmp/build/satchel_bundle.sh").cli_args(vec![
        String::from("--epochs"),
        String::from("two words"),
    ])
}

#[fixture]
fn launcher() -> ScriptedLauncher {
    ScriptedLauncher::new()
}

fn ssh_backend(launcher: ScriptedLauncher) -> SshBackend<ScriptedLauncher> {
    let credentials =
        SshCredentials::new("10.0.0.4", "ubuntu").with_identity_file(Some("/keys/id_ed25519"));
    SshBackend::new(launcher, credentials, SshOptions::default(), BackendOptions::default())
}

#[rstest]
#[tokio::test]
async fn local_dry_run_renders_without_launching(launcher: ScriptedLauncher) {
    let backend = LocalBackend::new(launcher.clone(), BackendOptions::new("bash"));

    let outcome = backend.launch(&request().dry(true)).await.expect("dry run");

    assert_eq!(
        outcome,
        LaunchOutcome::DryRun {
            commands: vec![String::from(
                "bash /tmp/build/satchel_bundle.sh --quiet -- --epochs 'two words'"
            )],
        }
    );
    assert!(launcher.specs().is_empty());
}

#[rstest]
#[tokio::test]
async fn local_return_output_captures_stdout(launcher: ScriptedLauncher) {
    launcher.push_exit(0, "--- BEGIN OUTPUT ---\nhello\n");
    let backend = LocalBackend::new(launcher.clone(), BackendOptions::default());

    let outcome = backend
        .launch(&request().return_output(true).timeout(Some(Duration::from_secs(9))))
        .await
        .expect("launch");

    assert_eq!(
        outcome,
        LaunchOutcome::Captured {
            output: String::from("--- BEGIN OUTPUT ---\nhello\n"),
            exit_code: Some(0),
        }
    );
    let spec = launcher.specs().pop().expect("one launch");
    assert!(spec.capture && !spec.detach);
    assert_eq!(spec.timeout, Some(Duration::from_secs(9)));
}

#[rstest]
#[tokio::test]
async fn run_async_detaches_and_drops_the_timeout(launcher: ScriptedLauncher) {
    launcher.push_outcome(Ok(ProcessOutcome::Detached { pid: Some(42) }));
    let backend = LocalBackend::new(launcher.clone(), BackendOptions::default().with_run_async(true));

    let outcome = backend
        .launch(&request().timeout(Some(Duration::from_secs(1))))
        .await
        .expect("launch");

    assert_eq!(outcome, LaunchOutcome::Detached { pid: Some(42) });
    let spec = launcher.specs().pop().expect("one launch");
    assert!(spec.detach);
    assert_eq!(spec.timeout, None);
}

#[rstest]
#[tokio::test]
async fn local_timeouts_propagate(launcher: ScriptedLauncher) {
    launcher.push_outcome(Err(ProcessError::TimedOut {
        program: String::from("sh"),
        timeout_secs: 1,
    }));
    let backend = LocalBackend::new(launcher, BackendOptions::default());

    let err = backend
        .launch(&request().timeout(Some(Duration::from_secs(1))))
        .await
        .expect_err("timeout");

    assert!(matches!(err, BackendError::Process(ProcessError::TimedOut { .. })));
}

#[tokio::test]
async fn local_backend_runs_real_scripts() {
    let temp = tempfile::tempdir().expect("tempdir");
    let script = Utf8PathBuf::from_path_buf(temp.path().join("echo.sh")).expect("utf8");
    fs::write(&script, "echo \"$@\"\nexit 3\n").expect("write");
    let backend = LocalBackend::with_process_launcher(BackendOptions::default());

    let outcome = backend
        .launch(&LaunchRequest::new(script).cli_args(vec![String::from("hi")]).return_output(true))
        .await
        .expect("launch");

    assert_eq!(
        outcome,
        LaunchOutcome::Captured {
            output: String::from("--quiet -- hi\n"),
            exit_code: Some(3),
        }
    );
}

#[rstest]
#[tokio::test]
async fn ssh_copies_runs_and_removes_the_bundle(launcher: ScriptedLauncher) {
    launcher.push_exit(0, "");
    launcher.push_exit(5, "");
    launcher.push_exit(0, "");
    let backend = ssh_backend(launcher.clone());

    let outcome = backend.launch(&request()).await.expect("launch");

    assert_eq!(outcome, LaunchOutcome::Completed { exit_code: Some(5) });
    let lines: Vec<String> = launcher.specs().iter().map(ProcessSpec::command_line).collect();
    let options = "-i /keys/id_ed25519 -o BatchMode=yes -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null";
    assert_eq!(
        lines,
        vec![
            format!("scp {options} /tmp/build/satchel_bundle.sh 'ubuntu@10.0.0.4:./satchel_script.sh'"),
            format!(
                "ssh {options} 'ubuntu@10.0.0.4' 'sh ./satchel_script.sh --quiet -- --epochs '\\''two words'\\'''"
            ),
            format!("ssh {options} 'ubuntu@10.0.0.4' 'rm -f ./satchel_script.sh'"),
        ]
    );
}

#[rstest]
#[tokio::test]
async fn ssh_copy_failure_stops_before_running(launcher: ScriptedLauncher) {
    launcher.push_outcome(Ok(ProcessOutcome::Exited {
        code: Some(1),
        stdout: String::new(),
        stderr: String::from("Permission denied (publickey).\n"),
    }));
    let backend = ssh_backend(launcher.clone());

    let err = backend.launch(&request()).await.expect_err("scp failed");

    assert!(matches!(
        err,
        BackendError::StepFailed { ref stderr, .. } if stderr == "Permission denied (publickey)."
    ));
    assert_eq!(launcher.specs().len(), 1);
}

#[rstest]
#[tokio::test]
async fn ssh_async_runs_skip_cleanup(launcher: ScriptedLauncher) {
    launcher.push_exit(0, "");
    launcher.push_outcome(Ok(ProcessOutcome::Detached { pid: None }));
    let credentials = SshCredentials::new("host", "user");
    let backend = SshBackend::new(
        launcher.clone(),
        credentials,
        SshOptions::default(),
        BackendOptions::default().with_run_async(true),
    );

    let outcome = backend.launch(&request()).await.expect("launch");

    assert_eq!(outcome, LaunchOutcome::Detached { pid: None });
    assert_eq!(launcher.specs().len(), 2);
}

#[rstest]
#[tokio::test]
async fn docker_binds_the_bundle_directory(launcher: ScriptedLauncher) {
    let backend = DockerBackend::new(launcher, "python:3.12", BackendOptions::default()).with_gpu(true);

    let outcome = backend.launch(&request().dry(true)).await.expect("dry run");

    assert_eq!(
        outcome,
        LaunchOutcome::DryRun {
            commands: vec![String::from(
                "docker run --rm --gpus all -v '/tmp/build:/satchel_launch' 'python:3.12' sh \
                 /satchel_launch/satchel_bundle.sh --quiet -- --epochs 'two words'"
            )],
        }
    );
}

#[test]
fn docker_rejects_paths_without_file_names() {
    let backend = DockerBackend::new(ScriptedLauncher::new(), "alpine", BackendOptions::default());

    let err = backend.plan(&LaunchRequest::new("/")).expect_err("no file name");

    assert!(matches!(err, BackendError::InvalidScript { .. }));
}

#[test]
fn outcome_exit_codes_treat_handoffs_as_success() {
    assert_eq!(LaunchOutcome::Detached { pid: None }.exit_code(), Some(0));
    assert_eq!(LaunchOutcome::Completed { exit_code: None }.exit_code(), None);
    assert_eq!(
        LaunchOutcome::Captured {
            output: String::new(),
            exit_code: Some(4)
        }
        .exit_code(),
        Some(4)
    );
}

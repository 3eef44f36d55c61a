//! End-to-end local runs covering each mount flavour.

use std::fs;
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use rstest::{fixture, rstest};
use satchel::{
    ArchiveBuilder, BackendOptions, GitMount, LaunchOutcome, Launcher, LocalBackend, LocalMount,
    RunOptions,
};
use tempfile::TempDir;

struct Sandbox {
    _temp: TempDir,
    root: Utf8PathBuf,
}

impl Sandbox {
    fn dir(&self, name: &str) -> Utf8PathBuf {
        let dir = self.root.join(name);
        fs::create_dir_all(&dir).expect("create dir");
        dir
    }

    fn launcher(&self) -> Launcher {
        Launcher::new(
            ArchiveBuilder::default(),
            LocalBackend::with_process_launcher(BackendOptions::default()),
        )
        .with_scratch_root(self.dir("scratch"))
    }
}

#[fixture]
fn sandbox() -> Sandbox {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = Utf8Path::from_path(temp.path())
        .expect("utf8")
        .canonicalize_utf8()
        .expect("canonical tempdir");
    Sandbox { _temp: temp, root }
}

fn captured(outcome: LaunchOutcome) -> (String, Option<i32>) {
    match outcome {
        LaunchOutcome::Captured { output, exit_code } => (output, exit_code),
        other => panic!("expected captured output, got {other:?}"),
    }
}

fn git(dir: &Utf8Path, args: &[&str]) -> bool {
    Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_NAME", "satchel")
        .env("GIT_AUTHOR_EMAIL", "satchel@example.com")
        .env("GIT_COMMITTER_NAME", "satchel")
        .env("GIT_COMMITTER_EMAIL", "satchel@example.com")
        .output()
        .is_ok_and(|output| output.status.success())
}

#[rstest]
#[tokio::test]
async fn read_only_local_mount_is_visible_to_the_payload(sandbox: Sandbox) {
    let source = sandbox.dir("words");
    fs::write(source.join("secret.txt"), "apple").expect("write");
    let target = sandbox.root.join("run/words");
    let options = RunOptions::default()
        .mount(LocalMount::read_only(source.as_str(), Some(target.as_str())).expect("mount"))
        .return_output(true);

    let outcome = sandbox
        .launcher()
        .run_command(&format!("cat {target}/secret.txt; echo"), options)
        .await
        .expect("run");

    assert_eq!(captured(outcome), (String::from("apple\n"), Some(0)));
}

#[rstest]
#[tokio::test]
async fn writable_local_mount_collects_payload_output(sandbox: Sandbox) {
    let output = sandbox.dir("outputs");
    let options = RunOptions::default()
        .mount(LocalMount::writable(output.as_str(), None).expect("mount"))
        .return_output(true);

    let outcome = sandbox
        .launcher()
        .run_command(&format!("echo hello123 > {output}/result.txt"), options)
        .await
        .expect("run");

    assert_eq!(captured(outcome), (String::new(), Some(0)));
    assert_eq!(
        fs::read_to_string(output.join("result.txt")).expect("result written"),
        "hello123\n"
    );
}

#[rstest]
#[tokio::test]
async fn git_mount_is_cloned_and_added_to_the_search_path(sandbox: Sandbox) {
    let repo = sandbox.dir("upstream/tools");
    fs::write(repo.join("README"), "tools readme").expect("write");
    let ready = git(&repo, &["init", "--quiet"])
        && git(&repo, &["add", "README"])
        && git(&repo, &["commit", "--quiet", "-m", "init"]);
    if !ready {
        eprintln!("skipping: git is not usable in this environment");
        return;
    }
    let target = sandbox.root.join("run/libs/tools");
    let mount = GitMount::new(repo.as_str(), target.as_str())
        .expect("mount")
        .with_search_path(true);
    let options = RunOptions::default().mount(mount).return_output(true);

    let outcome = sandbox
        .launcher()
        .run_command(
            &format!("cat {target}/README; echo; echo \"$PYTHONPATH\""),
            options,
        )
        .await
        .expect("run");

    let (stdout, code) = captured(outcome);
    assert_eq!(code, Some(0));
    let mut lines = stdout.lines();
    assert_eq!(lines.next(), Some("tools readme"));
    assert!(
        lines
            .next()
            .is_some_and(|path| path.ends_with(target.as_str())),
        "unexpected output: {stdout}"
    );
}

#[rstest]
#[tokio::test]
async fn cli_args_are_forwarded_to_the_payload(sandbox: Sandbox) {
    let options = RunOptions::default()
        .cli_args(vec![String::from("123")])
        .return_output(true);

    let outcome = sandbox
        .launcher()
        .run_command("echo hello$1; exit 3", options)
        .await
        .expect("run");

    assert_eq!(captured(outcome), (String::from("hello123\n"), Some(3)));
}

#[rstest]
#[tokio::test]
async fn relative_mount_point_is_read_from_the_bundle_directory(sandbox: Sandbox) {
    let source = sandbox.dir("mydata");
    fs::write(source.join("secret.txt"), "apple").expect("write");
    let options = RunOptions::default()
        .mount(LocalMount::read_only(source.as_str(), Some("./mymount")).expect("mount"))
        .return_output(true);

    let outcome = sandbox
        .launcher()
        .run_command("cat ./mymount/secret.txt; echo", options)
        .await
        .expect("run");

    assert_eq!(captured(outcome), (String::from("apple\n"), Some(0)));
}

#[rstest]
#[tokio::test]
async fn help_flag_reaches_the_payload_instead_of_the_bundle(sandbox: Sandbox) {
    let options = RunOptions::default()
        .cli_args(vec![String::from("--help")])
        .return_output(true);

    let outcome = sandbox
        .launcher()
        .run_command("printf 'payload got %s\\n'", options)
        .await
        .expect("run");

    assert_eq!(
        captured(outcome),
        (String::from("payload got --help\n"), Some(0))
    );
}

#[rstest]
#[tokio::test]
async fn repeated_git_mount_reuses_the_existing_checkout(sandbox: Sandbox) {
    let repo = sandbox.dir("upstream/notes");
    fs::write(repo.join("README"), "notes readme").expect("write");
    let ready = git(&repo, &["init", "--quiet"])
        && git(&repo, &["add", "README"])
        && git(&repo, &["commit", "--quiet", "-m", "init"]);
    if !ready {
        eprintln!("skipping: git is not usable in this environment");
        return;
    }
    let target = sandbox.root.join("shared/notes");
    let launcher = sandbox.launcher();

    for _ in 0..2 {
        let options = RunOptions::default()
            .mount(GitMount::new(repo.as_str(), target.as_str()).expect("mount"))
            .return_output(true);
        let outcome = launcher
            .run_command(&format!("cat {target}/README; echo"), options)
            .await
            .expect("run");
        assert_eq!(captured(outcome), (String::from("notes readme\n"), Some(0)));
    }
}

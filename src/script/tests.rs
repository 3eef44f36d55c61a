//! Unit tests for script assembly.

use rstest::{fixture, rstest};

use super::*;

#[fixture]
fn nested() -> ScriptBuilder {
    let mut inner = ScriptBuilder::new();
    inner.append("mkdir", ["-p", "/out"]).line("cd /out");

    let mut outer = ScriptBuilder::new();
    outer.line("set -e").nest(inner).append("echo", ["done"]);
    outer
}

#[rstest]
fn nested_builders_flatten_in_order(nested: ScriptBuilder) {
    assert_eq!(
        nested.commands(),
        vec!["set -e", "mkdir -p /out", "cd /out", "echo done"]
    );
}

#[rstest]
fn command_line_joins_with_semicolons(nested: ScriptBuilder) {
    assert_eq!(
        nested.to_command_line(),
        "set -e; mkdir -p /out; cd /out; echo done"
    );
    assert_eq!(nested.to_string(), nested.to_command_line());
}

#[rstest]
fn dump_script_emits_one_command_per_line(nested: ScriptBuilder) {
    assert_eq!(
        nested.dump_script(),
        "set -e\nmkdir -p /out\ncd /out\necho done\n"
    );
}

#[test]
fn empty_nested_builders_are_ignored() {
    let mut outer = ScriptBuilder::new();
    outer.nest(ScriptBuilder::new());

    assert!(outer.is_empty());
    assert_eq!(outer.dump_script(), "");
}

#[rstest]
#[case("plain", "echo plain")]
#[case("two words", "echo 'two words'")]
#[case("it's", "echo 'it'\\''s'")]
fn echo_quotes_messages(#[case] message: &str, #[case] expected: &str) {
    let mut script = ScriptBuilder::new();
    script.echo(message);
    assert_eq!(script.to_command_line(), expected);
}

#[test]
fn interval_task_renders_guarded_loop() {
    let mut actions = ScriptBuilder::new();
    actions.line("sync-out");
    let task = BackgroundTask::new(
        Trigger::Every {
            seconds: 15,
            guard: String::from("true"),
        },
        actions,
    );

    assert_eq!(
        task.render(),
        "( while true; do sync-out; sleep 15; done ) &"
    );
}

#[test]
fn check_task_renders_wait_then_actions() {
    let mut actions = ScriptBuilder::new();
    actions.line("flush").line("break-glass");
    let task = BackgroundTask::new(
        Trigger::WhenCheckFails {
            check: String::from("still-running"),
            poll_seconds: 3,
        },
        actions,
    )
    .with_redirect("> /dev/null 2>&1");

    assert_eq!(
        task.render(),
        "( while still-running; do sleep 3; done; flush; break-glass ) > /dev/null 2>&1 &"
    );
}

/// Runs a periodic copy and a copy-on-exit against the same sink and checks
/// the sink converges on the final content regardless of which fires last.
#[rstest]
#[case::exit_before_first_tick(5, 0)]
#[case::ticks_during_work(1, 2)]
fn sync_tasks_converge_in_either_order(#[case] interval: u64, #[case] work_seconds: u64) {
    let temp = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir_all(temp.path().join("src")).expect("mkdir src");
    std::fs::create_dir_all(temp.path().join("dst")).expect("mkdir dst");

    let mut copy = ScriptBuilder::new();
    copy.line("cp -R src/. dst/");
    let periodic = BackgroundTask::new(
        Trigger::Every {
            seconds: interval,
            guard: String::from("kill -0 $parent 2>/dev/null"),
        },
        copy.clone(),
    )
    .with_redirect("> /dev/null 2>&1");
    let on_exit = BackgroundTask::new(
        Trigger::WhenCheckFails {
            check: String::from("kill -0 $parent 2>/dev/null"),
            poll_seconds: 1,
        },
        copy,
    )
    .with_redirect("> /dev/null 2>&1");

    let mut script = ScriptBuilder::new();
    script
        .line("parent=$$")
        .line(periodic.render())
        .line(on_exit.render())
        .line("echo draft > src/out")
        .line(format!("sleep {work_seconds}"))
        .line("echo final > src/out");

    let status = std::process::Command::new("sh")
        .arg("-c")
        .arg(script.dump_script())
        .current_dir(temp.path())
        .status()
        .expect("sh should run");
    assert!(status.success());

    let sink = temp.path().join("dst/out");
    let mut contents = String::new();
    for _ in 0..100 {
        contents = std::fs::read_to_string(&sink).unwrap_or_default();
        if contents == "final\n" {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    }
    assert_eq!(contents, "final\n");
}

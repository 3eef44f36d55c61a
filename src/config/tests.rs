//! Unit tests for configuration loading and validation.

use rstest::rstest;

use super::*;
use crate::test_support::EnvGuard;

#[test]
fn defaults_validate() {
    let config = SatchelConfig::default();

    assert_eq!(config.validate(), Ok(()));
    assert_eq!(config.compiler_kind(), Ok(CompilerKind::Embedded));
    assert_eq!(config.grace_period(), DEFAULT_GRACE_PERIOD);
}

#[rstest]
#[case("ssh_bin")]
#[case("shell_interpreter")]
#[case("search_path_var")]
fn blank_values_name_the_environment_variable(#[case] field: &str) {
    let mut config = SatchelConfig::default();
    match field {
        "ssh_bin" => config.ssh_bin = String::from("  "),
        "shell_interpreter" => config.shell_interpreter = String::new(),
        _ => config.search_path_var = String::from("\t"),
    }

    let err = config.validate().expect_err("blank value");

    assert_eq!(
        err.to_string(),
        format!(
            "missing {field}: set SATCHEL_{} or add {field} to satchel.toml",
            field.to_uppercase()
        )
    );
}

#[test]
fn unknown_compiler_is_rejected() {
    let config = SatchelConfig {
        compiler: String::from("zip"),
        ..SatchelConfig::default()
    };

    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidValue { ref value, .. }) if value == "zip"
    ));
    assert!(config.archive_builder().is_err());
}

#[test]
fn makeself_compiler_is_selectable() {
    let config = SatchelConfig {
        compiler: String::from("makeself"),
        makeself_header: Some(String::from("/opt/header.sh")),
        ..SatchelConfig::default()
    };

    assert_eq!(config.compiler_kind(), Ok(CompilerKind::Makeself));
    assert!(config.archive_builder().is_ok());
}

#[tokio::test]
async fn environment_overrides_defaults() {
    let _guard = EnvGuard::set_vars(&[
        ("SATCHEL_SHELL_INTERPRETER", "bash"),
        ("SATCHEL_SEARCH_PATH_VAR", "SATCHEL_PATH"),
        ("SATCHEL_SSH_BATCH_MODE", "false"),
    ])
    .await;

    let config = SatchelConfig::load_without_cli_args().expect("load");

    assert_eq!(config.shell_interpreter, "bash");
    assert_eq!(config.search_path_var, "SATCHEL_PATH");
    assert!(!config.ssh_batch_mode);
    assert_eq!(config.docker_bin, "docker");
}

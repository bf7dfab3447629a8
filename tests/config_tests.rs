// ABOUTME: Tests for configuration loading and validation
// ABOUTME: Verifies TOML parsing, env var overrides, and required field validation

use charbridge::config::Config;
use charbridge::linger::Dropoff;
use serial_test::serial;
use std::io::Write;
use std::path::PathBuf;

/// Helper to clear all config-related env vars
fn clear_config_env_vars() {
    std::env::remove_var("CHARBRIDGE_CONFIG");
    std::env::remove_var("CHARBRIDGE_WORKSPACE");
    std::env::remove_var("CHARBRIDGE_BACKOFF_SECS");
    std::env::remove_var("CHARBRIDGE_LINGER_TIMEOUT");
    std::env::remove_var("CHARBRIDGE_LINGER_DROPOFF");
}

const MINIMAL: &str = r#"
[[bots]]
name = "alfred"
character_id = "char-abc"
"#;

fn write_config(dir: &tempfile::TempDir, content: &str) -> PathBuf {
    let path = dir.path().join("charbridge.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(content.as_bytes()).unwrap();
    path
}

#[test]
#[serial]
fn test_config_loads_from_toml_file() {
    clear_config_env_vars();
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        r#"
[[bots]]
name = "alfred"
character_id = "char-abc"
respond_to_bots = ["server-42"]

[[bots]]
name = "penny"
character_id = "char-def"
greeting_on_new_session = false

[dispatch]
max_attempts = 3
typing_delay_secs = [0.5, 1.5]

[lingering]
enabled = true
chance = 80
timeout_secs = 20
exponent_curve = 2.25
dropoff = "slide"

[templates]
message_format = "{display_name} says: {message}"

[workspace]
path = "./test-workspace"
"#,
    );

    let config = Config::load(Some(&path)).unwrap();

    assert_eq!(config.bots.len(), 2);
    assert_eq!(config.bots[0].respond_to_bots, vec!["server-42".to_string()]);
    assert!(config.bots[0].greeting_on_new_session);
    assert!(!config.bot("penny").unwrap().greeting_on_new_session);
    assert_eq!(config.dispatch.max_attempts, 3);
    assert_eq!(config.dispatch.typing_delay_secs, [0.5, 1.5]);
    assert!(config.lingering.enabled);
    assert_eq!(config.lingering.dropoff, Dropoff::Slide);
    assert_eq!(config.lingering.timeout_secs, 20.0);
    assert_eq!(config.templates.message_format, "{display_name} says: {message}");
    assert_eq!(config.templates.dm_message_format, "{message}");
    assert_eq!(config.workspace.path, "./test-workspace");
}

#[test]
#[serial]
fn test_config_path_from_env() {
    clear_config_env_vars();
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, MINIMAL);
    std::env::set_var("CHARBRIDGE_CONFIG", &path);

    let config = Config::load(None).unwrap();
    assert_eq!(config.bots[0].name, "alfred");
    assert_eq!(config.backend.malformed_backoff_secs, 30);
    assert_eq!(config.dispatch.max_attempts, 5);

    clear_config_env_vars();
}

#[test]
#[serial]
fn test_env_overrides_win_over_file() {
    clear_config_env_vars();
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, MINIMAL);

    std::env::set_var("CHARBRIDGE_WORKSPACE", "/tmp/elsewhere");
    std::env::set_var("CHARBRIDGE_BACKOFF_SECS", "5");
    std::env::set_var("CHARBRIDGE_LINGER_TIMEOUT", "12.5");
    std::env::set_var("CHARBRIDGE_LINGER_DROPOFF", "linear");

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.workspace.path, "/tmp/elsewhere");
    assert_eq!(config.backend.malformed_backoff_secs, 5);
    assert_eq!(config.lingering.timeout_secs, 12.5);
    assert_eq!(config.lingering.dropoff, Dropoff::Linear);

    clear_config_env_vars();
}

#[test]
#[serial]
fn test_bad_env_override_is_an_error() {
    clear_config_env_vars();
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, MINIMAL);

    std::env::set_var("CHARBRIDGE_BACKOFF_SECS", "soon");
    let err = Config::load(Some(&path)).unwrap_err();
    assert!(format!("{:#}", err).contains("CHARBRIDGE_BACKOFF_SECS"));

    clear_config_env_vars();
}

#[test]
#[serial]
fn test_missing_file_names_the_path() {
    clear_config_env_vars();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");

    let err = Config::load(Some(&path)).unwrap_err();
    assert!(err.to_string().contains("absent.toml"));
}

#[test]
#[serial]
fn test_validation_rejects_bad_files() {
    clear_config_env_vars();
    let dir = tempfile::tempdir().unwrap();

    let cases = [
        ("", "At least one [[bots]] entry"),
        (
            "[[bots]]\nname = \"a\"\ncharacter_id = \"\"\n",
            "character_id is required",
        ),
        (
            "[[bots]]\nname = \"a\"\ncharacter_id = \"x\"\n[[bots]]\nname = \"a\"\ncharacter_id = \"y\"\n",
            "Duplicate bot name",
        ),
        (
            "[[bots]]\nname = \"a\"\ncharacter_id = \"x\"\n[dispatch]\ntyping_delay_secs = [2.0, 1.0]\n",
            "typing_delay_secs",
        ),
        (
            "[[bots]]\nname = \"a\"\ncharacter_id = \"x\"\n[lingering]\nchance = 150\n",
            "lingering.chance",
        ),
    ];

    for (content, expected) in cases {
        let path = write_config(&dir, content);
        let err = Config::load(Some(&path)).unwrap_err();
        assert!(
            format!("{:#}", err).contains(expected),
            "expected '{}' in '{:#}'",
            expected,
            err
        );
    }
}

#[test]
#[serial]
fn test_infinite_linger_timeout_from_env_is_rejected() {
    clear_config_env_vars();
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, MINIMAL);

    std::env::set_var("CHARBRIDGE_LINGER_TIMEOUT", "inf");
    let err = Config::load(Some(&path)).unwrap_err();
    assert!(format!("{:#}", err).contains("lingering.timeout_secs"));

    clear_config_env_vars();
}

use assert_cmd::prelude::*;
use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::tempdir;

/// Tests that `--help` is handled successfully by the agent.
///
/// The help text lists the sync command and nothing goes to stderr.
#[test]
fn test_agent_help_success() {
    let mut cmd = cargo_bin_cmd!("ankirag-agent");

    let assert = cmd.arg("--help").assert().success();

    let out = assert.get_output();
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("sync"), "help text:\n{stdout}");
    assert!(
        out.stderr.is_empty(),
        "expected empty stderr for --help, got:\n{}",
        String::from_utf8_lossy(&out.stderr)
    );
}

/// Settings written with `settings set` are read back by `settings show`.
#[test]
fn test_agent_settings_round_trip() {
    let home = tempdir().unwrap();

    cargo_bin_cmd!("ankirag-agent")
        .env("ANKIRAG_AGENT_HOME", home.path())
        .args(["settings", "set", "default_deck", "Biology"])
        .assert()
        .success();
    assert!(home.path().join("agent.toml").exists());

    let out = cargo_bin_cmd!("ankirag-agent")
        .env("ANKIRAG_AGENT_HOME", home.path())
        .args(["--format", "json", "settings", "show"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let settings: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(settings["default_deck"], "Biology");
    assert_eq!(settings["default_model"], "Basic");
}

#[test]
fn test_agent_rejects_unknown_setting() {
    let home = tempdir().unwrap();

    let out = cargo_bin_cmd!("ankirag-agent")
        .env("ANKIRAG_AGENT_HOME", home.path())
        .args(["settings", "set", "colour", "blue"])
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    assert!(String::from_utf8_lossy(&out).contains("unknown setting"));
}

/// Sync stops before touching the backend when Anki is not running.
#[test]
fn test_agent_sync_needs_anki() {
    let home = tempdir().unwrap();

    let out = cargo_bin_cmd!("ankirag-agent")
        .env("ANKIRAG_AGENT_HOME", home.path())
        .args(["--anki-url", "http://127.0.0.1:1/", "--api-url", "http://127.0.0.1:1", "sync"])
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    assert!(String::from_utf8_lossy(&out).contains("Anki is not reachable"));
}

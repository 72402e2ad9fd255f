use assert_cmd::cargo::cargo_bin_cmd;
use std::path::Path;

fn fixture(path: &str) -> String {
    format!("{}/tests/fixtures/{path}", env!("CARGO_MANIFEST_DIR"))
}

fn write_config(dir: &Path, extra: &str) -> String {
    let path = dir.join("feedbot.toml");
    let text = format!(
        "[run]\ntarget_item_count = 4\nfavorite_probability = 1.0\ncomment_probability = 0.0\nreply_probability = 1.0\nsettle_wait_ms = 0\nretry_backoff_ms = 0\ninterruption_wait_ms = 0\n\n[driver]\nfeed_script = \"{}\"\n{extra}",
        fixture("feeds/home.json")
    );
    std::fs::write(&path, text).expect("write config");
    path.display().to_string()
}

fn stdout_of(out: &assert_cmd::assert::Assert) -> String {
    String::from_utf8(out.get_output().stdout.clone()).expect("utf8")
}

#[test]
fn help_lists_session_and_run_flags() {
    let mut cmd = cargo_bin_cmd!("feedbot");
    cmd.arg("--help");
    let out = cmd.assert().success();
    let stdout = stdout_of(&out);

    for flag in [
        "--account",
        "--import-session",
        "--session-stats",
        "--cleanup-sessions",
        "--purge-invalidated",
        "--list-sessions",
        "--seed",
    ] {
        assert!(stdout.contains(flag), "missing {flag}");
    }
}

#[test]
fn import_run_and_stats_round_trip() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = write_config(temp.path(), "");

    let mut import = cargo_bin_cmd!("feedbot");
    import
        .current_dir(temp.path())
        .arg("--config")
        .arg(&config)
        .arg("--account")
        .arg("ada-bot")
        .arg("--import-session")
        .arg(fixture("cookies.txt"));
    let out = import.assert().success();
    assert!(stdout_of(&out).contains("imported session for ada-bot (login_count=1)"));

    let mut run = cargo_bin_cmd!("feedbot");
    run.current_dir(temp.path())
        .arg("--config")
        .arg(&config)
        .arg("--account")
        .arg("ada-bot")
        .arg("--seed")
        .arg("7");
    let out = run.assert().success();
    let stdout = stdout_of(&out);
    assert!(stdout.contains("state=completed"), "{stdout}");
    assert!(stdout.contains("processed=4"), "{stdout}");
    assert!(stdout.contains("favorites=4"), "{stdout}");
    assert!(stdout.contains("replies=1"), "{stdout}");
    assert!(stdout.contains("session=refreshed"), "{stdout}");

    let audit = std::fs::read_to_string(temp.path().join(".feedbot/audit/audit.jsonl"))
        .expect("audit trail");
    assert!(audit.contains("\"action_kind\":\"RUN_COMPLETE\""));
    assert!(audit.contains("\"target\":\"reply-1\""));

    let mut stats = cargo_bin_cmd!("feedbot");
    stats
        .current_dir(temp.path())
        .arg("--config")
        .arg(&config)
        .arg("--session-stats");
    let out = stats.assert().success();
    let stdout = stdout_of(&out);
    assert!(stdout.contains("\"total\": 1"), "{stdout}");
    assert!(stdout.contains("\"engagement\": 1"), "{stdout}");
}

#[test]
fn run_for_unknown_account_exits_nonzero() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = write_config(temp.path(), "");
    let mut cmd = cargo_bin_cmd!("feedbot");
    cmd.current_dir(temp.path())
        .arg("--config")
        .arg(&config)
        .arg("--account")
        .arg("nobody");
    let out = cmd.assert().failure();
    assert!(stdout_of(&out).contains("nobody: session unavailable"));
}

#[test]
fn invalidate_then_list_invalid_sessions() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = write_config(temp.path(), "");

    let mut import = cargo_bin_cmd!("feedbot");
    import
        .current_dir(temp.path())
        .arg("--config")
        .arg(&config)
        .arg("--account")
        .arg("brook-bot")
        .arg("--import-session")
        .arg(fixture("cookies.txt"));
    import.assert().success();

    let mut invalidate = cargo_bin_cmd!("feedbot");
    invalidate
        .current_dir(temp.path())
        .arg("--config")
        .arg(&config)
        .arg("--invalidate-session")
        .arg("brook-bot")
        .arg("--list-sessions")
        .arg("invalid");
    let out = invalidate.assert().success();
    let stdout = stdout_of(&out);
    assert!(stdout.contains("invalidated session for brook-bot"));
    assert!(stdout.contains("brook-bot valid=false"));
}

#[test]
fn invalid_probability_config_exits_nonzero() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut cmd = cargo_bin_cmd!("feedbot");
    cmd.current_dir(temp.path())
        .arg("--config")
        .arg(fixture("configs/invalid-probability.toml"))
        .arg("--session-stats");
    let out = cmd.assert().failure();
    let stderr = String::from_utf8(out.get_output().stderr.clone()).expect("utf8");
    assert!(stderr.contains("favorite_probability"));
}

#[test]
fn missing_config_path_exits_nonzero() {
    let mut cmd = cargo_bin_cmd!("feedbot");
    cmd.arg("--config")
        .arg(fixture("configs/missing.toml"))
        .arg("--session-stats");
    cmd.assert().failure();
}

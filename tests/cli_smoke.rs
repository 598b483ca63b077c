use predicates::prelude::*;

#[test]
fn x25519_prints_a_keypair() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("rayd");
    cmd.arg("x25519");
    cmd.assert()
        .success()
        .stdout(
            predicate::str::is_match(
                "^Private key: [A-Za-z0-9_-]{43}\nPublic key: [A-Za-z0-9_-]{43}\n$",
            )
            .unwrap(),
        );
}

#[test]
fn x25519_rejects_malformed_private_key() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("rayd");
    cmd.args(["x25519", "--private-key", "not-a-key"]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("invalid private key"));
}

#[test]
fn compile_on_fresh_data_dir_prints_engine_config() {
    let tmp = tempfile::tempdir().unwrap();
    let data_dir = tmp.path().to_string_lossy().to_string();

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("rayd");
    cmd.args(["--data-dir", &data_dir, "compile"]);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("\"StatsService\""))
        .stdout(predicate::str::contains("\"tag\": \"api\""));

    assert!(tmp.path().join("state.json").exists());
}

#[test]
fn link_for_unknown_client_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let data_dir = tmp.path().to_string_lossy().to_string();

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("rayd");
    cmd.args([
        "--data-dir",
        &data_dir,
        "--public-host",
        "example.com",
        "link",
        "01JG8ZQ4W3XXXXXXXXXXXXXXXX",
    ]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("client not found"));
}

#[test]
fn out_of_range_flag_is_rejected() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("rayd");
    cmd.args(["--stats-interval-secs", "0", "compile"]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("--stats-interval-secs"));
}

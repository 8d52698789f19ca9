use std::process::Command;

const BIN: &str = env!("CARGO_BIN_EXE_ioc-scan-rs");

#[test]
fn fatal_error_is_reported_once() {
    let dir = tempfile::tempdir().unwrap();
    let same = dir.path().join("scan_results.csv");
    let out = Command::new(BIN)
        .args(["merge", "--intermediate"])
        .arg(&same)
        .arg("--output")
        .arg(&same)
        .env_remove("RUST_LOG")
        .output()
        .unwrap();

    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    let hits = stderr
        .matches("intermediate store and output must be different files")
        .count();
    assert_eq!(hits, 1, "stderr was:\n{stderr}");
    assert!(out.stdout.is_empty());
}

#[test]
fn merge_subcommand_writes_the_table() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("temp_scan_results.csv");
    let output = dir.path().join("scan_results.csv");
    std::fs::write(&store, "ip,port\n10.0.0.1,22\n10.0.0.1,443\n").unwrap();

    let status = Command::new(BIN)
        .args(["merge", "--keep-intermediate", "--intermediate"])
        .arg(&store)
        .arg("--output")
        .arg(&output)
        .status()
        .unwrap();

    assert!(status.success());
    assert_eq!(
        std::fs::read_to_string(&output).unwrap(),
        "ip,ports_set\n10.0.0.1,\"443,22\"\n"
    );
    assert!(store.exists());
}

//! Basic CLI E2E tests.
//!
//! These cover the pure-computation commands only, so they run without a
//! pre-existing database.

use std::process::Command;

/// Run a CLI command and return (stdout, stderr, exit code).
fn run_cli(args: &[&str]) -> (String, String, i32) {
    let output = Command::new("cargo")
        .args(["run", "-p", "regimen-cli", "--"])
        .args(args)
        .output()
        .expect("Failed to execute CLI command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let code = output.status.code().unwrap_or(-1);

    (stdout, stderr, code)
}

#[test]
fn test_phases_list() {
    let (stdout, _, code) = run_cli(&["phases", "list"]);
    assert_eq!(code, 0, "phases list failed");
    let parsed: serde_json::Value = serde_json::from_str(&stdout).expect("invalid JSON");
    assert_eq!(parsed["phases"].as_array().unwrap().len(), 5);
}

#[test]
fn test_phases_for_day() {
    let (stdout, _, code) = run_cli(&["phases", "for", "5"]);
    assert_eq!(code, 0, "phases for failed");
    let parsed: serde_json::Value = serde_json::from_str(&stdout).expect("invalid JSON");
    assert_eq!(parsed["number"], 2);
}

#[test]
fn test_phases_for_day_out_of_range() {
    let (stdout, _, code) = run_cli(&["phases", "for", "26"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("null"));
}

#[test]
fn test_schedule_day_expansion() {
    let (stdout, _, code) = run_cli(&[
        "schedule",
        "day",
        "1",
        "--start",
        "2025-03-01",
        "--first-dose",
        "08:00",
    ]);
    assert_eq!(code, 0, "schedule day failed");
    let parsed: serde_json::Value = serde_json::from_str(&stdout).expect("invalid JSON");
    let slots = parsed.as_array().unwrap();
    assert_eq!(slots.len(), 6);
    assert_eq!(slots[0]["scheduled_at"], "2025-03-01T08:00:00");
    assert_eq!(slots[5]["scheduled_at"], "2025-03-01T18:00:00");
}

#[test]
fn test_schedule_day_rejects_bad_time() {
    let (_, _, code) = run_cli(&[
        "schedule",
        "day",
        "1",
        "--start",
        "2025-03-01",
        "--first-dose",
        "8am",
    ]);
    assert_ne!(code, 0);
}

#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use graphheap::config::{IdleSetting, RegionConfig, ServerSection};
use serde_json::Value;
use tempfile::TempDir;

/// Scratch directory with a config file tuned for short test runs.
fn setup(name: &str) -> (TempDir, PathBuf, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let region = dir.path().join(format!("{name}.region"));
    let config = dir.path().join("region.toml");
    RegionConfig::new(&region)
        .with_size(64 * 1024)
        .with_server(ServerSection {
            flush_period_us: 500,
            clock_period_ms: 5,
            idle: IdleSetting::Sleep,
            sleep_us: 200,
            pin_cpu: None,
        })
        .persist(&config)
        .expect("write config");
    (dir, region, config)
}

fn json(config: &Path, args: &[&str], region: &Path) -> Value {
    let output = cargo_bin_cmd!("graphheap")
        .arg("--config")
        .arg(config)
        .args(["--format", "json"])
        .args(args)
        .arg(region)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("valid json")
}

fn create(config: &Path, region: &Path, extra: &[&str]) -> Value {
    let mut args = vec!["create", "--nodes", "2", "--cores", "3", "--label", "pagerank"];
    args.extend_from_slice(extra);
    json(config, &args, region)
}

#[test]
fn create_then_inspect_reports_descriptor() {
    let (_dir, region, config) = setup("inspect");
    let created = create(&config, &region, &[]);
    assert_eq!(created["descriptor"]["node_count"], 2);
    assert_eq!(created["descriptor"]["core_count"], 3);
    assert_eq!(created["descriptor"]["label"], "pagerank");
    assert!(created["server"].is_null());

    let inspected = json(&config, &["inspect", "--raw"], &region);
    assert_eq!(inspected["valid"], true);
    assert_eq!(inspected["file_len"], 64 * 1024);
    assert_eq!(inspected["descriptor"]["capacity"], 64 * 1024);
    assert_eq!(inspected["descriptor"]["data_offset"], 4096);
    let raw = inspected["raw"].as_str().expect("hex dump");
    assert_eq!(raw.len(), 2 * 128);

    let plain = json(&config, &["inspect"], &region);
    assert!(plain.get("raw").is_none());
}

#[test]
fn create_prints_text_summary() {
    let (_dir, region, config) = setup("text");
    let output = cargo_bin_cmd!("graphheap")
        .arg("--config")
        .arg(&config)
        .args(["--theme", "plain", "create"])
        .arg(&region)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.contains("created region at"), "{text}");
    assert!(text.contains("capacity"), "{text}");
}

#[test]
fn barrier_set_wait_reset() {
    let (_dir, region, config) = setup("barrier");
    create(&config, &region, &[]);

    let output = cargo_bin_cmd!("graphheap")
        .arg("--config")
        .arg(&config)
        .args(["--format", "json", "barrier"])
        .arg(&region)
        .args(["--node", "1", "set", "4"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let set: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(set["set"], true);

    let output = cargo_bin_cmd!("graphheap")
        .arg("--config")
        .arg(&config)
        .args(["--format", "json", "barrier"])
        .arg(&region)
        .args(["--node", "0", "wait", "4", "--timeout-ms", "1000"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let waited: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(waited["action"], "wait");
    assert!(waited["waited_ms"].is_number());

    cargo_bin_cmd!("graphheap")
        .arg("--config")
        .arg(&config)
        .arg("barrier")
        .arg(&region)
        .args(["reset", "4"])
        .assert()
        .success();

    let output = cargo_bin_cmd!("graphheap")
        .arg("--config")
        .arg(&config)
        .args(["--quiet", "barrier"])
        .arg(&region)
        .args(["wait", "4", "--timeout-ms", "30"])
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    let stderr = String::from_utf8(output).expect("utf8");
    assert!(stderr.contains("not signalled"), "{stderr}");
}

#[test]
fn serve_and_publish_show_up_in_stats() {
    let (_dir, region, config) = setup("serve");
    let created = create(
        &config,
        &region,
        &["--publish-barrier", "0", "--serve-ms", "120"],
    );
    assert_eq!(created["published_barrier"], 0);
    assert!(created["server"]["clock_publishes"].as_u64().unwrap() >= 1);

    let stats = json(&config, &["stats", "--node", "1"], &region);
    assert_eq!(stats["node"], 1);
    assert_eq!(stats["label"], "pagerank");
    assert_eq!(stats["barriers_set"], serde_json::json!([0]));
    assert!(stats["clock"].as_u64().unwrap() >= 1);
    assert_eq!(stats["pool"]["allocations"], 0);
}

#[test]
fn unformatted_files_are_not_regions() {
    let (dir, _region, config) = setup("blank");
    let blank = dir.path().join("blank.bin");
    fs::write(&blank, vec![0u8; 8192]).expect("write blank");

    let inspected = json(&config, &["inspect"], &blank);
    assert_eq!(inspected["valid"], false);

    cargo_bin_cmd!("graphheap")
        .arg("--config")
        .arg(&config)
        .arg("stats")
        .arg(&blank)
        .assert()
        .failure();

    let short = dir.path().join("short.bin");
    fs::write(&short, b"tiny").expect("write short");
    cargo_bin_cmd!("graphheap")
        .arg("--config")
        .arg(&config)
        .arg("inspect")
        .arg(&short)
        .assert()
        .failure();
}

#[test]
fn stats_text_draws_pool_gauges_and_barrier_map() {
    let (_dir, region, config) = setup("gauges");
    create(&config, &region, &["--publish-barrier", "2"]);

    let output = cargo_bin_cmd!("graphheap")
        .arg("--config")
        .arg(&config)
        .args(["--theme", "plain", "stats"])
        .arg(&region)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.contains("0.0% of 60.0 KiB"), "{text}");
    let row = format!("..*{}  1/32 set", ".".repeat(29));
    assert!(text.contains(&row), "{text}");
}

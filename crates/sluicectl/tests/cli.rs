use anyhow::{Context, Result};
use std::process::{Command, Output};
use tempfile::tempdir;

fn sluicectl(args: &[&str]) -> Result<Output> {
    Command::new(env!("CARGO_BIN_EXE_sluicectl"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .context("spawn sluicectl")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn normalize_fractional_limit() -> Result<()> {
    let output = sluicectl(&["--limit", "0.5", "normalize"])?;
    assert!(output.status.success(), "{}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("configured limit=0.5 window=1s"), "{out}");
    assert!(out.contains("effective limit=1 window=2s"), "{out}");
    assert!(out.contains("rate 0.5/s"), "{out}");
    Ok(())
}

#[test]
fn init_then_check() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("limiter.toml");
    let path_str = path.to_str().context("utf8 path")?;

    let output = sluicectl(&["--limit", "3", "--kind", "sliding", "init", "--out", path_str])?;
    assert!(output.status.success(), "{}", stderr(&output));
    let raw = std::fs::read_to_string(&path)?;
    assert!(raw.contains("kind = \"sliding\""), "{raw}");
    assert!(raw.contains("limit = 3.0"), "{raw}");

    let output = sluicectl(&["--config", path_str, "check"])?;
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stdout(&output).contains("ok kind=sliding limit=3 window=1s"));
    Ok(())
}

#[test]
fn check_rejects_inverted_bounds() -> Result<()> {
    let output = sluicectl(&["--limit", "2", "--min-limit", "5", "--max-limit", "1", "check"])?;
    assert!(!output.status.success());
    assert!(stderr(&output).contains("below min_limit"), "{}", stderr(&output));
    Ok(())
}

#[test]
fn check_rejects_unknown_kind() -> Result<()> {
    let output = sluicectl(&["--kind", "rolling", "check"])?;
    assert!(!output.status.success());
    assert!(stderr(&output).contains("unknown window kind"), "{}", stderr(&output));
    Ok(())
}

#[test]
fn check_rejects_malformed_file() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("limiter.toml");
    std::fs::write(&path, "limit = \"lots\"\n")?;
    let output = sluicectl(&["--config", path.to_str().context("utf8 path")?, "check"])?;
    assert!(!output.status.success());
    assert!(stderr(&output).contains("parse limiter config"), "{}", stderr(&output));
    Ok(())
}

#[derive(Debug, serde::Deserialize)]
struct Admitted {
    task: usize,
    at_ms: f64,
}

fn parse_admissions(output: &Output) -> Result<Vec<Admitted>> {
    stdout(output)
        .lines()
        .map(|line| serde_json::from_str(line).context("parse admission line"))
        .collect()
}

#[test]
fn simulate_spreads_fixed_windows() -> Result<()> {
    let output = sluicectl(&[
        "--limit", "2", "--window", "0.2", "--no-release", "simulate", "--tasks", "5", "--json",
    ])?;
    assert!(output.status.success(), "{}", stderr(&output));
    let admitted = parse_admissions(&output)?;
    assert_eq!(admitted.len(), 5);

    let mut tasks: Vec<_> = admitted.iter().map(|a| a.task).collect();
    tasks.sort_unstable();
    assert_eq!(tasks, vec![0, 1, 2, 3, 4]);

    assert!(admitted[1].at_ms < 150.0, "{admitted:?}");
    assert!(admitted[2].at_ms >= 190.0, "{admitted:?}");
    assert!(admitted[4].at_ms >= 390.0, "{admitted:?}");
    Ok(())
}

#[test]
fn simulate_unlimited_admits_at_once() -> Result<()> {
    let output = sluicectl(&["--limit", "1", "simulate", "--tasks", "4", "--json", "--unlimited"])?;
    assert!(output.status.success(), "{}", stderr(&output));
    let admitted = parse_admissions(&output)?;
    assert_eq!(admitted.len(), 4);
    assert!(admitted.iter().all(|a| a.at_ms < 100.0), "{admitted:?}");
    Ok(())
}

#[test]
fn simulate_text_report() -> Result<()> {
    let output = sluicectl(&["--limit", "3", "--window", "0.1", "simulate", "--tasks", "3"])?;
    assert!(output.status.success(), "{}", stderr(&output));
    let out = stdout(&output);
    assert!(out.starts_with("started "), "{out}");
    assert!(out.contains("task=0"), "{out}");
    assert!(out.contains("admitted 3 tasks in"), "{out}");
    Ok(())
}

use std::process::{Command, Output};

use anyhow::Context as _;

fn status_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

fn surge(args: &[&str]) -> anyhow::Result<Output> {
    Command::new(env!("CARGO_BIN_EXE_surge"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .context("run surge binary")
}

fn expect_code(out: &Output, code: i32) -> anyhow::Result<()> {
    anyhow::ensure!(
        status_code(out.status) == code,
        "expected exit code {code}, got {}\nstdout:\n{}\nstderr:\n{}",
        status_code(out.status),
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr)
    );
    Ok(())
}

#[test]
fn invalid_flags_exit_30() -> anyhow::Result<()> {
    let out = surge(&["run", "--duration", "10x"])?;
    expect_code(&out, 30)?;

    let out = surge(&["run", "--model", "open", "--schedule", "rate(5)"])?;
    expect_code(&out, 30)?;
    let stderr = String::from_utf8_lossy(&out.stderr);
    anyhow::ensure!(stderr.contains("missing unit"), "stderr:\n{stderr}");
    Ok(())
}

#[test]
fn successful_run_exits_0() -> anyhow::Result<()> {
    let out = surge(&["run", "--users", "2", "--loops", "2", "--latency", "5ms"])?;
    expect_code(&out, 0)?;
    let stdout = String::from_utf8_lossy(&out.stdout);
    anyhow::ensure!(stdout.contains("samples: 4 total, 0 failed"), "stdout:\n{stdout}");
    Ok(())
}

#[test]
fn failed_samples_exit_10_with_ndjson() -> anyhow::Result<()> {
    let out = surge(&[
        "run",
        "--model",
        "open",
        "--schedule",
        "rate(20/sec, 250ms)",
        "--error-rate",
        "1",
        "--output",
        "json",
    ])?;
    expect_code(&out, 10)?;

    let stdout = String::from_utf8_lossy(&out.stdout);
    let lines: Vec<serde_json::Value> = stdout
        .lines()
        .map(serde_json::from_str)
        .collect::<Result<_, _>>()
        .context("stdout should be NDJSON")?;
    let (summary, samples) = lines.split_last().context("no output")?;
    anyhow::ensure!(samples.len() == 5, "expected 5 samples, got {}", samples.len());
    anyhow::ensure!(samples.iter().all(|s| s["kind"] == "sample" && s["success"] == false));
    anyhow::ensure!(summary["kind"] == "summary");
    anyhow::ensure!(summary["samples_failed"] == 5);
    Ok(())
}

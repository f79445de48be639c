use std::fs;
use std::path::Path;
use std::process;

use anyhow::{Context, Result};
use crucible_engine::{
    validate, EngineConfig, ExecutionEngine, ExecutionReport, ExecutionRequest, ExecutionStatus,
    Language, TestCase,
};

pub async fn run(
    file: &Path,
    tests: Option<&Path>,
    time_limit: Option<u64>,
    memory_limit_mb: Option<u64>,
    no_cache: bool,
    image: Option<String>,
    json: bool,
) -> Result<()> {
    let source = fs::read_to_string(file)
        .with_context(|| format!("reading source file {}", file.display()))?;

    let mut request = ExecutionRequest::new(Language::Python, source);
    if let Some(path) = tests {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading test file {}", path.display()))?;
        let cases: Vec<TestCase> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing test cases from {}", path.display()))?;
        request.test_cases = cases;
    }
    if let Some(seconds) = time_limit {
        request.time_limit_seconds = seconds;
    }
    if let Some(megabytes) = memory_limit_mb {
        request.memory_limit_bytes = megabytes * 1024 * 1024;
    }
    request.use_cache = !no_cache;

    let mut config = EngineConfig::default();
    if let Some(image) = image {
        config.sandbox_image = image;
    }
    let engine = ExecutionEngine::new(config).context("initializing the execution engine")?;

    let report = engine.execute(request).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    if report.status != ExecutionStatus::Success {
        process::exit(1);
    }
    Ok(())
}

pub fn check(file: &Path, json: bool) -> Result<()> {
    let source = fs::read_to_string(file)
        .with_context(|| format!("reading source file {}", file.display()))?;
    let verdict = validate(Language::Python, &source);

    if json {
        println!("{}", serde_json::to_string_pretty(&verdict)?);
    } else if verdict.allowed {
        println!("✓ {} passes static validation", file.display());
    } else {
        println!("✗ {} rejected:", file.display());
        for violation in &verdict.violations {
            println!("  - {violation}");
        }
    }
    if !verdict.allowed {
        process::exit(1);
    }
    Ok(())
}

pub async fn status(json: bool) -> Result<()> {
    let engine = ExecutionEngine::new(EngineConfig::default())
        .context("initializing the execution engine")?;
    let available = engine.is_runtime_available().await;
    let metrics = engine.metrics().await;

    if json {
        let value = serde_json::json!({
            "runtime_available": available,
            "metrics": metrics,
            "config": engine.config(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        let config = engine.config();
        let mib = 1024 * 1024;
        println!("runtime available: {}", if available { "yes" } else { "no" });
        println!("sandbox image:     {}", config.sandbox_image);
        println!("max sandboxes:     {}", config.max_sandboxes);
        println!(
            "time limit:        {}s (max {}s)",
            config.default_time_limit_seconds, config.max_time_limit_seconds
        );
        println!(
            "memory limit:      {}MiB (max {}MiB)",
            config.default_memory_limit_bytes / mib,
            config.max_memory_limit_bytes / mib
        );
        println!("cache TTL:         {}s", config.cache_ttl_seconds);
        println!("active sandboxes:  {}", metrics.active_sandboxes);
        println!("cached reports:    {}", metrics.cached_reports);
    }
    Ok(())
}

fn print_report(report: &ExecutionReport) {
    println!("status:   {}", report.status);
    println!(
        "duration: {}ms{}",
        report.duration_ms,
        if report.cache_hit { " (cached)" } else { "" }
    );
    if let Some(code) = report.exit_code {
        println!("exit:     {code}");
    }

    if !report.test_results.is_empty() {
        let passed = report.test_results.iter().filter(|r| r.passed).count();
        println!("\ntests: {passed}/{} passed", report.test_results.len());
        for result in &report.test_results {
            let mark = if result.passed { "✓" } else { "✗" };
            println!("  {mark} {}", result.name);
            if !result.passed {
                println!("      expected: {:?}", result.expected_output);
                println!("      actual:   {:?}", result.actual_output);
            }
        }
    }

    if !report.stdout.is_empty() {
        println!("\n--- stdout ---");
        println!("{}", report.stdout.trim_end());
    }
    if !report.stderr.is_empty() {
        println!("\n--- stderr ---");
        println!("{}", report.stderr.trim_end());
    }
}

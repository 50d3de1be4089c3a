//! Command-line runner: one-shot batch compression by default, continuous
//! watchdog mode with `--watch`.

use std::process::ExitCode;
use std::sync::Arc;
use std::{env, fs};

use pdf_squish::config::SquishConfig;
use pdf_squish::pipeline::{CompressionPipeline, ProgressTracker, WatchdogService};

fn load_config(path: Option<&str>) -> Result<SquishConfig, String> {
    let mut config = match path {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .map_err(|e| format!("cannot read config {}: {}", path, e))?;
            serde_json::from_str(&raw).map_err(|e| format!("invalid config {}: {}", path, e))?
        }
        None => SquishConfig::default(),
    };
    if let Ok(url) = env::var("DATABASE_URL") {
        config.database.url = url;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let mut watch = false;
    let mut config_path: Option<String> = None;
    for arg in env::args().skip(1) {
        match arg.as_str() {
            "--watch" => watch = true,
            "--help" | "-h" => {
                eprintln!("usage: pdf-squish [--watch] [config.json]");
                return ExitCode::SUCCESS;
            }
            other => config_path = Some(other.to_string()),
        }
    }

    let config = match load_config(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let tracker = Arc::new(ProgressTracker::new());

    if watch {
        let watchdog = match WatchdogService::connect(config, tracker.clone()).await {
            Ok(watchdog) => Arc::new(watchdog),
            Err(e) => {
                eprintln!("failed to start watchdog: {}", e);
                return ExitCode::FAILURE;
            }
        };
        Arc::clone(&watchdog).start().await;
        if tokio::signal::ctrl_c().await.is_err() {
            log::warn!("signal handler unavailable, stopping");
        }
        watchdog.close().await;
    } else {
        let pipeline = match CompressionPipeline::connect(config, tracker.clone()).await {
            Ok(pipeline) => pipeline,
            Err(e) => {
                eprintln!("failed to start pipeline: {}", e);
                return ExitCode::FAILURE;
            }
        };
        pipeline.calculate_initial_stats().await;
        if let Err(e) = pipeline.run().await {
            eprintln!("pipeline failed: {}", e);
            return ExitCode::FAILURE;
        }
        pipeline.calculate_final_stats().await;
    }

    match serde_json::to_string_pretty(&tracker.snapshot()) {
        Ok(report) => println!("{}", report),
        Err(e) => log::error!("failed to render final report: {}", e),
    }
    ExitCode::SUCCESS
}

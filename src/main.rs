//! Relay 演示驱动
//!
//! 入口：初始化日志、按配置构建编排器、后台启动 Reaper，
//! 然后像客户端自动重试一样反复调用 start_or_resume，直到作业进入终态。
//!
//! 用法：`relay [subject_id] [request text...]`

use std::time::Duration;

use anyhow::Context;
use relay::config::load_config;
use relay::core::{JobRequest, OrchestratorBuilder, Outcome};
use relay::observability;
use tokio_util::sync::CancellationToken;

/// 客户端最多续跑的次数
const MAX_INVOCATIONS: usize = 50;
/// 两次续跑之间的等待
const RESUME_BACKOFF: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let mut args = std::env::args().skip(1);
    let subject_id = args.next().unwrap_or_else(|| "demo".to_string());
    let input = {
        let rest: Vec<String> = args.collect();
        if rest.is_empty() {
            "Say hello through the echo tool".to_string()
        } else {
            rest.join(" ")
        }
    };

    let config = load_config(None).context("Failed to load config")?;
    let window = Duration::from_millis(config.engine.invocation_window_ms);

    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel();
    let orchestrator = OrchestratorBuilder::new(config)
        .with_event_tx(event_tx)
        .build()
        .await
        .context("Failed to build orchestrator")?;

    let shutdown = CancellationToken::new();
    let reaper = tokio::spawn(orchestrator.reaper().run(shutdown.clone()));
    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{line}");
            }
        }
    });

    let mut job_id: Option<String> = None;
    let mut request = Some(JobRequest::new(subject_id, input));
    let mut outcome = None;
    for invocation in 1..=MAX_INVOCATIONS {
        let deadline = chrono::Utc::now()
            + chrono::Duration::from_std(window).context("invocation window out of range")?;
        let result = orchestrator
            .start_or_resume(job_id.as_deref(), request.take(), deadline)
            .await
            .with_context(|| format!("Invocation {invocation} failed"))?;
        tracing::info!(invocation, outcome = ?result, "invocation returned");
        job_id = Some(result.job_id().to_string());
        if result.is_terminal() {
            outcome = Some(result);
            break;
        }
        tokio::time::sleep(RESUME_BACKOFF).await;
    }

    shutdown.cancel();
    let _ = reaper.await;
    drop(orchestrator);
    let _ = printer.await;

    match outcome {
        Some(Outcome::Completed { job_id, result }) => {
            println!("completed {job_id}: {result}");
        }
        Some(Outcome::Failed { job_id, error }) => {
            let hint = if error.is_retryable() {
                "try again later"
            } else {
                "do not retry"
            };
            println!("failed {job_id}: {error} ({hint})");
        }
        Some(Outcome::Paused { .. }) | None => {
            anyhow::bail!(
                "job {} still not finished after {MAX_INVOCATIONS} invocations",
                job_id.unwrap_or_default()
            );
        }
    }
    Ok(())
}

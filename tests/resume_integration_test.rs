//! 续跑集成测试：通过 ResumeOrchestrator 驱动完整的暂停 / 续跑 / 回收流程

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use common::*;
use relay::core::{EngineError, FailureKind, JobRequest, JobStatus, Outcome};
use relay::react::{Decision, Reasoner, ReasoningInput};
use relay::store::{CheckpointState, CheckpointStore, History, Turn, WorkingContext};
use relay::tools::Tool;

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

#[tokio::test(start_paused = true)]
async fn test_slow_initialization_pauses_then_completes_on_resume() {
    let reasoner = Arc::new(ScriptedReasoner::answering(secs(1), vec![tool_call("weather")]));
    let assembler = Arc::new(TimedAssembler::new(vec![secs(11), secs(5)]));
    let weather = CountingTool::ok("weather", Duration::from_millis(100));
    let e = engine(
        test_config(),
        reasoner.clone(),
        assembler.clone(),
        vec![weather.clone() as Arc<dyn Tool>],
    )
    .await;

    let first = e
        .orchestrator
        .start(JobRequest::new("oslo", "forecast"), e.deadline_in(secs(20)))
        .await
        .unwrap();
    let Outcome::Paused {
        job_id,
        progress_summary,
    } = first
    else {
        panic!("expected a paused outcome");
    };
    assert!(progress_summary.contains("oslo"));
    assert_eq!(reasoner.calls(), 0);

    let paused = e.orchestrator.get_status(&job_id).await.unwrap();
    assert_eq!(paused.status, JobStatus::Paused);
    let cp = paused.checkpoint.unwrap();
    assert!(!cp.initialization_complete);
    assert_eq!(cp.iteration_index, 0);
    let first_elapsed = cp.elapsed_ms;
    assert!(first_elapsed >= 10_700 && first_elapsed <= 12_000);

    let resumed_at = tokio::time::Instant::now();
    let second = e
        .orchestrator
        .resume(&job_id, e.deadline_in(secs(20)))
        .await
        .unwrap();
    // 初始化用掉 5s，推理在第 5s 开始，距 D - margin 还剩约 13s
    let first_reason_at = reasoner.seen_at.lock().unwrap()[0];
    let init_took = first_reason_at - resumed_at;
    assert!(init_took >= secs(5) && init_took < secs(5) + Duration::from_millis(100));
    let stop = resumed_at + secs(20) - secs(2);
    assert!(stop - first_reason_at > Duration::from_millis(12_900));
    assert_eq!(
        second,
        Outcome::Completed {
            job_id: job_id.clone(),
            result: "all done".into()
        }
    );
    assert_eq!(assembler.calls(), 2);
    assert_eq!(weather.calls(), 1);

    let done = e.orchestrator.get_status(&job_id).await.unwrap();
    let cp = done.checkpoint.unwrap();
    assert!(cp.initialization_complete);
    assert_eq!(cp.iteration_index, 1);
    assert!(cp.elapsed_ms > first_elapsed);
    assert!(done.owner.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_breaker_unrecoverable_within_job_budget_fails_job() {
    let mut cfg = test_config();
    cfg.engine.job_time_budget_ms = Some(60_000);
    cfg.breaker.failure_threshold = 3;
    cfg.breaker.open_ms = 300_000;
    let reasoner = Arc::new(ScriptedReasoner::new(
        Duration::from_millis(50),
        vec![],
        tool_call("weather"),
    ));
    let weather = CountingTool::failing("weather", Duration::from_millis(100));
    let e = engine(
        cfg,
        reasoner,
        Arc::new(TimedAssembler::instant()),
        vec![weather.clone() as Arc<dyn Tool>],
    )
    .await;

    let out = e
        .orchestrator
        .start(JobRequest::new("oslo", "forecast"), e.deadline_in(secs(120)))
        .await
        .unwrap();
    let Outcome::Failed { job_id, error } = out else {
        panic!("expected a failed outcome");
    };
    assert_eq!(error.kind, FailureKind::DependencyUnavailable);
    assert!(error.is_retryable());
    assert_eq!(weather.calls(), 3);

    let job = e.orchestrator.get_status(&job_id).await.unwrap();
    let history = job.checkpoint.unwrap().conversation_history;
    assert!(matches!(history.last(), Some(Turn::ToolError { .. })));
}

/// 推理服务一直不可用
struct DownReasoner;

#[async_trait]
impl Reasoner for DownReasoner {
    async fn reason(&self, _input: &ReasoningInput<'_>) -> Result<Decision, String> {
        Err("reasoning service unavailable (503)".into())
    }
}

#[tokio::test(start_paused = true)]
async fn test_dead_reasoner_fails_job_after_stalled_invocations() {
    let e = engine(
        test_config(),
        Arc::new(DownReasoner),
        Arc::new(TimedAssembler::instant()),
        vec![],
    )
    .await;

    let first = e
        .orchestrator
        .start(JobRequest::new("oslo", "forecast"), e.deadline_in(secs(20)))
        .await
        .unwrap();
    assert!(!first.is_terminal());
    let job_id = first.job_id().to_string();
    let cp = e.orchestrator.get_status(&job_id).await.unwrap().checkpoint.unwrap();
    assert!(cp.initialization_complete);
    assert_eq!(cp.stalled_invocations, 0);

    let mut invocations = 1;
    let mut outcome = first;
    while !outcome.is_terminal() && invocations < 10 {
        outcome = e
            .orchestrator
            .resume(&job_id, e.deadline_in(secs(20)))
            .await
            .unwrap();
        invocations += 1;
    }
    let Outcome::Failed { error, .. } = outcome else {
        panic!("expected the job to give up");
    };
    assert_eq!(error.kind, FailureKind::DependencyUnavailable);
    assert!(error.is_retryable());
    // 首次调用完成了初始化，之后连续 5 次没有推进
    assert_eq!(invocations, 6);

    let job = e.orchestrator.get_status(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.checkpoint.unwrap().stalled_invocations, 5);
}

#[tokio::test(start_paused = true)]
async fn test_initialization_that_never_fits_fails_job() {
    let assembler = Arc::new(TimedAssembler::new(vec![secs(60); 10]));
    let reasoner = Arc::new(ScriptedReasoner::answering(secs(1), vec![]));
    let e = engine(test_config(), reasoner.clone(), assembler.clone(), vec![]).await;

    let mut outcome = e
        .orchestrator
        .start(JobRequest::new("oslo", "forecast"), e.deadline_in(secs(20)))
        .await
        .unwrap();
    let job_id = outcome.job_id().to_string();
    while !outcome.is_terminal() && assembler.calls() < 10 {
        outcome = e
            .orchestrator
            .resume(&job_id, e.deadline_in(secs(20)))
            .await
            .unwrap();
    }
    let Outcome::Failed { error, .. } = outcome else {
        panic!("expected the job to give up");
    };
    assert_eq!(error.kind, FailureKind::DependencyUnavailable);
    assert!(error.to_string().contains("gathering context"));
    assert_eq!(assembler.calls(), 5);
    assert_eq!(reasoner.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_short_window_with_default_tool_settings_completes() {
    // 默认配置：单次超时 10s、余量 3s；10s 窗口只剩 7s 可用
    let cfg = relay::config::AppConfig::default();
    let reasoner = Arc::new(ScriptedReasoner::answering(secs(1), vec![tool_call("weather")]));
    let weather = CountingTool::ok("weather", Duration::from_millis(100));
    let e = engine(
        cfg,
        reasoner.clone(),
        Arc::new(TimedAssembler::instant()),
        vec![weather.clone() as Arc<dyn Tool>],
    )
    .await;

    let out = e
        .orchestrator
        .start(JobRequest::new("oslo", "forecast"), e.deadline_in(secs(10)))
        .await
        .unwrap();
    assert!(matches!(out, Outcome::Completed { ref result, .. } if result == "all done"));
    assert_eq!(reasoner.calls(), 2);
    assert_eq!(weather.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_progress_is_monotonic_across_invocations() {
    let mut cfg = test_config();
    cfg.engine.max_iterations = 6;
    cfg.engine.safety_margin_ms = 1_000;
    cfg.tools.per_tool_timeout_ms = 1_500;
    let reasoner = Arc::new(ScriptedReasoner::new(secs(1), vec![], tool_call("lookup")));
    let lookup = CountingTool::ok("lookup", Duration::from_millis(500));
    let e = engine(
        cfg,
        reasoner,
        Arc::new(TimedAssembler::instant()),
        vec![lookup.clone() as Arc<dyn Tool>],
    )
    .await;

    let mut outcome = e
        .orchestrator
        .start(JobRequest::new("station-7", "collect readings"), e.deadline_in(secs(5)))
        .await
        .unwrap();
    let job_id = outcome.job_id().to_string();
    let mut progress = Vec::new();
    let mut invocations = 1;
    while !outcome.is_terminal() {
        let job = e.orchestrator.get_status(&job_id).await.unwrap();
        let cp = job.checkpoint.unwrap();
        progress.push((cp.iteration_index, cp.elapsed_ms));
        assert!(invocations < 20, "job never terminated");
        outcome = e
            .orchestrator
            .resume(&job_id, e.deadline_in(secs(5)))
            .await
            .unwrap();
        invocations += 1;
    }

    assert!(invocations >= 3);
    for pair in progress.windows(2) {
        assert!(pair[0].0 <= pair[1].0, "iteration went backwards: {progress:?}");
        assert!(pair[0].1 <= pair[1].1, "elapsed went backwards: {progress:?}");
    }
    let Outcome::Failed { error, .. } = outcome else {
        panic!("expected the iteration ceiling to fail the job");
    };
    assert_eq!(error.kind, FailureKind::IterationCeiling);
    assert_eq!(lookup.calls(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_checkpoint_survives_killed_invocation() {
    let reasoner = Arc::new(ScriptedReasoner::answering(Duration::from_millis(10), vec![]));
    let e = engine(
        test_config(),
        reasoner.clone(),
        Arc::new(TimedAssembler::instant()),
        vec![],
    )
    .await;
    let jobs = e.orchestrator.jobs();

    // 一次调用写完第二轮检查点后被强制终止，没有返回也没有暂停
    let job = jobs
        .create(JobRequest::new("oslo", "forecast"), "Looking up oslo")
        .await
        .unwrap();
    jobs.claim(&job.id, "inv_dead").await.unwrap();
    let mut history = History::new();
    for i in 0..2 {
        history = history
            .with(Turn::ToolCall {
                iteration: i,
                tool: "weather".into(),
                params: json!({}),
            })
            .with(Turn::ToolResult {
                iteration: i,
                tool: "weather".into(),
                output: format!("reading {i}"),
            });
    }
    let saved = CheckpointState {
        conversation_history: history.clone(),
        iteration_index: 2,
        initialization_complete: true,
        elapsed_ms: 4_000,
        partial_result: "2 readings collected".into(),
        context: Some(WorkingContext::new("Profile for oslo", json!({}))),
        ..CheckpointState::default()
    };
    CheckpointStore::new(e.store.clone(), e.clock.clone())
        .save(&job.id, "inv_dead", &saved)
        .await
        .unwrap();

    // 客户端重试时旧调用仍占有：不驱动，只返回已存进度
    let out = e
        .orchestrator
        .resume(&job.id, e.deadline_in(secs(20)))
        .await
        .unwrap();
    assert_eq!(
        out,
        Outcome::Paused {
            job_id: job.id.clone(),
            progress_summary: "2 readings collected".into()
        }
    );
    assert_eq!(reasoner.calls(), 0);

    tokio::time::sleep(secs(31)).await;
    let report = e.orchestrator.reaper().sweep().await.unwrap();
    assert_eq!(report.requeued, vec![job.id.clone()]);

    let out = e
        .orchestrator
        .resume(&job.id, e.deadline_in(secs(20)))
        .await
        .unwrap();
    assert!(matches!(out, Outcome::Completed { .. }));
    assert_eq!(*reasoner.seen_history.lock().unwrap(), vec![4]);

    let done = e.orchestrator.get_status(&job.id).await.unwrap();
    assert_eq!(done.retry_count, 1);
    let cp = done.checkpoint.unwrap();
    assert_eq!(&cp.conversation_history.turns()[..4], history.turns());
    assert_eq!(cp.iteration_index, 2);
    assert!(cp.elapsed_ms >= 4_000);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_inflight_invocation() {
    let reasoner = Arc::new(ScriptedReasoner::answering(secs(3), vec![tool_call("weather")]));
    let weather = CountingTool::ok("weather", Duration::from_millis(100));
    let e = engine(
        test_config(),
        reasoner,
        Arc::new(TimedAssembler::instant()),
        vec![weather.clone() as Arc<dyn Tool>],
    )
    .await;
    let job = e
        .orchestrator
        .jobs()
        .create(JobRequest::new("oslo", "forecast"), "Looking up oslo")
        .await
        .unwrap();

    let (driven, cancelled) = tokio::join!(
        e.orchestrator.resume(&job.id, e.deadline_in(secs(60))),
        async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            e.orchestrator.cancel(&job.id, "user closed the page").await
        }
    );

    let cancelled = cancelled.unwrap();
    let Outcome::Failed { error, .. } = &cancelled else {
        panic!("expected cancellation to fail the job");
    };
    assert_eq!(error.kind, FailureKind::Cancelled);
    assert!(!error.is_retryable());
    // 落败的调用不覆盖取消，也不再发起工具调用
    assert_eq!(driven.unwrap(), cancelled);
    assert_eq!(weather.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_invocations_only_one_drives() {
    let reasoner = Arc::new(ScriptedReasoner::answering(secs(1), vec![]));
    let e = engine(
        test_config(),
        reasoner.clone(),
        Arc::new(TimedAssembler::instant()),
        vec![],
    )
    .await;
    let job = e
        .orchestrator
        .jobs()
        .create(JobRequest::new("oslo", "forecast"), "Looking up oslo")
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        e.orchestrator.resume(&job.id, e.deadline_in(secs(30))),
        e.orchestrator.resume(&job.id, e.deadline_in(secs(30)))
    );
    let outcomes = [a.unwrap(), b.unwrap()];
    assert_eq!(outcomes.iter().filter(|o| o.is_terminal()).count(), 1);
    assert_eq!(reasoner.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_terminal_job_returns_stored_result() {
    let reasoner = Arc::new(ScriptedReasoner::answering(Duration::ZERO, vec![]));
    let e = engine(
        test_config(),
        reasoner.clone(),
        Arc::new(TimedAssembler::instant()),
        vec![],
    )
    .await;
    let first = e
        .orchestrator
        .start(JobRequest::new("oslo", "forecast"), e.deadline_in(secs(30)))
        .await
        .unwrap();
    let id = first.job_id().to_string();

    let again = e.orchestrator.resume(&id, e.deadline_in(secs(30))).await.unwrap();
    assert_eq!(again, first);
    assert_eq!(reasoner.calls(), 1);

    // 对已完成作业的取消与重复完成都是无操作
    assert_eq!(e.orchestrator.cancel(&id, "late").await.unwrap(), first);
    let job = e.orchestrator.jobs().complete(&id, "something else").await.unwrap();
    assert_eq!(job.result.as_deref(), Some("all done"));
}

#[tokio::test]
async fn test_request_errors() {
    let e = engine(
        test_config(),
        Arc::new(ScriptedReasoner::answering(Duration::ZERO, vec![])),
        Arc::new(TimedAssembler::instant()),
        vec![],
    )
    .await;
    let deadline = e.deadline_in(secs(30));

    let err = e.orchestrator.resume("job_missing", deadline).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(id) if id == "job_missing"));

    let err = e
        .orchestrator
        .start_or_resume(None, None, deadline)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));

    let err = e
        .orchestrator
        .start(JobRequest::new("  ", "forecast"), deadline)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));
}

//! 迭代循环（ReAct）
//!
//! 一次调用内：初始化（组装上下文，受初始化预算约束）→ 反复 reason → act → observe。
//! 每个单元开始前检查预算，从不在单元中途中断；每完成一轮就写检查点（提交点）。
//! 预算耗尽时写检查点并暂停，返回 `SessionOutcome::Paused` 而不是错误。
//! 连续 `max_stalled_invocations` 次调用既没有完成初始化也没有推进迭代，则判定依赖不可用并失败。
//! 任何 compare-and-set 冲突都意味着作业已被接手（另一调用、Reaper 或取消），立即退出。

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::core::budget::{BudgetPolicy, InvocationBudget};
use crate::core::clock::until;
use crate::core::error::{EngineError, FailureKind, InvokeError, JobFailure, StoreError};
use crate::core::job::{Job, JobStatus};
use crate::core::state_machine::JobStateMachine;
use crate::react::{ContextAssembler, Decision, ReactEvent, Reasoner, ReasoningInput};
use crate::store::{CheckpointState, CheckpointStore, ToolErrorKind, Turn};
use crate::tools::{RetryingInvoker, ToolRegistry};

/// 推理调用在熔断器中的依赖名
pub const REASONER_KEY: &str = "reasoner";
/// Observation 预览最大字符数
const OBSERVATION_PREVIEW_CHARS: usize = 200;

/// 一次调用驱动作业所需的全部协作者
pub struct ReactSession<'a> {
    pub jobs: &'a JobStateMachine,
    pub checkpoints: &'a CheckpointStore,
    pub invoker: &'a RetryingInvoker,
    pub tools: &'a ToolRegistry,
    pub reasoner: &'a dyn Reasoner,
    pub assembler: &'a dyn ContextAssembler,
    pub policy: &'a BudgetPolicy,
    pub max_iterations: u32,
    pub max_stalled_invocations: u32,
    /// 心跳失败或外部取消时触发；循环在下一个单元开始前退出
    pub cancel_token: CancellationToken,
    pub event_tx: Option<&'a UnboundedSender<ReactEvent>>,
}

/// 本次调用的结局
#[derive(Debug)]
pub enum SessionOutcome {
    Completed(Job),
    Failed(Job),
    Paused(Job),
    /// 作业已被其它写入者推进，本次调用不再拥有它
    Superseded,
}

/// 调用开始时的进度，用于判断本次调用是否有推进
#[derive(Debug, Clone, Copy)]
struct StartMark {
    iteration: u32,
    initialized: bool,
}

impl StartMark {
    fn of(cp: &CheckpointState) -> Self {
        Self {
            iteration: cp.iteration_index,
            initialized: cp.initialization_complete,
        }
    }

    fn advanced(&self, cp: &CheckpointState) -> bool {
        cp.iteration_index > self.iteration || (cp.initialization_complete && !self.initialized)
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() > OBSERVATION_PREVIEW_CHARS {
        text.chars().take(OBSERVATION_PREVIEW_CHARS).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}

impl<'a> ReactSession<'a> {
    fn now(&self) -> DateTime<Utc> {
        self.jobs.clock().now()
    }

    fn send_event(&self, ev: ReactEvent) {
        if let Some(tx) = self.event_tx {
            let _ = tx.send(ev);
        }
    }

    /// 依赖在作业剩余全局预算内无法恢复：熔断打开且下次探测晚于全局预算结束
    fn unrecoverable(&self, key: &str, budget: &InvocationBudget) -> bool {
        match (self.invoker.breakers().next_probe_at(key), budget.global_end()) {
            (Some(probe_at), Some(end)) => probe_at > end,
            _ => false,
        }
    }

    fn superseded(&self, job_id: &str) -> SessionOutcome {
        tracing::info!(job_id = %job_id, "job taken over by another writer, stopping");
        self.send_event(ReactEvent::Superseded {
            job_id: job_id.to_string(),
        });
        SessionOutcome::Superseded
    }

    fn finished(&self, job: Job) -> SessionOutcome {
        match job.status {
            JobStatus::Completed => {
                self.send_event(ReactEvent::Completed {
                    job_id: job.id.clone(),
                });
                SessionOutcome::Completed(job)
            }
            JobStatus::Failed => {
                if let Some(error) = job.error.clone() {
                    self.send_event(ReactEvent::Failed {
                        job_id: job.id.clone(),
                        error,
                    });
                }
                SessionOutcome::Failed(job)
            }
            _ => self.superseded(&job.id),
        }
    }

    async fn pause_job(
        &self,
        job_id: &str,
        token: &str,
        checkpoint: CheckpointState,
    ) -> Result<SessionOutcome, EngineError> {
        let iteration = checkpoint.iteration_index;
        match self.jobs.pause(job_id, token, checkpoint).await {
            Ok(job) => {
                self.send_event(ReactEvent::Paused {
                    job_id: job_id.to_string(),
                    iteration,
                });
                Ok(SessionOutcome::Paused(job))
            }
            Err(e) if e.is_conflict() => Ok(self.superseded(job_id)),
            Err(e) => Err(e),
        }
    }

    /// 暂停；本次调用毫无推进时累计停滞次数，达到上限则失败
    async fn pause_or_give_up(
        &self,
        job_id: &str,
        token: &str,
        mut checkpoint: CheckpointState,
        mark: StartMark,
    ) -> Result<SessionOutcome, EngineError> {
        if mark.advanced(&checkpoint) {
            checkpoint.stalled_invocations = 0;
            return self.pause_job(job_id, token, checkpoint).await;
        }
        checkpoint.stalled_invocations += 1;
        let stalled = checkpoint.stalled_invocations;
        tracing::info!(job_id = %job_id, stalled, "invocation made no progress");
        if stalled < self.max_stalled_invocations {
            return self.pause_job(job_id, token, checkpoint).await;
        }
        let what = if checkpoint.initialization_complete {
            "the next step"
        } else {
            "gathering context"
        };
        let failure = JobFailure::new(
            FailureKind::DependencyUnavailable,
            format!("No progress on {what} after {stalled} attempts; a required service seems unavailable"),
        );
        self.fail_job(job_id, token, failure, checkpoint).await
    }

    async fn fail_job(
        &self,
        job_id: &str,
        token: &str,
        failure: JobFailure,
        checkpoint: CheckpointState,
    ) -> Result<SessionOutcome, EngineError> {
        tracing::warn!(job_id = %job_id, kind = ?failure.kind, error = %failure, "job failing");
        match self
            .jobs
            .fail_owned(job_id, token, failure, Some(checkpoint))
            .await
        {
            Ok(job) => Ok(self.finished(job)),
            Err(e) if e.is_conflict() => Ok(self.superseded(job_id)),
            Err(e) => Err(e),
        }
    }

    async fn complete_job(
        &self,
        job_id: &str,
        token: &str,
        answer: &str,
        checkpoint: CheckpointState,
    ) -> Result<SessionOutcome, EngineError> {
        match self
            .jobs
            .complete_owned(job_id, token, answer, checkpoint)
            .await
        {
            Ok(job) => Ok(self.finished(job)),
            Err(e) if e.is_conflict() => Ok(self.superseded(job_id)),
            Err(e) => Err(e),
        }
    }
}

/// 驱动一个已由 `token` 占有（Processing）的作业，直到完成、失败、暂停或被接手
///
/// `hard_deadline` 是宿主进程会被强制终止的时刻。
pub async fn run_session(
    session: &ReactSession<'_>,
    job: Job,
    token: &str,
    hard_deadline: DateTime<Utc>,
) -> Result<SessionOutcome, EngineError> {
    let job_id = job.id.clone();
    let mut cp = match session.checkpoints.load(&job_id).await {
        Ok(cp) => cp.unwrap_or_default(),
        Err(StoreError::Corrupt(e)) => {
            let failure =
                JobFailure::new(FailureKind::Fatal, format!("Saved progress is unreadable: {e}"));
            return session
                .fail_job(&job_id, token, failure, CheckpointState::default())
                .await;
        }
        Err(e) => return Err(EngineError::from_store(e)),
    };
    let mark = StartMark::of(&cp);
    let started = session.now();
    let budget = session.policy.allocate(
        hard_deadline,
        started,
        cp.elapsed_ms,
        cp.initialization_complete,
    );
    let base_elapsed = cp.elapsed_ms;
    let elapsed_at = |now: DateTime<Utc>| base_elapsed + budget.spent(now).as_millis() as u64;

    tracing::info!(
        job_id = %job_id,
        iteration = cp.iteration_index,
        invocation_ms = budget.invocation_budget().as_millis() as u64,
        initialization_ms = budget.initialization_budget().as_millis() as u64,
        "session started"
    );
    session.send_event(ReactEvent::Claimed {
        job_id: job_id.clone(),
        iteration: cp.iteration_index,
    });

    if budget.global_exhausted() {
        let failure = JobFailure::new(
            FailureKind::BudgetExhausted,
            format!("Job used its whole time budget ({}ms)", cp.elapsed_ms),
        );
        return session.fail_job(&job_id, token, failure, cp).await;
    }
    if cp.iteration_index >= session.max_iterations {
        let failure = JobFailure::new(
            FailureKind::IterationCeiling,
            format!("Job reached the limit of {} steps", session.max_iterations),
        );
        return session.fail_job(&job_id, token, failure, cp).await;
    }

    // 初始化
    if !cp.initialization_complete {
        if session.cancel_token.is_cancelled() {
            return Ok(session.superseded(&job_id));
        }
        let init_budget = budget.init_remaining(session.now());
        if init_budget.is_zero() {
            cp.elapsed_ms = elapsed_at(session.now());
            return session.pause_or_give_up(&job_id, token, cp, mark).await;
        }
        match tokio::time::timeout(init_budget, session.assembler.assemble(&job.request)).await {
            Ok(Ok(context)) => {
                cp.partial_result = context.summary.clone();
                cp.context = Some(context);
                cp.initialization_complete = true;
                cp.stalled_invocations = 0;
                cp.elapsed_ms = elapsed_at(session.now());
                match session.checkpoints.save(&job_id, token, &cp).await {
                    Ok(_) => {}
                    Err(StoreError::Conflict { .. }) => return Ok(session.superseded(&job_id)),
                    Err(e) => return Err(EngineError::from_store(e)),
                }
                tracing::info!(job_id = %job_id, "initialization complete");
                session.send_event(ReactEvent::Initialized {
                    job_id: job_id.clone(),
                });
            }
            Ok(Err(e)) => {
                cp.elapsed_ms = elapsed_at(session.now());
                let failure = JobFailure::new(
                    FailureKind::ContextAssembly,
                    format!("Could not gather context for {}: {e}", job.request.subject_id),
                );
                return session.fail_job(&job_id, token, failure, cp).await;
            }
            Err(_) => {
                tracing::info!(
                    job_id = %job_id,
                    budget_ms = init_budget.as_millis() as u64,
                    "initialization ran out of budget"
                );
                cp.elapsed_ms = elapsed_at(session.now());
                return session.pause_or_give_up(&job_id, token, cp, mark).await;
            }
        }
    }

    // 迭代：单元预估取本次调用内观测到的最长单元
    let mut unit_estimate = Duration::ZERO;
    loop {
        if session.cancel_token.is_cancelled() {
            return Ok(session.superseded(&job_id));
        }
        let unit_started = session.now();
        if cp.iteration_index >= session.max_iterations {
            tracing::info!(job_id = %job_id, iteration = cp.iteration_index, "iteration ceiling reached");
            cp.elapsed_ms = elapsed_at(unit_started);
            return session.pause_or_give_up(&job_id, token, cp, mark).await;
        }
        if !budget.can_start_unit(unit_started, unit_estimate) {
            tracing::info!(
                job_id = %job_id,
                remaining_ms = budget.remaining(unit_started).as_millis() as u64,
                estimate_ms = unit_estimate.as_millis() as u64,
                "not enough budget for another step"
            );
            cp.elapsed_ms = elapsed_at(unit_started);
            return session.pause_or_give_up(&job_id, token, cp, mark).await;
        }

        let iteration = cp.iteration_index;

        // reason
        let input = ReasoningInput {
            request: &job.request,
            context: cp.context.as_ref(),
            history: &cp.conversation_history,
            iteration,
        };
        let reasoner = session.reasoner;
        let decision = match session
            .invoker
            .call(REASONER_KEY, budget.stop_at(), || reasoner.reason(&input))
            .await
        {
            Ok(decision) => decision,
            Err(InvokeError::BudgetExhausted { .. }) => {
                cp.elapsed_ms = elapsed_at(session.now());
                return session.pause_or_give_up(&job_id, token, cp, mark).await;
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, iteration, error = %e, "reasoning unavailable");
                cp.elapsed_ms = elapsed_at(session.now());
                if session.unrecoverable(REASONER_KEY, &budget) {
                    let failure = JobFailure::new(
                        FailureKind::DependencyUnavailable,
                        format!("The reasoning service is unavailable: {e}"),
                    );
                    return session.fail_job(&job_id, token, failure, cp).await;
                }
                return session.pause_or_give_up(&job_id, token, cp, mark).await;
            }
        };

        let (thought, tool_name, params) = match decision {
            Decision::FinalAnswer { answer } => {
                cp.conversation_history = cp.conversation_history.with(Turn::Reasoning {
                    iteration,
                    text: answer.clone(),
                });
                cp.partial_result = answer.clone();
                cp.elapsed_ms = elapsed_at(session.now());
                return session.complete_job(&job_id, token, &answer, cp).await;
            }
            Decision::Abort { reason } => {
                cp.conversation_history = cp.conversation_history.with(Turn::Reasoning {
                    iteration,
                    text: reason.clone(),
                });
                cp.elapsed_ms = elapsed_at(session.now());
                let failure = JobFailure::new(FailureKind::Fatal, reason);
                return session.fail_job(&job_id, token, failure, cp).await;
            }
            Decision::ToolCall {
                thought,
                tool,
                params,
            } => (thought, tool, params),
        };
        if session.cancel_token.is_cancelled() {
            return Ok(session.superseded(&job_id));
        }

        // act：本轮的 turn 先暂存，整轮完成后才进入历史
        let mut pending = Vec::with_capacity(3);
        if let Some(text) = thought {
            session.send_event(ReactEvent::Reasoning {
                iteration,
                text: text.clone(),
            });
            pending.push(Turn::Reasoning { iteration, text });
        }
        session.send_event(ReactEvent::ToolCall {
            iteration,
            tool: tool_name.clone(),
            args: params.clone(),
        });
        pending.push(Turn::ToolCall {
            iteration,
            tool: tool_name.clone(),
            params: params.clone(),
        });

        let tools = session.tools;
        let observed = if !tools.contains(&tool_name) {
            Turn::ToolError {
                iteration,
                tool: tool_name.clone(),
                error: ToolErrorKind::Failed,
                message: format!("Unknown tool: {tool_name}"),
            }
        } else {
            match session
                .invoker
                .call(&tool_name, budget.stop_at(), || {
                    tools.execute(&tool_name, params.clone())
                })
                .await
            {
                Ok(output) => Turn::ToolResult {
                    iteration,
                    tool: tool_name.clone(),
                    output,
                },
                Err(InvokeError::BudgetExhausted { .. }) => {
                    tracing::info!(job_id = %job_id, tool = %tool_name, "no budget left for tool call");
                    cp.elapsed_ms = elapsed_at(session.now());
                    return session.pause_or_give_up(&job_id, token, cp, mark).await;
                }
                Err(InvokeError::BreakerOpen { retry_at, .. }) => Turn::ToolError {
                    iteration,
                    tool: tool_name.clone(),
                    error: ToolErrorKind::BreakerOpen,
                    message: format!("{tool_name} is temporarily unavailable until {retry_at}"),
                },
                Err(e) => {
                    let turn = Turn::ToolError {
                        iteration,
                        tool: tool_name.clone(),
                        error: ToolErrorKind::Failed,
                        message: e.to_string(),
                    };
                    if session.unrecoverable(&tool_name, &budget) {
                        for t in pending.drain(..).chain(std::iter::once(turn)) {
                            cp.conversation_history = cp.conversation_history.with(t);
                        }
                        cp.elapsed_ms = elapsed_at(session.now());
                        let failure = JobFailure::new(
                            FailureKind::DependencyUnavailable,
                            format!("{tool_name} stayed unavailable: {e}"),
                        );
                        return session.fail_job(&job_id, token, failure, cp).await;
                    }
                    turn
                }
            }
        };

        // observe
        match &observed {
            Turn::ToolResult { output, .. } => session.send_event(ReactEvent::Observation {
                iteration,
                tool: tool_name.clone(),
                preview: preview(output),
            }),
            Turn::ToolError { error, message, .. } => session.send_event(ReactEvent::ToolFailure {
                iteration,
                tool: tool_name.clone(),
                breaker_open: *error == ToolErrorKind::BreakerOpen,
                reason: message.clone(),
            }),
            _ => {}
        }
        let latest = match &observed {
            Turn::ToolResult { output, .. } => preview(output),
            Turn::ToolError { message, .. } => message.clone(),
            _ => String::new(),
        };
        for t in pending.into_iter().chain(std::iter::once(observed)) {
            cp.conversation_history = cp.conversation_history.with(t);
        }
        cp.iteration_index += 1;
        cp.stalled_invocations = 0;
        cp.partial_result = format!(
            "{} step(s) done; latest from {tool_name}: {latest}",
            cp.iteration_index
        );
        let now = session.now();
        cp.elapsed_ms = elapsed_at(now);

        // 提交点（同时刷新心跳）
        match session.checkpoints.save(&job_id, token, &cp).await {
            Ok(_) => {}
            Err(StoreError::Conflict { .. }) => return Ok(session.superseded(&job_id)),
            Err(e) => return Err(EngineError::from_store(e)),
        }
        tracing::debug!(job_id = %job_id, iteration = cp.iteration_index, tool = %tool_name, "step committed");

        unit_estimate = unit_estimate.max(until(unit_started, now));
    }
}

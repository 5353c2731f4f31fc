//! 核心层：作业模型与状态机、时间预算、Reaper、Resume Orchestrator

pub mod budget;
pub mod builder;
pub mod clock;
pub mod error;
pub mod job;
pub mod orchestrator;
pub mod reaper;
pub mod state_machine;

pub use budget::{BudgetPolicy, InvocationBudget};
pub use builder::{create_llm_from_config, open_store_from_config, OrchestratorBuilder};
pub use clock::{Clock, SystemClock, TokioClock};
pub use error::{EngineError, FailureKind, InvokeError, JobFailure, StoreError};
pub use job::{Expected, Job, JobPatch, JobRequest, JobStatus};
pub use orchestrator::{Outcome, ReaperSettings, ResumeOrchestrator};
pub use reaper::{ReapReport, Reaper};
pub use state_machine::JobStateMachine;

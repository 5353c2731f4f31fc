//! 认知层：推理步骤与上下文组装协作者、迭代循环、过程事件

pub mod context;
pub mod events;
pub mod loop_;
pub mod planner;

pub use context::{ContextAssembler, StaticContextAssembler};
pub use events::ReactEvent;
pub use loop_::{run_session, ReactSession, SessionOutcome, REASONER_KEY};
pub use planner::{parse_llm_output, Decision, LlmReasoner, Reasoner, ReasoningInput};

//! 工具层：注册表（Tool Dispatcher）、熔断器、重试调用器与内置工具

pub mod breaker;
pub mod echo;
pub mod fetch;
pub mod invoker;
pub mod registry;

pub use breaker::{Admission, BreakerPolicy, BreakerRegistry, BreakerState, CircuitBreakerState};
pub use echo::EchoTool;
pub use fetch::FetchTool;
pub use invoker::{RetryPolicy, RetryingInvoker};
pub use registry::{Tool, ToolRegistry};

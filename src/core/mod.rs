//! 核心层：错误类型、程序定义、执行上下文、运行时构建与并行调度

pub mod builder;
pub mod context;
pub mod error;
pub mod program;
pub mod task_scheduler;

pub use builder::{Runtime, RuntimeBuilder};
pub use context::{
    ExecutionContext, Isolation, ToolSourceScope, AGENT_CALL_LIMIT, PARALLEL_AGENT_LIMIT,
};
pub use error::{Boundary, Result, RuntimeError};
pub use program::{
    agent_id_from_name, AgentProfile, AiProfile, FieldSpec, MemoryConfig, Program, ToolDefinition,
};
pub use task_scheduler::TaskScheduler;

//! 工具层：注册表、执行器、声明与调用策略

pub mod echo;
pub mod executor;
pub mod registry;
pub mod schema;

pub use echo::EchoTool;
pub use executor::{RegistryToolExecutor, ToolCallContext, ToolCallSource, ToolExecutor, ToolOutcome};
pub use registry::{Tool, ToolRegistry};
pub use schema::{build_declarations, build_json_schema, ToolCallPolicy, ToolDeclaration};

pub mod bus;
pub mod error;
pub mod http_adapter;
pub mod invoker;
pub mod ledger;
pub mod registry;
pub mod workflow;

pub use bus::EventBus;
pub use error::EngineError;
pub use invoker::ToolInvoker;
pub use ledger::BudgetLedger;
pub use registry::AdapterRegistry;
pub use workflow::{WorkflowEngine, WorkflowRegistry};

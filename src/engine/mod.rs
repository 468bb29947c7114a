mod chain;
mod flow;
mod node;
mod node_ctx;
mod parser;
pub mod rule;
mod version;

pub use chain::RuleChainCtx;
pub(crate) use flow::MsgFlow;
pub use flow::{MsgOptions, OnCompletedFn, OnEndFn};
pub use node::*;
pub use node_ctx::*;
pub use parser::*;
pub use rule::{DynRuleEngine, LoadedChain, RuleEngine, RuleEngineTrait};
pub use version::*;

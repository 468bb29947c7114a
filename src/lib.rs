pub mod aop;
pub mod components;
pub mod endpoint;
pub mod engine;
pub mod shared;
pub mod types;
pub mod utils;

pub use engine::{DynRuleEngine, LoadedChain, MsgOptions, RuleEngine, RuleEngineTrait};
pub use types::*;

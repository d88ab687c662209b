pub mod engine;
pub mod states;

pub use engine::{EngineContext, InstanceEngine};
pub use states::{
    DecisionCommand, EngineOutcome, ParallelDecisionPolicy, RequestUpdate, WorkflowError,
};

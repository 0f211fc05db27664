//! Saga orchestration: declarative workflow definitions, per-process
//! instances, and the engine interpreting them.

pub mod engine;
pub mod instance;
pub mod workflow;

pub use engine::SagaEngine;
pub use instance::{CompletedStep, SagaInstance};
pub use workflow::{
    CommandSpec, Transition, WorkflowBuilder, WorkflowDefinition, COMPENSATING_STATE,
    COMPLETED_STATE, FAILED_STATE,
};

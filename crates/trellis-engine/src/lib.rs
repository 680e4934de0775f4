//! Trellis pipeline runner.
//!
//! Takes the typed graph produced by `trellis-dot`, validates it, and walks
//! it: one handler invocation per node, deterministic edge selection, retry
//! with backoff, goal-gate enforcement, a rolling checkpoint after every
//! step, and a typed event stream for observers.

pub mod condition;
pub mod edge_selection;
pub mod engine;
pub mod events;
pub mod expand;
pub mod graph;
pub mod handler;
pub mod handlers;
pub mod interviewer;
pub mod retry;
pub mod stylesheet;
pub mod validation;

pub use condition::{evaluate_condition, parse_condition, Clause, ConditionExpr, Operator};
pub use edge_selection::select_edge;
pub use engine::{Engine, EngineConfig, PipelineResult};
pub use events::{
    CollectingObserver, Event, EventEmitter, EventKind, EventObserver, FnObserver, SubscriptionId,
};
pub use expand::expand_prompt;
pub use graph::{Edge, Graph, Node};
pub use handler::{
    default_registry, default_registry_with_interviewer, CancelFlag, ConditionalHandler,
    ExitHandler, HandlerRegistry, NodeHandler, RunHooks, StartHandler,
};
pub use handlers::{
    CodergenBackend, CodergenHandler, FanInHandler, ManagerLoopHandler, ParallelHandler,
    SimulatedBackend, ToolHandler, WaitHumanHandler,
};
pub use interviewer::{
    Answer, AutoApproveInterviewer, Choice, ConsoleInterviewer, Interviewer, Question,
    ScriptedInterviewer,
};
pub use retry::RetryPolicy;
pub use stylesheet::{
    apply_model_stylesheet, apply_stylesheet, parse_stylesheet, Declaration, Rule, Selector,
    Stylesheet,
};
pub use validation::{validate, validate_or_raise, Diagnostic, LintRule, Severity, Validator};

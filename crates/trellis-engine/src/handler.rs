//! Node handler contract, dispatch registry, and the trivial built-ins.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use trellis_core::{Context, Outcome, Result};

use crate::events::{EventEmitter, EventKind};
use crate::graph::{Graph, Node};

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancellation flag, observed at handler boundaries, backoff
/// sleeps, and poll ticks. Never unwinds the engine loop.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// RunHooks — what the engine lends a handler for one invocation
// ---------------------------------------------------------------------------

/// Engine facilities available to handlers.
pub struct RunHooks {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub cancel: CancelFlag,
    pub events: EventEmitter,
    /// Needed by the parallel handler to dispatch branch nodes.
    pub registry: Arc<HandlerRegistry>,
}

impl RunHooks {
    /// Per-node artifact directory (`<run_dir>/<node_id>/`), created lazily.
    pub async fn stage_dir(&self, node_id: &str) -> Result<PathBuf> {
        let dir = self.run_dir.join(node_id);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    pub fn emit(&self, kind: EventKind) {
        self.events.emit(&self.run_id, kind);
    }
}

// ---------------------------------------------------------------------------
// NodeHandler trait
// ---------------------------------------------------------------------------

/// The capability contract every stage executor implements.
///
/// Handlers treat the node as read-only input, put structured state in
/// `context_updates` rather than writing to the context directly, and report
/// failures as FAIL outcomes instead of errors wherever the failure is a
/// domain result (a nonzero exit code, a declined review). Returned `Err`s
/// are converted to FAIL outcomes by the engine.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// Dispatch tag, e.g. `"codergen"` or `"wait.human"`.
    fn handler_type(&self) -> &str;

    async fn execute(
        &self,
        node: &Node,
        context: &Context,
        graph: &Graph,
        hooks: &RunHooks,
    ) -> Result<Outcome>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Default shape → handler-type mapping.
pub fn shape_handler_type(shape: &str) -> Option<&'static str> {
    Some(match shape {
        "Mdiamond" => "start",
        "Msquare" => "exit",
        "box" => "codergen",
        "diamond" => "conditional",
        "parallelogram" => "tool",
        "hexagon" => "wait.human",
        "component" => "parallel",
        "tripleoctagon" => "fan_in",
        "house" => "manager_loop",
        _ => return None,
    })
}

/// Maps handler-type tags to implementations. Dispatch is by tag: an
/// explicit `type` attribute wins, then the node shape, then `codergen`.
///
/// Registries are plain values so tests can assemble their own; use
/// [`default_registry`] for the stock set.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn NodeHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, handler: impl NodeHandler + 'static) {
        self.register_arc(Arc::new(handler));
    }

    pub fn register_arc(&mut self, handler: Arc<dyn NodeHandler>) {
        self.handlers
            .insert(handler.handler_type().to_string(), handler);
    }

    /// Resolve the handler-type tag for a node.
    pub fn resolve_type(&self, node: &Node) -> String {
        if let Some(t) = &node.handler_type {
            return t.clone();
        }
        shape_handler_type(&node.shape)
            .unwrap_or("codergen")
            .to_string()
    }

    pub fn get(&self, handler_type: &str) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(handler_type).cloned()
    }

    pub fn has(&self, handler_type: &str) -> bool {
        self.handlers.contains_key(handler_type)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The stock registry: every built-in except `wait.human`, which needs an
/// interviewer — see [`default_registry_with_interviewer`].
pub fn default_registry() -> HandlerRegistry {
    let mut reg = HandlerRegistry::new();
    reg.register(StartHandler);
    reg.register(ExitHandler);
    reg.register(ConditionalHandler);
    reg.register(crate::handlers::CodergenHandler::simulated());
    reg.register(crate::handlers::ToolHandler);
    reg.register(crate::handlers::ParallelHandler);
    reg.register(crate::handlers::FanInHandler);
    reg.register(crate::handlers::ManagerLoopHandler);
    reg
}

pub fn default_registry_with_interviewer(
    interviewer: Arc<dyn crate::interviewer::Interviewer>,
) -> HandlerRegistry {
    let mut reg = default_registry();
    reg.register(crate::handlers::WaitHumanHandler::new(interviewer));
    reg
}

// ---------------------------------------------------------------------------
// Trivial built-ins
// ---------------------------------------------------------------------------

pub struct StartHandler;

#[async_trait]
impl NodeHandler for StartHandler {
    fn handler_type(&self) -> &str {
        "start"
    }

    async fn execute(
        &self,
        _node: &Node,
        _context: &Context,
        _graph: &Graph,
        _hooks: &RunHooks,
    ) -> Result<Outcome> {
        Ok(Outcome::success("pipeline started"))
    }
}

/// Pass-through; the engine runs the goal-gate check and terminates when the
/// current node has this shape.
pub struct ExitHandler;

#[async_trait]
impl NodeHandler for ExitHandler {
    fn handler_type(&self) -> &str {
        "exit"
    }

    async fn execute(
        &self,
        _node: &Node,
        _context: &Context,
        _graph: &Graph,
        _hooks: &RunHooks,
    ) -> Result<Outcome> {
        Ok(Outcome::success("pipeline completed"))
    }
}

/// Pure router; the actual branching happens in edge selection.
pub struct ConditionalHandler;

#[async_trait]
impl NodeHandler for ConditionalHandler {
    fn handler_type(&self) -> &str {
        "conditional"
    }

    async fn execute(
        &self,
        _node: &Node,
        _context: &Context,
        _graph: &Graph,
        _hooks: &RunHooks,
    ) -> Result<Outcome> {
        Ok(Outcome::success("conditional pass-through"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

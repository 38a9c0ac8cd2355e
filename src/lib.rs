pub mod algorithms;
#[cfg(feature = "api")]
pub mod api;
pub mod backend;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod error;
pub mod factories;
pub mod formula;
pub mod invariants;
pub mod memory;
pub mod models;
pub mod operations;
pub mod session;
pub mod store;
pub mod sync;

pub mod prelude {
    pub use crate::algorithms::{Direction, ObjectRef, connected_objects};
    #[cfg(feature = "api")]
    pub use crate::api::{AppError, GraphApp};
    pub use crate::backend::{GraphBackend, UpsertOp};
    #[cfg(feature = "sqlx")]
    pub use crate::db::{PgBackend, create_graph_tables, subscribe_changes};
    pub use crate::error::{ErrorKind, LibError, Result};
    pub use crate::factories::{
        form_custom_node, form_function_node, form_input_edge, form_metric_node,
        form_mission_node,
    };
    pub use crate::formula::{
        CompiledFormula, FormulaToken, chain_expression, compile_formula, input_expressions,
        output_expressions, validate_formula,
    };
    pub use crate::invariants::{ensure_graph_invariants, graph_invariant_violations};
    pub use crate::memory::MemoryBackend;
    pub use crate::models::{
        ChangeEvent, ChangeKind, ChangeTable, Edge, EdgeId, EdgeKind, FunctionSymbol, Graph,
        GraphPatch, Handle, Node, NodeData, NodeId, NodeKind, OrgId, Position, RuleEvaluation,
        RuleStatus, TypeId, TypeRegistry, UserId,
    };
    pub use crate::operations::EditCommand;
    pub use crate::session::{EditState, GraphSession};
    pub use crate::store::GraphStore;
    pub use crate::sync::{GraphDiff, RemoteChange, diff_graphs};
}

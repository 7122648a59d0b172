pub mod checkpoint;
pub mod cursor;
pub mod executor;
pub mod plan;
pub mod planner;
pub mod predicate;

pub use checkpoint::{DocStream, FlowControlLock, PlanCheckpoint};
pub use executor::{
    execute_until_completion_and_return_last, execute_until_completion_transactionally,
    next_document,
};
pub use plan::{InsertOp, Order, Plan, Projection, UpdateOp};
pub use planner::construct_filter_plan;
pub use predicate::{PathExpr, Predicate, ValuePredicate};

//! Task classification: which queue an asynchronous task goes to and how
//! long it may run there.
//!
//! Nothing here executes tasks. A producer classifies a task by name, attaches
//! the route's deadlines and hands the unit to the external broker.

mod route;
mod table;

pub use route::{ExecutionDeadlines, RouteEntry, TaskPattern};
pub use table::{Dispatch, RouteRule, RoutingConfig, RoutingTable};

#![allow(clippy::module_inception)]
pub mod dispatch_plan;
pub mod planner;

pub use dispatch_plan::*;
pub use planner::DispatchPlanner;

//! Bracket orders: the data model shared by the pipeline, store and
//! reconciler, plus the closure handler.

mod closure;
mod model;

pub use closure::{ClosureHandler, ClosureOutcome};
pub use model::*;

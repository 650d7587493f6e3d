//! Strategy evaluation: the scheduler that drives runs, the decision
//! providers it consults and the pipeline that turns decisions into
//! bracket orders.

mod decision;
mod model;
mod pipeline;
mod scheduler;

pub use decision::{Action, Decision, DecisionProvider, MomentumProvider, ProviderRegistry};
pub use model::{RiskSettings, Strategy};
pub use pipeline::{size_entry, Submission, SubmissionPipeline};
pub use scheduler::{RunOutcome, RunReport, StrategyScheduler, SymbolFailure};

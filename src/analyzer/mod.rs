// Analysis lifecycle: the transition function and per-symbol grouping.

pub mod evaluator;
pub mod lifecycle;

pub use evaluator::{AnalysisEvaluator, Evaluator, Transition};
pub use lifecycle::group_by_symbol;

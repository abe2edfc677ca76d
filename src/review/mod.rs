//! Judging: parallel specialist review of a candidate approach.
//!
//! ## Components
//!
//! - [`specialists`]: The five judges, their focus areas and prompts
//! - [`dispatcher`]: Concurrent judge invocations and verdict parsing
//! - [`arbiter`]: Deterministic synthesis of the verdicts (the meta-judge)

pub mod arbiter;
pub mod dispatcher;
pub mod specialists;

pub use arbiter::synthesize;
pub use dispatcher::{parse_judge_output, run_judges, run_judging};
pub use specialists::{display_name, focus_areas, judge_prompt, judge_system};

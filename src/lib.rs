// # satwrap: a configurable SAT solver wrapper
//
// Turns a flat, thread-indexed parameter token list (as produced by
// algorithm configurators such as ParamILS or SMAC) into a concrete solver
// command line, renumbers the CNF instance, runs the solver under a cutoff
// and classifies what came back.
//
// The pipeline is `params` -> `instance` -> `executor::run` -> `result`, glued
// together by `executor::solve`.

/// Thread-indexed parameter compilation, portfolio merging and flattening.
pub mod params;

/// DIMACS CNF renumbering and the variable map used to decode assignments.
pub mod instance;

/// Single-invocation pipeline and the timed process runner.
pub mod executor;

/// Solver output classification and the result line.
pub mod result;

/// Wrapper settings loaded from JSON and the environment.
pub mod config;

pub use config::WrapperConfig;
pub use executor::{SolveRequest, solve};
pub use result::{ResultRecord, Status};

// Production-quality lints
#![warn(
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
// Deny truly dangerous patterns
#![deny(clippy::mem_forget)]
// Allow common patterns in library code
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! # vigil — a declarative HTTP integration-testing engine
//!
//! A test author writes a **Test** — a request specification plus an
//! ordered list of assertions (**Checks**) and named value-extractors
//! (**Extractors**) — in a liberal JSON (JSON5) text format. `vigil`
//! issues the request, evaluates the Checks against the received
//! response, extracts values for reuse, and reports pass/fail/error
//! with diagnostics. Tests compose into **Suites** that share a cookie
//! jar and pass extracted values forward as variables.
//!
//! ## Pipeline
//!
//! ```text
//! disk -> raw text (JSON5) -> mixin merge (BasedOn) -> unroll (Repeat)
//!      -> variable substitution -> Prepare every Check/Extractor
//!      -> per-attempt dispatch (poll/retry) -> Checks -> Extractors
//!      -> TestResult
//! ```
//!
//! [`loader`] performs the first three stages, [`vars`] the fourth,
//! [`checks`]/[`extract`] the `Prepare` stage, and [`executor`] drives
//! the rest. [`suite`] sequences multiple Tests sharing state.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use vigil::loader;
//! use vigil::executor::Executor;
//! use vigil::config::VigilConfig;
//!
//! # async fn run() -> vigil::error::Result<()> {
//! let tests = loader::load_and_prepare_test("tests/smoke.json5".as_ref())?;
//! let executor = Executor::new(VigilConfig::default())?;
//! for test in &tests {
//!     let result = executor.execute(test, &Default::default()).await;
//!     println!("{}: {:?}", result.name, result.status);
//! }
//! # Ok(())
//! # }
//! ```

pub mod checks;
pub mod cli;
pub mod condition;
pub mod config;
pub mod error;
pub mod executor;
pub mod extract;
pub mod latency;
pub mod loader;
pub mod pseudo;
pub mod registry;
pub mod request;
pub mod response;
pub mod suite;
pub mod vars;

// CEL (Common Expression Language) support for the `JSONExpr` Check.
pub mod cel;

// Re-exports of the crate's most commonly used types.
pub use checks::{Check, CheckContext, Status};
pub use condition::Condition;
pub use error::{Error, Result};
pub use executor::{CheckResult, Executor, TestResult};
pub use extract::{ExtractContext, Extractor};
pub use loader::{Poll, Suite, SuiteEntry, Test};
pub use suite::{run_suite, run_suite_with_options, SuiteResult};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

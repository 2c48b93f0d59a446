//! Static deadlock detection for stack-machine bytecode.
//!
//! Given a program image and an entry method, the analysis reconstructs
//! per-method control flow, builds a class-hierarchy call graph with
//! delegate resolution, abstractly interprets each method to a lock-order
//! summary, composes summaries over the call graph to a whole-program
//! lock acquisition graph, and reports 2-cycles in that graph that are
//! not protected by a common guard lock.

pub mod analysis;
pub mod cancel;
pub mod detector;
pub mod error;
pub mod export;
pub mod options;
pub mod program;
pub mod session;

pub use cancel::CancellationToken;
pub use error::AnalysisError;
pub use options::{AnalysisOptions, Options};
pub use session::{AnalysisOutcome, AnalysisSession};

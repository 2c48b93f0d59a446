//! Error taxonomy of the analysis.
//!
//! Unsupported input is recoverable: the enclosing method is treated as
//! opaque and precision degrades silently. Invariant violations (mismatched
//! lock releases, self-loop edges) are defects in the analysis rules and
//! surface as assertions, not as values of this type. Cancellation
//! propagates as [`AnalysisError::Cancelled`] out of whichever fixpoint
//! loop is running.

use std::error::Error;
use std::fmt;

use crate::program::{MethodId, ProgramPoint};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AnalysisError {
    /// An instruction shape the analyzer cannot model.
    UnsupportedInstruction { point: ProgramPoint },
    /// A branch to an offset outside the method body.
    MalformedMethod { method: MethodId, detail: String },
    /// A cooperative abort was requested.
    Cancelled,
}

impl fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisError::UnsupportedInstruction { point } => {
                write!(f, "unsupported instruction at {}", point)
            }
            AnalysisError::MalformedMethod { method, detail } => {
                write!(f, "malformed method #{}: {}", method.0, detail)
            }
            AnalysisError::Cancelled => write!(f, "analysis cancelled"),
        }
    }
}

impl Error for AnalysisError {}

//! Serializable bug reports.
//!
//! A report carries the bug kind, a confidence wording, a kind-specific
//! diagnosis and a human-readable explanation. Diagnoses are rendered
//! from the final lock graph, so all labels are plain strings.

use serde::Serialize;

use crate::detector::lock::report::DeadlockDiagnosis;

#[derive(Debug, Serialize)]
pub struct ReportContent<D> {
    pub bug_kind: String,
    pub possibility: String,
    pub diagnosis: D,
    pub explanation: String,
}

impl<D: std::fmt::Debug> ReportContent<D> {
    pub fn new(bug_kind: String, possibility: String, diagnosis: D, explanation: String) -> Self {
        Self {
            bug_kind,
            possibility,
            diagnosis,
            explanation,
        }
    }
}

#[derive(Debug, Serialize)]
pub enum Report {
    Deadlock(ReportContent<DeadlockDiagnosis>),
}

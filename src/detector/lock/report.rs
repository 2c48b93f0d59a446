//! Deadlock diagnosis rendering.

use serde::Serialize;

/// One reported lock-order cycle: the two conflicting acquisitions and
/// the orderings that must already hold to reach them (the leading
/// subgraph), all as display labels.
#[derive(Debug, Serialize)]
pub struct DeadlockDiagnosis {
    pub first_lock: String,
    pub first_acquisition: String,
    pub second_lock: String,
    pub second_acquisition: String,
    /// Edges of the leading subgraph, `(held, acquired)` label pairs.
    pub leading_edges: Vec<(String, String)>,
}

impl DeadlockDiagnosis {
    pub fn new(
        first_lock: String,
        first_acquisition: String,
        second_lock: String,
        second_acquisition: String,
        leading_edges: Vec<(String, String)>,
    ) -> Self {
        Self {
            first_lock,
            first_acquisition,
            second_lock,
            second_acquisition,
            leading_edges,
        }
    }
}

//! Analysis driver.
//!
//! An [`AnalysisSession`] ties the pipeline together: call graph, then
//! the interprocedural lock analysis, then deadlock extraction, and
//! finally the two export graphs and the serialized reports.

use std::time::Instant;

use log::info;

use crate::analysis::callgraph::{CallGraph, ChaCallGraphBuilder, NaiveCallGraphBuilder};
use crate::cancel::CancellationToken;
use crate::detector::lock::{DeadlockDetector, InterproceduralLockAnalysis};
use crate::detector::report::Report;
use crate::error::AnalysisError;
use crate::export::ExportGraph;
use crate::options::{AnalysisOptions, Options};
use crate::program::{MethodId, Program};

pub struct AnalysisSession<'p> {
    program: &'p Program,
    entry: MethodId,
    options: AnalysisOptions,
    token: CancellationToken,
}

pub struct AnalysisOutcome {
    pub reports: Vec<Report>,
    pub call_graph: ExportGraph,
    pub lock_graph: ExportGraph,
    /// Methods treated as concurrent entry points.
    pub root_methods: Vec<MethodId>,
}

impl AnalysisOutcome {
    pub fn reports_json(&self) -> String {
        serde_json::to_string_pretty(&self.reports).expect("reports serialize")
    }
}

impl<'p> AnalysisSession<'p> {
    /// Resolve the configured entry method (`Namespace.Type::Method`)
    /// against the program.
    pub fn new(
        program: &'p Program,
        options: &Options,
        token: CancellationToken,
    ) -> Result<Self, String> {
        let (type_name, method_name) = options
            .entry
            .split_once("::")
            .ok_or_else(|| format!("entry `{}` is not Namespace.Type::Method", options.entry))?;
        let entry = program
            .find_method(type_name, method_name)
            .ok_or_else(|| format!("entry method `{}` not found", options.entry))?;
        Ok(Self {
            program,
            entry,
            options: options.analysis,
            token,
        })
    }

    pub fn with_entry(
        program: &'p Program,
        entry: MethodId,
        options: AnalysisOptions,
        token: CancellationToken,
    ) -> Self {
        Self {
            program,
            entry,
            options,
            token,
        }
    }

    pub fn run(&self) -> Result<AnalysisOutcome, AnalysisError> {
        let started = Instant::now();
        let call_graph = self.build_call_graph()?;
        let summary =
            InterproceduralLockAnalysis::new(self.program, self.options, self.token.clone())
                .run(&call_graph)?;
        let reports = DeadlockDetector::new(self.program).detect(&summary.state);
        let outcome = AnalysisOutcome {
            call_graph: ExportGraph::from_call_graph(self.program, &call_graph),
            lock_graph: ExportGraph::from_lock_state(self.program, &summary.state),
            root_methods: summary.root_methods,
            reports,
        };
        info!(
            "analysis of {} finished in {:?}: {} report(s)",
            self.program.describe_method(self.entry),
            started.elapsed(),
            outcome.reports.len()
        );
        Ok(outcome)
    }

    fn build_call_graph(&self) -> Result<CallGraph, AnalysisError> {
        if self.options.contains(AnalysisOptions::NAIVE_CALL_GRAPH) {
            NaiveCallGraphBuilder::new(self.program, self.token.clone()).build(self.entry)
        } else {
            ChaCallGraphBuilder::new(self.program, self.token.clone()).build(self.entry)
        }
    }
}

//! Analysis configuration.

use bitflags::bitflags;
use clap::{Arg, Command};

bitflags! {
    /// Tunable precision policies. All default to off.
    #[derive(Default)]
    pub struct AnalysisOptions: u32 {
        /// Every field load resolves to a per-field unaliased identity,
        /// mutable fields included.
        const NO_ALIASING = 1 << 0;
        /// Objects that cannot be proven identical across a call-site
        /// merge become permanently unaliased instead of guessed by type.
        const NO_ALIASING_AFTER_MERGE = 1 << 1;
        /// Treat framework/runtime methods as opaque without analyzing
        /// their bodies.
        const IGNORE_SYSTEM_NAMESPACE = 1 << 2;
        /// Resolve calls to their statically declared targets only.
        const NAIVE_CALL_GRAPH = 1 << 3;
    }
}

/// Parsed analysis options: the mandatory entry method plus the policy
/// flags.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Options {
    /// Entry method as `Namespace.Type::Method`.
    pub entry: String,
    pub analysis: AnalysisOptions,
}

impl Options {
    pub fn parse_from_str(s: &str) -> Result<Self, String> {
        let args = shellwords::split(s).map_err(|e| e.to_string())?;
        Self::parse_from_args(&args)
    }

    pub fn parse_from_args(args: &[String]) -> Result<Self, String> {
        let matches = Command::new("lovelock")
            .no_binary_name(true)
            .arg(Arg::new("entry").required(true).help("entry method, Namespace.Type::Method"))
            .arg(Arg::new("no-aliasing").long("no-aliasing").takes_value(false))
            .arg(
                Arg::new("no-aliasing-after-merge")
                    .long("no-aliasing-after-merge")
                    .takes_value(false),
            )
            .arg(
                Arg::new("ignore-system-namespace")
                    .long("ignore-system-namespace")
                    .takes_value(false),
            )
            .arg(Arg::new("naive-call-graph").long("naive-call-graph").takes_value(false))
            .try_get_matches_from(args)
            .map_err(|e| e.to_string())?;
        let mut analysis = AnalysisOptions::default();
        if matches.is_present("no-aliasing") {
            analysis |= AnalysisOptions::NO_ALIASING;
        }
        if matches.is_present("no-aliasing-after-merge") {
            analysis |= AnalysisOptions::NO_ALIASING_AFTER_MERGE;
        }
        if matches.is_present("ignore-system-namespace") {
            analysis |= AnalysisOptions::IGNORE_SYSTEM_NAMESPACE;
        }
        if matches.is_present("naive-call-graph") {
            analysis |= AnalysisOptions::NAIVE_CALL_GRAPH;
        }
        Ok(Self {
            entry: matches.value_of("entry").unwrap().to_owned(),
            analysis,
        })
    }
}

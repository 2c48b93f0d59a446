pub mod callgraph;
pub mod cfg;
pub mod dataflow;
pub mod heap;
pub mod hierarchy;

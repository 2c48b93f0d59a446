pub mod lock;
pub mod report;

//! Analysis modules.
//!
//! Statistics over candidate records, shared by the report assembler and
//! the CLI summary.

pub mod aggregator;

pub use aggregator::*;

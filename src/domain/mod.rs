//! Domain layer types and invariants.

pub mod certificates;
pub mod error;
pub mod receipts;

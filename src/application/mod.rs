pub mod certificates;
pub mod error;
pub mod receipts;
pub mod render;
pub mod repos;

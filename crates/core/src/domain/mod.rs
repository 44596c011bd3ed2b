pub mod context;
pub mod execution;
pub mod lead;
pub mod message;

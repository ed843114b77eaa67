pub mod role;
pub mod signatory;
pub mod workflow;

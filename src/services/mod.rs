pub mod decoder;
pub mod engine;
pub mod orchestrator;
pub mod staging;
pub mod worker;

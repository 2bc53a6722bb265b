pub mod engine;
pub mod staging;

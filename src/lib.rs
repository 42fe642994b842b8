pub mod assistant;
pub mod blob;
pub mod codegen;
pub mod config;
pub mod record;
pub mod shared;
pub mod workflow;

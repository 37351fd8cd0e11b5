pub mod consumer;
pub mod supplier;

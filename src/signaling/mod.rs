pub mod client;
pub mod protocol;
pub mod service;
pub mod share;

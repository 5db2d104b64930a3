// Menu Export Worker
//
// A horizontally-scalable background worker that turns queued menu-export
// requests into durable PDF/PNG artifacts in blob storage. Any number of
// replicas compete for rows in the shared relational queue; all
// coordination happens through it.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;
pub mod server;

pub use config::*;

// agent/src/lib.rs

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod repository;
pub mod server;
pub mod service;
pub mod state;
pub mod sys;

#[cfg(test)]
mod testing;

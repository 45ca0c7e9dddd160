pub mod config;
pub mod errors;
pub mod health;
pub mod models;
pub mod orchestrator;
pub mod runtime;
pub mod store;
pub mod web;

//! HTTP request handlers organized by area

pub mod deployments;
pub mod events;
pub mod health;
pub mod system;

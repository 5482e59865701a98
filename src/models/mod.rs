// src/models/mod.rs
//! Data structures shared across components.

pub mod credential;
pub mod did;
pub mod message;

// src/services/mod.rs
//! Verifier services: resolution, credentials and their bindings, challenges,
//! messaging and the REST API.

pub mod api_server;
pub mod binding;
pub mod credential_issuer;
pub mod did_resolver;
pub mod identity;
pub mod messaging;
pub mod verifier;

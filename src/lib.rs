pub mod admin;
pub mod backoff;
pub mod compiler;
pub mod config;
pub mod domain;
pub mod engine;
pub mod id;
pub mod links;
pub mod protocol;
pub mod quota;
pub mod reconcile;
pub mod state;
pub mod stats;
pub mod supervisor;
pub mod version;

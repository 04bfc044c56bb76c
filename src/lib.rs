#![doc = "The `contacts_auth` library crate."]
#![doc = ""]
#![doc = "Authentication core of the contacts API: credential storage, token issuance and"]
#![doc = "rotation, account lifecycle operations, and the actix-web routes that expose them."]
#![doc = "The binary (`main.rs`) wires these together from configuration and serves them."]

pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod models;
pub mod notify;
pub mod routes;
pub mod security;
pub mod store;

pub use crate::error::AppError;

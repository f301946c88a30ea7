//! Membank core library — an embedded graph-backed memory store for
//! software-project metadata.
//!
//! The main entry points are [`client::get_or_create_client`], which wires
//! up one [`client::Client`] per project root, and
//! [`cache::RepositoryCache`], which hands out typed repositories over it.

pub mod cache;
pub mod client;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod executor;
pub mod repository;
pub mod schema;
pub mod snapshot;
pub mod transaction;
pub mod value;

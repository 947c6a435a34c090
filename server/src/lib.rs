//! bazaar realtime gateway library.
//! This crate exposes internal modules for integration testing.
//! The binary entry point is in main.rs.

pub mod auth;
pub mod config;
pub mod db;
pub mod modules;
pub mod notify;
pub mod presence;
pub mod routes;
pub mod state;
pub mod store;
pub mod ws;

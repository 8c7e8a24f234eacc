//! In-memory case desk API.
//!
//! Serves the authentication and chat endpoints the client consumes, with
//! seeded demo accounts and hooks that let tests expire or revoke
//! credentials on demand.

pub mod config;
pub mod routes;
pub mod state;

//! Shared wire definitions for the `casedesk` HTTP contract.

pub mod auth;
pub mod ids;
pub mod message;
pub mod user;

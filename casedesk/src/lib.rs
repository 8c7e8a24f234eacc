//! `casedesk`: authenticated session transport and polling chat sync for
//! the case desk API.

pub mod chat;
pub mod config;
pub mod session;
pub mod transport;

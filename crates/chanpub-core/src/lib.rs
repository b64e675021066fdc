//! Core domain and application logic for multi-channel Telegram publishing.
//!
//! This crate is framework-agnostic. The messaging gateway, translation
//! service, statistics sources and membership update feeds live behind ports
//! (traits) implemented in adapter crates.

pub mod config;
pub mod discovery;
pub mod domain;
pub mod errors;
pub mod formatting;
pub mod ledger;
pub mod logging;
pub mod ports;
pub mod publication;
pub mod retry;
pub mod stats;
pub mod store;
pub mod throttle;
pub mod translation;
pub mod worker;

pub use errors::{Error, Result};

//! A PKCS#11 engine: keys and certificates on a token, found by URI.

pub mod cli;
pub mod commons;
pub mod config;
pub mod constants;
pub mod engine;
pub mod token;

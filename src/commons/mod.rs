//! Common types used by the various engine components.
pub mod error;

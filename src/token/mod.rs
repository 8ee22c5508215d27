//! Resolving token URIs to sessions, keys and certificates.
pub mod clientcert;
pub mod context;
pub mod cryptoki;
pub mod key;
pub mod module;
pub mod pin;
pub mod search;
pub mod session;
pub mod uri;

#[cfg(test)]
pub mod mock;

pub use self::context::SessionContext;
pub use self::key::TokenKey;
pub use self::uri::{ParseMode, Selector};

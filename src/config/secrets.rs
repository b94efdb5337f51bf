//! Secret handling utilities.
//!
//! Re-exports the secrecy types the model client and database config share.

pub use secrecy::{ExposeSecret, SecretString};

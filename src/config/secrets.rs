//! Secret handling utilities.
//!
//! Re-exports secrecy types so callers holding recognizer credentials don't
//! need a direct dependency on secrecy.

pub use secrecy::{ExposeSecret, SecretString};

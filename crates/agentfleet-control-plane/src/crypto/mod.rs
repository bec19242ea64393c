//! Callback token issuance and verification.

mod token;

pub use token::{hash_token, verify_token, CallbackToken};

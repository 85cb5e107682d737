//! Authentication Module
//!
//! Pluggable authenticators and the credential stores behind them.

pub mod authenticator;
pub mod store;
pub mod types;

pub use authenticator::{Authenticator, Authenticators, NoAuthAuthenticator, UserPassAuthenticator};
pub use store::{CredentialStore, StaticCredentials};
pub use types::AuthContext;

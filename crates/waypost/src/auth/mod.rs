//! Authentication.
//!
//! Two populations, two credential planes: user bearer tokens (builtin
//! password login or an external identity provider) and runtime tokens
//! (time-limited HMAC, static table, or hashed database rows).

mod builtin;
mod external;
mod identity;
mod runtime;

pub use builtin::BuiltinAuth;
pub use external::ExternalAuth;
pub use identity::{Identity, TokenValidator};
pub use runtime::{
    generate_runtime_id, generate_runtime_token, token_hash, RuntimeAuthenticator,
    ValidatedRuntime,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token has expired")]
    TokenExpired,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("authentication backend error: {0}")]
    Internal(String),
}

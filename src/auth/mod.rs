//! Credential handling: opaque token generation, refresh-token session
//! rotation with reuse detection, and short-lived access tokens.

pub mod generator;
pub mod session;

pub use generator::{generate_token, hash_token};
pub use session::{
    authenticate, issue_access_token, issue_session, revoke_session_by_token, rotate_session,
    validate_access_token, AuthError, IssuedSession,
};

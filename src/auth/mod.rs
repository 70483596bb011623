//! Bearer token authentication.
//!
//! - [`verifier`]: RS256 verification against the issuer's JWKS
//! - [`jwks`]: key fetching and the signing key cache
//! - [`claims`]: multi-name claim lookup and scope parsing
//! - [`middleware`]: the axum guard for protected routes

pub mod claims;
pub mod jwks;
pub mod middleware;
pub mod verifier;

pub use jwks::{HttpKeyFetcher, KeyFetchError, KeyFetcher, SigningKeyCache};
pub use middleware::{AuthError, AuthGuard, authorize};
pub use verifier::{TokenVerifier, VerifiedClaims, VerifyError};

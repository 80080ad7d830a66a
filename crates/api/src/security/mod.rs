//! Request authentication for the machine-facing endpoints
//!
//! Gateway webhooks are authenticated with an HMAC signature over the raw
//! body; the settlement trigger with a shared bearer token.

mod headers;
mod signature;

pub use headers::security_headers_middleware;
pub use signature::{
    bearer_token_matches, constant_time_compare, sign_payload, SignatureError, SignatureVerifier,
    SIGNATURE_HEADER,
};

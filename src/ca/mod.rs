//! Certificate authority for terminating TLS on behalf of proxied hosts.
//!
//! The root CA is loaded from PEM material; leaf certificates are signed on
//! demand for each SNI name and cached until they approach expiry.

mod authority;
mod clock;

pub use authority::{
    CLOCK_SKEW_ALLOWANCE, CaError, CaResult, CertificateAuthority, LEAF_VALIDITY, RENEWAL_MARGIN,
    generate,
};
pub use clock::{Clock, SystemClock};

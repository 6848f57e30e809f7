//! This crate decides whether a certificate may be issued. A
//! [`Provisioner`][provisioner::Provisioner] verifies a bearer token issued
//! by an external identity source and, on success, returns the
//! [`SignOptions`][sign_options::SignOptions] which constrain the
//! certificate. The issuing side applies these options to the certificate
//! request and the certificate template before it signs anything.
//!
//! Supported identity sources:
//!
//! - `GCP`: Google Compute Engine instance identity tokens.
//! - `JWK`: Tokens signed by a configured key.
//! - `OIDC`: ID tokens of an OpenID Connect provider.
//!
//! ## References
//!
//! - <https://cloud.google.com/compute/docs/instances/verifying-instance-identity>
//! - <https://datatracker.ietf.org/doc/html/rfc7519>
//! - <https://openid.net/specs/openid-connect-core-1_0.html>
pub mod claims;
pub mod keystore;
pub mod provisioner;
pub mod sign_options;

#[cfg(test)]
pub(crate) mod test_utils;

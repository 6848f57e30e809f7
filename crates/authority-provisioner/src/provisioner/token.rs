//! Token decoding and verification shared by all provisioners.
use authority_shared::{multi_value::MultiString, time::Duration};
use jsonwebtoken::{DecodingKey, Validation, errors::ErrorKind as JwtErrorKind};
use serde::{Deserialize, de::DeserializeOwned};
use snafu::{OptionExt, ResultExt, ensure};

use super::{
    ClaimInvalidSnafu, Error, MissingKeyIdSnafu, Result, TokenMalformedSnafu,
};
use crate::keystore::VerificationKey;

/// The tolerated clock skew when validating `exp`, `nbf` and `iat`.
pub const TOKEN_LEEWAY: Duration = Duration::from_minutes_unchecked(1);

/// The registered claims of RFC 7519 which the provisioners read.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RegisteredClaims {
    pub iss: Option<String>,
    pub sub: Option<String>,

    #[serde(default)]
    pub aud: MultiString,

    pub exp: Option<u64>,
    pub nbf: Option<u64>,
    pub iat: Option<u64>,
    pub jti: Option<String>,
}

pub(super) trait TokenPayload: DeserializeOwned {
    fn registered(&self) -> &RegisteredClaims;
}

/// Reads the key identifier from the token header.
pub(super) fn key_id(token: &str) -> Result<String> {
    let header = jsonwebtoken::decode_header(token).context(TokenMalformedSnafu)?;
    header.kid.context(MissingKeyIdSnafu)
}

/// Verifies the signature of `token` with `key` and validates the standard
/// claims: `iss` must equal `issuer`, `aud` must contain `audience` and the
/// time claims must hold within [`TOKEN_LEEWAY`].
pub(super) fn verify<T: TokenPayload>(
    token: &str,
    key: &VerificationKey,
    issuer: &str,
    audience: &str,
) -> Result<T> {
    let mut validation = Validation::default();
    validation.algorithms = key.algorithms().to_vec();
    validation.leeway = TOKEN_LEEWAY.as_secs();
    validation.validate_nbf = true;
    validation.set_issuer(&[issuer]);
    validation.set_audience(&[audience]);
    validation.set_required_spec_claims(&["exp", "iss", "aud"]);

    let payload = jsonwebtoken::decode::<T>(token, key.decoding_key(), &validation)
        .map_err(verification_error)?
        .claims;

    if let Some(iat) = payload.registered().iat {
        let now = jsonwebtoken::get_current_timestamp();
        ensure!(iat <= now + TOKEN_LEEWAY.as_secs(), ClaimInvalidSnafu {
            claim: "iat",
            reason: "is in the future"
        });
    }

    Ok(payload)
}

/// Decodes the payload of `token` without verifying anything. The result
/// must not be trusted.
pub(super) fn insecure_decode<T: DeserializeOwned>(token: &str) -> Result<T> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    jsonwebtoken::decode::<T>(token, &DecodingKey::from_secret(&[]), &validation)
        .map(|data| data.claims)
        .context(TokenMalformedSnafu)
}

fn verification_error(source: jsonwebtoken::errors::Error) -> Error {
    match source.kind() {
        JwtErrorKind::ExpiredSignature
        | JwtErrorKind::ImmatureSignature
        | JwtErrorKind::InvalidIssuer
        | JwtErrorKind::InvalidAudience
        | JwtErrorKind::InvalidSubject
        | JwtErrorKind::MissingRequiredClaim(_) => Error::ValidateClaims { source },
        JwtErrorKind::InvalidToken
        | JwtErrorKind::Base64(_)
        | JwtErrorKind::Json(_)
        | JwtErrorKind::Utf8(_) => Error::TokenMalformed { source },
        _ => Error::TokenUnverifiable { source },
    }
}

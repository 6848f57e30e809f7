//! The identity sources which can authorize certificate operations.
//!
//! The set of provisioners is closed, configurations are deserialized into
//! [`Provisioner`], which is internally tagged by its `type` field:
//!
//! ```json
//! { "type": "GCP", "name": "gcp", "serviceAccounts": ["1234@developer.gserviceaccount.com"] }
//! ```
//!
//! A deserialized provisioner must be initialized with [`Provisioner::init`]
//! before it can authorize anything. Initialized provisioners are immutable
//! and can be shared between concurrent requests.
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use strum::Display;
use url::Url;
use x509_cert::Certificate;

use crate::{
    claims::{self, Claimer, Claims},
    keystore::{self, KeyError, KeyStore},
    sign_options::SignOptions,
};

mod collection;
mod gcp;
mod jwk;
mod oidc;
mod token;

pub use collection::*;
pub use gcp::*;
pub use jwk::*;
pub use oidc::*;
pub use token::{RegisteredClaims, TOKEN_LEEWAY};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{provisioner_type} provisioner name cannot be empty"))]
    EmptyName { provisioner_type: ProvisionerType },

    #[snafu(display("invalid configuration of provisioner {id}: {reason}"))]
    InvalidConfig { id: String, reason: String },

    #[snafu(display("invalid key configured for provisioner {id}"))]
    InvalidKey { source: KeyError, id: String },

    #[snafu(display("failed to parse key set URL {url:?}"))]
    ParseUrl { source: url::ParseError, url: String },

    #[snafu(display("invalid claims configured for provisioner {id}"))]
    CreateClaimer { source: claims::Error, id: String },

    #[snafu(display("provisioner {id} is not initialized"))]
    NotInitialized { id: String },

    #[snafu(display("duplicate provisioner {id}"))]
    DuplicateProvisioner { id: String },

    #[snafu(display("provisioner {id} not found"))]
    ProvisionerNotFound { id: String },

    #[snafu(display("failed to parse token"))]
    TokenMalformed { source: jsonwebtoken::errors::Error },

    #[snafu(display("failed to parse token: header has no key identifier (kid)"))]
    MissingKeyId,

    #[snafu(display("failed to resolve token verification key"))]
    ResolveKey { source: keystore::Error },

    #[snafu(display("token was signed with unknown key {kid:?}"))]
    UnknownKey { kid: String },

    #[snafu(display("failed to verify token signature"))]
    TokenUnverifiable { source: jsonwebtoken::errors::Error },

    #[snafu(display("failed to validate token claims"))]
    ValidateClaims { source: jsonwebtoken::errors::Error },

    #[snafu(display("invalid token: {claim} {reason}"))]
    ClaimInvalid { claim: &'static str, reason: String },

    #[snafu(display("renew is disabled for provisioner {id}"))]
    RenewalDisabled { id: String },

    #[snafu(display("failed to request identity token from {url}"))]
    RequestIdentityToken { source: reqwest::Error, url: Url },
}

/// Coarse classification of an [`Error`], for callers which map
/// authorization failures to responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The provisioner configuration is invalid, it can't serve requests.
    Config,

    /// No provisioner with the requested id exists.
    NotFound,

    /// The key set couldn't be fetched and no cached key exists.
    TrustSourceUnavailable,

    TokenMalformed,
    UnknownKey,
    TokenUnverifiable,
    ClaimInvalid,
    RenewalDisabled,

    /// An outbound request of a client-side helper failed.
    Transport,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyName { .. }
            | Self::InvalidConfig { .. }
            | Self::InvalidKey { .. }
            | Self::ParseUrl { .. }
            | Self::CreateClaimer { .. }
            | Self::NotInitialized { .. }
            | Self::DuplicateProvisioner { .. } => ErrorKind::Config,
            Self::ProvisionerNotFound { .. } => ErrorKind::NotFound,
            Self::TokenMalformed { .. } | Self::MissingKeyId => ErrorKind::TokenMalformed,
            Self::ResolveKey { source } => match source {
                keystore::Error::UnknownKey { .. } => ErrorKind::UnknownKey,
                keystore::Error::TrustSourceUnavailable { .. } => {
                    ErrorKind::TrustSourceUnavailable
                }
            },
            Self::UnknownKey { .. } => ErrorKind::UnknownKey,
            Self::TokenUnverifiable { .. } => ErrorKind::TokenUnverifiable,
            Self::ValidateClaims { .. } | Self::ClaimInvalid { .. } => ErrorKind::ClaimInvalid,
            Self::RenewalDisabled { .. } => ErrorKind::RenewalDisabled,
            Self::RequestIdentityToken { .. } => ErrorKind::Transport,
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(display("unknown provisioner type {value}"))]
pub struct UnknownProvisionerTypeError {
    value: u32,
}

/// The provisioner types. The discriminant is the value recorded in the
/// provisioner certificate extension.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum ProvisionerType {
    #[serde(rename = "JWK")]
    #[strum(serialize = "JWK")]
    Jwk = 1,

    #[serde(rename = "OIDC")]
    #[strum(serialize = "OIDC")]
    Oidc = 2,

    #[serde(rename = "GCP")]
    #[strum(serialize = "GCP")]
    Gcp = 3,
}

impl ProvisionerType {
    /// Returns the id of the provisioner with this type and `name`, e.g.
    /// `gcp:my-project`.
    pub fn id(&self, name: &str) -> String {
        format!("{}:{name}", self.to_string().to_lowercase())
    }
}

impl From<ProvisionerType> for u32 {
    fn from(value: ProvisionerType) -> Self {
        value as Self
    }
}

impl TryFrom<u32> for ProvisionerType {
    type Error = UnknownProvisionerTypeError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Jwk),
            2 => Ok(Self::Oidc),
            3 => Ok(Self::Gcp),
            _ => UnknownProvisionerTypeSnafu { value }.fail(),
        }
    }
}

/// Authority wide settings which are passed to every provisioner on
/// initialization.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Global claims, overridden by the claims of each provisioner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claims: Option<Claims>,

    /// The HTTP client used to fetch key sets. The caller controls timeouts
    /// and proxies through it. A default client is used if not set.
    #[serde(skip)]
    pub http_client: Option<reqwest::Client>,
}

impl Config {
    fn key_store(&self, url: Url) -> KeyStore {
        match &self.http_client {
            Some(client) => KeyStore::with_client(url, client.clone()),
            None => KeyStore::new(url),
        }
    }
}

/// A configured provisioner.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum Provisioner {
    #[serde(rename = "GCP")]
    Gcp(Gcp),

    #[serde(rename = "JWK")]
    Jwk(Jwk),

    #[serde(rename = "OIDC")]
    Oidc(Oidc),
}

impl Provisioner {
    /// The unique id of this provisioner, which is also the audience tokens
    /// must be issued for (see [`ProvisionerType::id`]).
    pub fn id(&self) -> String {
        match self {
            Self::Gcp(p) => p.id(),
            Self::Jwk(p) => p.id(),
            Self::Oidc(p) => p.id(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Gcp(p) => &p.name,
            Self::Jwk(p) => &p.name,
            Self::Oidc(p) => &p.name,
        }
    }

    pub fn provisioner_type(&self) -> ProvisionerType {
        match self {
            Self::Gcp(_) => ProvisionerType::Gcp,
            Self::Jwk(_) => ProvisionerType::Jwk,
            Self::Oidc(_) => ProvisionerType::Oidc,
        }
    }

    /// Validates the configuration, resolves the claims and prepares the
    /// key store. No network requests are done.
    pub fn init(&mut self, config: &Config) -> Result<()> {
        match self {
            Self::Gcp(p) => p.init(config),
            Self::Jwk(p) => p.init(config),
            Self::Oidc(p) => p.init(config),
        }
    }

    /// Verifies `token` and returns the sign options which constrain the
    /// certificate that may be issued for it.
    pub async fn authorize_sign(&self, token: &str) -> Result<SignOptions> {
        match self {
            Self::Gcp(p) => p.authorize_sign(token).await,
            Self::Jwk(p) => p.authorize_sign(token),
            Self::Oidc(p) => p.authorize_sign(token).await,
        }
    }

    /// Verifies `token` the same way as [`Self::authorize_sign`].
    pub async fn authorize_revoke(&self, token: &str) -> Result<()> {
        match self {
            Self::Gcp(p) => p.authorize_revoke(token).await,
            Self::Jwk(p) => p.authorize_revoke(token),
            Self::Oidc(p) => p.authorize_revoke(token).await,
        }
    }

    /// Renewal is a policy gate only, the certificate is not inspected.
    pub fn authorize_renewal(&self, certificate: &Certificate) -> Result<()> {
        match self {
            Self::Gcp(p) => p.authorize_renewal(certificate),
            Self::Jwk(p) => p.authorize_renewal(certificate),
            Self::Oidc(p) => p.authorize_renewal(certificate),
        }
    }

    /// Returns a stable identifier of `token`, e.g. for replay protection.
    /// The signature of the token is not verified.
    pub fn token_id(&self, token: &str) -> Result<String> {
        match self {
            Self::Gcp(p) => p.token_id(token),
            Self::Jwk(p) => p.token_id(token),
            Self::Oidc(p) => p.token_id(token),
        }
    }

    /// Returns the key id and the encrypted private key, if this provisioner
    /// holds one.
    pub fn encrypted_key(&self) -> Option<(&str, &str)> {
        match self {
            Self::Gcp(p) => p.encrypted_key(),
            Self::Jwk(p) => p.encrypted_key(),
            Self::Oidc(p) => p.encrypted_key(),
        }
    }
}

/// Shared initialization of the parts every provisioner has.
fn init_claimer(
    provisioner_type: ProvisionerType,
    name: &str,
    claims: Option<&Claims>,
    config: &Config,
) -> Result<Claimer> {
    snafu::ensure!(!name.is_empty(), EmptyNameSnafu { provisioner_type });

    Claimer::new(claims, config.claims.as_ref()).map_err(|source| Error::CreateClaimer {
        source,
        id: provisioner_type.id(name),
    })
}

fn check_renewal(claimer: &Claimer, id: impl FnOnce() -> String) -> Result<()> {
    snafu::ensure!(!claimer.is_disable_renewal(), RenewalDisabledSnafu { id: id() });
    Ok(())
}

use authority_shared::multi_value::MultiString;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use snafu::{OptionExt, ResultExt, ensure};
use tracing::{debug, instrument};
use url::Url;
use x509_cert::Certificate;

use super::{
    ClaimInvalidSnafu, Config, InvalidConfigSnafu, NotInitializedSnafu, ProvisionerType,
    ResolveKeySnafu, Result, check_renewal, init_claimer,
    token::{self, RegisteredClaims, TokenPayload},
};
use crate::{
    claims::{Claimer, Claims},
    keystore::KeyStore,
    sign_options::{ProvisionerExtension, SignOption, SignOptions},
};

#[derive(Debug, Deserialize)]
struct OidcPayload {
    #[serde(flatten)]
    registered: RegisteredClaims,

    #[serde(default)]
    email: String,

    email_verified: Option<bool>,
    nonce: Option<String>,
}

impl TokenPayload for OidcPayload {
    fn registered(&self) -> &RegisteredClaims {
        &self.registered
    }
}

#[derive(Clone, Debug)]
struct State {
    claimer: Claimer,
    key_store: KeyStore,
}

/// Authorizes users by the ID token of an OpenID Connect provider. The
/// certificate is issued for the verified email address of the user.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Oidc {
    pub name: String,

    /// The OAuth client id, tokens must be issued for this audience.
    #[serde(rename = "clientID")]
    pub client_id: String,

    pub issuer: String,

    /// The JWK set of the provider.
    #[serde(rename = "jwksURI")]
    pub jwks_uri: Url,

    /// The email domains which are allowed to request certificates. Any
    /// domain is allowed if empty.
    #[serde(default, skip_serializing_if = "<[String]>::is_empty")]
    pub domains: MultiString,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claims: Option<Claims>,

    #[serde(skip)]
    state: Option<State>,
}

impl Oidc {
    pub fn new(
        name: impl Into<String>,
        client_id: impl Into<String>,
        issuer: impl Into<String>,
        jwks_uri: Url,
    ) -> Self {
        Self {
            name: name.into(),
            client_id: client_id.into(),
            issuer: issuer.into(),
            jwks_uri,
            domains: MultiString::default(),
            claims: None,
            state: None,
        }
    }

    pub fn id(&self) -> String {
        ProvisionerType::Oidc.id(&self.name)
    }

    pub fn init(&mut self, config: &Config) -> Result<()> {
        let claimer =
            init_claimer(ProvisionerType::Oidc, &self.name, self.claims.as_ref(), config)?;

        for (field, value) in [("clientID", &self.client_id), ("issuer", &self.issuer)] {
            ensure!(!value.is_empty(), InvalidConfigSnafu {
                id: self.id(),
                reason: format!("{field} cannot be empty"),
            });
        }
        ensure!(self.domains.is_empty() || !self.domains.has_empties(), InvalidConfigSnafu {
            id: self.id(),
            reason: "domains cannot contain empty values",
        });

        self.state = Some(State {
            claimer,
            key_store: config.key_store(self.jwks_uri.clone()),
        });

        Ok(())
    }

    fn state(&self) -> Result<&State> {
        self.state
            .as_ref()
            .context(NotInitializedSnafu { id: self.id() })
    }

    #[instrument(skip_all, fields(provisioner.id = %self.id()))]
    pub async fn authorize_sign(&self, token: &str) -> Result<SignOptions> {
        let state = self.state()?;
        let payload = self.authorize_token(state, token).await?;

        debug!(oidc.email = %payload.email, "authorized sign request");

        Ok(SignOptions::new(vec![
            SignOption::email_only_identity(payload.email),
            SignOption::default_duration(state.claimer.default_tls_cert_duration()),
            SignOption::provisioner_extension(ProvisionerExtension::new(
                ProvisionerType::Oidc,
                &self.name,
                &self.client_id,
            )),
            SignOption::validity(
                state.claimer.min_tls_cert_duration(),
                state.claimer.max_tls_cert_duration(),
            ),
        ]))
    }

    #[instrument(skip_all, fields(provisioner.id = %self.id()))]
    pub async fn authorize_revoke(&self, token: &str) -> Result<()> {
        let state = self.state()?;
        self.authorize_token(state, token).await?;
        Ok(())
    }

    pub fn authorize_renewal(&self, _certificate: &Certificate) -> Result<()> {
        check_renewal(&self.state()?.claimer, || self.id())
    }

    /// Returns the `nonce` claim, or the hex encoded SHA-256 of the token if
    /// it has none.
    pub fn token_id(&self, token: &str) -> Result<String> {
        let payload: OidcPayload = token::insecure_decode(token)?;

        Ok(match payload.nonce.filter(|nonce| !nonce.is_empty()) {
            Some(nonce) => nonce,
            None => hex::encode(Sha256::digest(token)),
        })
    }

    pub fn encrypted_key(&self) -> Option<(&str, &str)> {
        None
    }

    async fn authorize_token(&self, state: &State, token: &str) -> Result<OidcPayload> {
        let kid = token::key_id(token)?;
        let key = state.key_store.get(&kid).await.context(ResolveKeySnafu)?;
        let payload: OidcPayload = token::verify(token, &key, &self.issuer, &self.client_id)?;

        ensure!(!payload.email.is_empty(), ClaimInvalidSnafu {
            claim: "email",
            reason: "cannot be empty"
        });
        ensure!(payload.email_verified == Some(true), ClaimInvalidSnafu {
            claim: "email_verified",
            reason: "must be true"
        });

        if !self.domains.is_empty() {
            let domain = payload
                .email
                .rsplit_once('@')
                .map(|(_, domain)| domain)
                .unwrap_or_default();
            ensure!(
                self.domains
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(domain)),
                ClaimInvalidSnafu {
                    claim: "email",
                    reason: format!("domain {domain:?} is not allowed"),
                }
            );
        }

        Ok(payload)
    }
}

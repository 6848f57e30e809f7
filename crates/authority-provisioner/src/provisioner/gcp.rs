use reqwest::header::HeaderValue;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use snafu::{OptionExt, ResultExt, ensure};
use tracing::{debug, instrument};
use url::Url;
use x509_cert::Certificate;

use super::{
    ClaimInvalidSnafu, Config, NotInitializedSnafu, ParseUrlSnafu, ProvisionerType,
    RequestIdentityTokenSnafu, ResolveKeySnafu, Result, check_renewal, init_claimer,
    token::{self, RegisteredClaims, TokenPayload},
};
use crate::{
    claims::{Claimer, Claims},
    keystore::KeyStore,
    sign_options::{ProvisionerExtension, SignOption, SignOptions},
};

/// The issuer of Google instance identity tokens.
pub const GCP_ISSUER: &str = "https://accounts.google.com";

/// The certificates which sign Google instance identity tokens, as a map of
/// key identifiers to PEM encoded certificates.
pub const GCP_CERTS_URL: &str = "https://www.googleapis.com/oauth2/v1/certs";

/// The metadata server endpoint which issues identity tokens to the VM it
/// runs on.
pub const GCP_IDENTITY_URL: &str =
    "http://metadata/computeMetadata/v1/instance/service-accounts/default/identity";

const METADATA_FLAVOR: &str = "Metadata-Flavor";

#[derive(Debug, Deserialize)]
struct GcpPayload {
    #[serde(flatten)]
    registered: RegisteredClaims,

    #[serde(default)]
    azp: String,

    #[serde(default)]
    email: String,

    #[serde(default)]
    email_verified: bool,

    #[serde(default)]
    google: GooglePayload,
}

impl TokenPayload for GcpPayload {
    fn registered(&self) -> &RegisteredClaims {
        &self.registered
    }
}

#[derive(Debug, Default, Deserialize)]
struct GooglePayload {
    #[serde(default)]
    compute_engine: ComputeEnginePayload,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ComputeEnginePayload {
    instance_id: String,
    instance_name: String,
    project_id: String,
    project_number: i64,
    zone: String,
}

#[derive(Clone, Debug)]
struct State {
    claimer: Claimer,
    key_store: KeyStore,
}

/// Authorizes Google Compute Engine instances by their instance identity
/// token.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Gcp {
    pub name: String,

    /// The service accounts (`azp`) which are allowed to request
    /// certificates. Any service account is allowed if empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_accounts: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claims: Option<Claims>,

    #[serde(skip)]
    state: Option<State>,
}

impl Gcp {
    pub fn new(name: impl Into<String>, service_accounts: Vec<String>) -> Self {
        Self {
            name: name.into(),
            service_accounts,
            claims: None,
            state: None,
        }
    }

    pub fn id(&self) -> String {
        ProvisionerType::Gcp.id(&self.name)
    }

    pub fn init(&mut self, config: &Config) -> Result<()> {
        let url = Url::parse(GCP_CERTS_URL).context(ParseUrlSnafu { url: GCP_CERTS_URL })?;
        self.init_with_key_set_url(config, url)
    }

    pub(crate) fn init_with_key_set_url(&mut self, config: &Config, url: Url) -> Result<()> {
        let claimer = init_claimer(ProvisionerType::Gcp, &self.name, self.claims.as_ref(), config)?;
        self.state = Some(State {
            claimer,
            key_store: config.key_store(url),
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
        let compute_engine = &payload.google.compute_engine;

        let dns_names = vec![
            format!(
                "{}.c.{}.internal",
                compute_engine.instance_name, compute_engine.project_id
            ),
            format!(
                "{}.{}.c.{}.internal",
                compute_engine.instance_name, compute_engine.zone, compute_engine.project_id
            ),
        ];

        debug!(
            gcp.instance_id = %compute_engine.instance_id,
            gcp.project_id = %compute_engine.project_id,
            gcp.project_number = compute_engine.project_number,
            gcp.email = %payload.email,
            gcp.email_verified = payload.email_verified,
            "authorized sign request"
        );

        Ok(SignOptions::new(vec![
            SignOption::common_name(&compute_engine.instance_name),
            SignOption::dns_names(dns_names),
            SignOption::default_duration(state.claimer.default_tls_cert_duration()),
            SignOption::provisioner_extension(ProvisionerExtension::new(
                ProvisionerType::Gcp,
                &self.name,
                &payload.azp,
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

    /// Returns the hex encoded SHA-256 of `<instance_id>.<iat>.<exp>`.
    pub fn token_id(&self, token: &str) -> Result<String> {
        let payload: GcpPayload = token::insecure_decode(token)?;
        let unique = format!(
            "{}.{}.{}",
            payload.google.compute_engine.instance_id,
            payload.registered.iat.unwrap_or_default(),
            payload.registered.exp.unwrap_or_default()
        );

        Ok(hex::encode(Sha256::digest(unique)))
    }

    /// GCP provisioners never hold a key.
    pub fn encrypted_key(&self) -> Option<(&str, &str)> {
        None
    }

    /// The metadata server URL which returns an identity token for this
    /// provisioner.
    pub fn identity_url(&self) -> Result<Url> {
        let mut url =
            Url::parse(GCP_IDENTITY_URL).context(ParseUrlSnafu { url: GCP_IDENTITY_URL })?;
        url.query_pairs_mut()
            .append_pair("audience", &self.id())
            .append_pair("format", "full")
            .append_pair("licenses", "FALSE");

        Ok(url)
    }

    /// Requests an identity token for this provisioner from the metadata
    /// server. This only works on a GCP VM.
    pub async fn identity_token(&self, client: &reqwest::Client) -> Result<String> {
        fetch_identity_token(client, self.identity_url()?).await
    }

    async fn authorize_token(&self, state: &State, token: &str) -> Result<GcpPayload> {
        let kid = token::key_id(token)?;
        let key = state.key_store.get(&kid).await.context(ResolveKeySnafu)?;
        let payload: GcpPayload = token::verify(token, &key, GCP_ISSUER, &self.id())?;

        if !self.service_accounts.is_empty() {
            ensure!(
                self.service_accounts.contains(&payload.azp),
                ClaimInvalidSnafu {
                    claim: "azp",
                    reason: format!("{:?} is not an allowed service account", payload.azp),
                }
            );
        }

        let compute_engine = &payload.google.compute_engine;
        for (claim, value) in [
            ("google.compute_engine.instance_id", &compute_engine.instance_id),
            ("google.compute_engine.project_id", &compute_engine.project_id),
            ("google.compute_engine.zone", &compute_engine.zone),
        ] {
            ensure!(!value.is_empty(), ClaimInvalidSnafu {
                claim,
                reason: "cannot be empty"
            });
        }

        Ok(payload)
    }
}

async fn fetch_identity_token(client: &reqwest::Client, url: Url) -> Result<String> {
    let body = client
        .get(url.clone())
        .header(METADATA_FLAVOR, HeaderValue::from_static("Google"))
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .context(RequestIdentityTokenSnafu { url: url.clone() })?
        .text()
        .await
        .context(RequestIdentityTokenSnafu { url })?;

    Ok(body.trim().to_owned())
}

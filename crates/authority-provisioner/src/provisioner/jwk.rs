use std::net::IpAddr;

use jsonwebtoken::jwk::Jwk as JsonWebKey;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, ensure};
use tracing::{debug, instrument};
use x509_cert::Certificate;

use super::{
    ClaimInvalidSnafu, Config, InvalidKeySnafu, NotInitializedSnafu, ProvisionerType, Result,
    UnknownKeySnafu, check_renewal, init_claimer,
    token::{self, RegisteredClaims, TokenPayload},
};
use crate::{
    claims::{Claimer, Claims},
    keystore::VerificationKey,
    sign_options::{ProvisionerExtension, SignOption, SignOptions},
};

#[derive(Debug, Deserialize)]
struct JwkPayload {
    #[serde(flatten)]
    registered: RegisteredClaims,

    /// The subject alternative names to issue the certificate for.
    #[serde(default)]
    sans: Vec<String>,
}

impl TokenPayload for JwkPayload {
    fn registered(&self) -> &RegisteredClaims {
        &self.registered
    }
}

#[derive(Clone, Debug)]
struct State {
    claimer: Claimer,
    key: VerificationKey,
}

/// Authorizes tokens signed by the private counterpart of a configured
/// public key. The token issuer must be the provisioner name.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Jwk {
    pub name: String,

    /// The public key, which must have a key identifier (`kid`).
    pub key: JsonWebKey,

    /// The private key as JWE, handed out to clients which know its
    /// password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claims: Option<Claims>,

    #[serde(skip)]
    state: Option<State>,
}

impl Jwk {
    pub fn new(name: impl Into<String>, key: JsonWebKey) -> Self {
        Self {
            name: name.into(),
            key,
            encrypted_key: None,
            claims: None,
            state: None,
        }
    }

    pub fn id(&self) -> String {
        ProvisionerType::Jwk.id(&self.name)
    }

    pub fn init(&mut self, config: &Config) -> Result<()> {
        let claimer = init_claimer(ProvisionerType::Jwk, &self.name, self.claims.as_ref(), config)?;
        let key = VerificationKey::from_jwk(&self.key).context(InvalidKeySnafu { id: self.id() })?;
        self.state = Some(State { claimer, key });

        Ok(())
    }

    fn state(&self) -> Result<&State> {
        self.state
            .as_ref()
            .context(NotInitializedSnafu { id: self.id() })
    }

    #[instrument(skip_all, fields(provisioner.id = %self.id()))]
    pub fn authorize_sign(&self, token: &str) -> Result<SignOptions> {
        let state = self.state()?;
        let payload = self.authorize_token(state, token)?;
        let subject = payload.registered.sub.unwrap_or_default();

        let sans = if payload.sans.is_empty() {
            vec![subject.clone()]
        } else {
            payload.sans
        };

        let mut dns_names = Vec::new();
        let mut ip_addresses = Vec::new();
        let mut email_addresses = Vec::new();
        for san in sans {
            if let Ok(ip) = san.parse::<IpAddr>() {
                ip_addresses.push(ip);
            } else if san.contains('@') {
                email_addresses.push(san);
            } else {
                dns_names.push(san);
            }
        }

        debug!(jwk.subject = %subject, "authorized sign request");

        Ok(SignOptions::new(vec![
            SignOption::common_name(subject),
            SignOption::dns_names(dns_names),
            SignOption::ip_addresses(ip_addresses),
            SignOption::email_addresses(email_addresses),
            SignOption::default_duration(state.claimer.default_tls_cert_duration()),
            SignOption::provisioner_extension(ProvisionerExtension::new(
                ProvisionerType::Jwk,
                &self.name,
                state.key.kid(),
            )),
            SignOption::validity(
                state.claimer.min_tls_cert_duration(),
                state.claimer.max_tls_cert_duration(),
            ),
        ]))
    }

    #[instrument(skip_all, fields(provisioner.id = %self.id()))]
    pub fn authorize_revoke(&self, token: &str) -> Result<()> {
        self.authorize_token(self.state()?, token)?;
        Ok(())
    }

    pub fn authorize_renewal(&self, _certificate: &Certificate) -> Result<()> {
        check_renewal(&self.state()?.claimer, || self.id())
    }

    /// Returns the `jti` claim, which is required for tokens of this
    /// provisioner.
    pub fn token_id(&self, token: &str) -> Result<String> {
        let payload: JwkPayload = token::insecure_decode(token)?;
        payload
            .registered
            .jti
            .filter(|jti| !jti.is_empty())
            .context(ClaimInvalidSnafu {
                claim: "jti",
                reason: "is required",
            })
    }

    pub fn encrypted_key(&self) -> Option<(&str, &str)> {
        let kid = self.key.common.key_id.as_deref()?;
        let encrypted_key = self.encrypted_key.as_deref()?;
        Some((kid, encrypted_key))
    }

    fn authorize_token(&self, state: &State, token: &str) -> Result<JwkPayload> {
        let kid = token::key_id(token)?;
        ensure!(kid == state.key.kid(), UnknownKeySnafu { kid });

        let payload: JwkPayload = token::verify(token, &state.key, &self.name, &self.id())?;
        ensure!(
            payload.registered.sub.as_ref().is_some_and(|sub| !sub.is_empty()),
            ClaimInvalidSnafu {
                claim: "sub",
                reason: "cannot be empty"
            }
        );

        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use serde_json::json;

    use super::*;
    use crate::{
        provisioner::{Error, ErrorKind},
        sign_options::RequestValidator,
        test_utils::{TestKey, now},
    };

    fn provisioner(key: &TestKey) -> Jwk {
        let mut jwk = Jwk::new("admin@example.com", key.public_jwk());
        jwk.encrypted_key = Some("eyJhbGciOiJQQkVTMi1IUzI1NitBMTI4S1ciLCJlbmMiOiJBMTI4R0NNIn0".to_owned());
        jwk.init(&Config::default()).unwrap();
        jwk
    }

    fn claims(sans: serde_json::Value) -> serde_json::Value {
        json!({
            "iss": "admin@example.com",
            "aud": "jwk:admin@example.com",
            "sub": "internal.example.com",
            "iat": now(),
            "exp": now() + 300,
            "jti": "a1b2c3",
            "sans": sans,
        })
    }

    #[test]
    fn authorize_sign_partitions_sans() {
        let key = TestKey::generate("admin-key");
        let jwk = provisioner(&key);
        let token = key.sign(&claims(json!(["internal.example.com", "10.0.0.1", "ops@example.com"])));

        let options: Vec<_> = jwk.authorize_sign(&token).unwrap().into_iter().collect();

        assert_eq!(options.len(), 7);
        assert_eq!(options[0], SignOption::common_name("internal.example.com"));
        assert_eq!(
            options[1],
            SignOption::dns_names(vec!["internal.example.com".to_owned()])
        );
        assert_eq!(
            options[2],
            SignOption::ip_addresses(vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))])
        );
        assert_eq!(
            options[3],
            SignOption::email_addresses(vec!["ops@example.com".to_owned()])
        );
        assert_eq!(
            options[5],
            SignOption::provisioner_extension(ProvisionerExtension::new(
                ProvisionerType::Jwk,
                "admin@example.com",
                "admin-key"
            ))
        );
    }

    #[test]
    fn sans_default_to_subject() {
        let key = TestKey::generate("admin-key");
        let jwk = provisioner(&key);
        let token = key.sign(&claims(json!([])));

        let options: Vec<_> = jwk.authorize_sign(&token).unwrap().into_iter().collect();
        assert_eq!(
            options[1],
            SignOption::Request(RequestValidator::DnsNames(vec![
                "internal.example.com".to_owned()
            ]))
        );
    }

    #[test]
    fn token_of_other_key_is_rejected() {
        let key = TestKey::generate("admin-key");
        let jwk = provisioner(&key);

        let token = TestKey::other("other-key").sign(&claims(json!([])));
        let err = jwk.authorize_sign(&token).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownKey);

        // Same kid, different key
        let token = TestKey::other("admin-key").sign(&claims(json!([])));
        let err = jwk.authorize_revoke(&token).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TokenUnverifiable);
    }

    #[test]
    fn empty_subject_is_rejected() {
        let key = TestKey::generate("admin-key");
        let jwk = provisioner(&key);
        let mut claims = claims(json!([]));
        claims["sub"] = json!("");

        let err = jwk.authorize_sign(&key.sign(&claims)).unwrap_err();
        assert!(matches!(err, Error::ClaimInvalid { claim: "sub", .. }));
    }

    #[test]
    fn init_rejects_symmetric_key() {
        let key = serde_json::from_value(json!({"kty": "oct", "kid": "k1", "k": "c2VjcmV0"})).unwrap();
        let mut jwk = Jwk::new("admin", key);

        let err = jwk.init(&Config::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidKey { .. }));
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn token_id_and_encrypted_key() {
        let key = TestKey::generate("admin-key");
        let jwk = provisioner(&key);

        assert_eq!(jwk.token_id(&key.sign(&claims(json!([])))).unwrap(), "a1b2c3");
        assert!(jwk.token_id(&key.sign(&json!({"sub": "x"}))).is_err());

        let (kid, encrypted_key) = jwk.encrypted_key().unwrap();
        assert_eq!(kid, "admin-key");
        assert!(encrypted_key.starts_with("eyJ"));
    }
}

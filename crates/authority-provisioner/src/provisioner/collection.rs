use std::collections::{HashMap, hash_map::Entry};

use serde::Deserialize;
use snafu::OptionExt;
use tracing::{debug, instrument};
use x509_cert::Certificate;

use super::{
    Config, DuplicateProvisionerSnafu, Provisioner, ProvisionerNotFoundSnafu, Result,
};
use crate::sign_options::SignOptions;

/// The provisioner related part of the authority configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorityConfig {
    #[serde(flatten)]
    pub config: Config,

    #[serde(default)]
    pub provisioners: Vec<Provisioner>,
}

/// The initialized provisioners of an authority, indexed by their id.
#[derive(Clone, Debug, Default)]
pub struct Collection {
    provisioners: HashMap<String, Provisioner>,
}

impl Collection {
    /// Initializes every provisioner with `config`. Fails on the first
    /// invalid provisioner and on duplicate ids.
    pub fn new(
        provisioners: impl IntoIterator<Item = Provisioner>,
        config: &Config,
    ) -> Result<Self> {
        let mut by_id = HashMap::new();

        for mut provisioner in provisioners {
            provisioner.init(config)?;

            match by_id.entry(provisioner.id()) {
                Entry::Occupied(entry) => {
                    return DuplicateProvisionerSnafu { id: entry.key() }.fail();
                }
                Entry::Vacant(entry) => {
                    debug!(provisioner.id = %entry.key(), "initialized provisioner");
                    entry.insert(provisioner);
                }
            }
        }

        Ok(Self {
            provisioners: by_id,
        })
    }

    pub fn from_authority_config(authority_config: AuthorityConfig) -> Result<Self> {
        Self::new(authority_config.provisioners, &authority_config.config)
    }

    pub fn get(&self, id: &str) -> Option<&Provisioner> {
        self.provisioners.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Provisioner> {
        self.provisioners.values()
    }

    pub fn len(&self) -> usize {
        self.provisioners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.provisioners.is_empty()
    }

    fn lookup(&self, id: &str) -> Result<&Provisioner> {
        self.get(id).context(ProvisionerNotFoundSnafu { id })
    }

    #[instrument(skip(self, token))]
    pub async fn authorize_sign(&self, id: &str, token: &str) -> Result<SignOptions> {
        self.lookup(id)?.authorize_sign(token).await
    }

    #[instrument(skip(self, token))]
    pub async fn authorize_revoke(&self, id: &str, token: &str) -> Result<()> {
        self.lookup(id)?.authorize_revoke(token).await
    }

    #[instrument(skip(self, certificate))]
    pub fn authorize_renewal(&self, id: &str, certificate: &Certificate) -> Result<()> {
        self.lookup(id)?.authorize_renewal(certificate)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        provisioner::{Error, ErrorKind, Gcp, Jwk},
        test_utils::{TestKey, now},
    };

    fn authority_config(key: &TestKey) -> AuthorityConfig {
        serde_json::from_value(json!({
            "claims": {"defaultTLSCertDuration": "12h"},
            "provisioners": [
                {"type": "GCP", "name": "gcp"},
                {"type": "JWK", "name": "admin", "key": key.public_jwk()},
                {
                    "type": "OIDC",
                    "name": "google",
                    "clientID": "client",
                    "issuer": "https://accounts.google.com",
                    "jwksURI": "https://www.googleapis.com/oauth2/v3/certs",
                    "claims": {"disableRenewal": true}
                }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn indexes_by_id() {
        let key = TestKey::generate("admin-key");
        let collection = Collection::from_authority_config(authority_config(&key)).unwrap();

        assert_eq!(collection.len(), 3);
        for id in ["gcp:gcp", "jwk:admin", "oidc:google"] {
            assert_eq!(collection.get(id).unwrap().id(), id);
        }
        assert!(collection.get("gcp:other").is_none());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let provisioners = [
            Provisioner::Gcp(Gcp::new("gcp", vec![])),
            Provisioner::Gcp(Gcp::new("gcp", vec!["sa".to_owned()])),
        ];

        let err = Collection::new(provisioners, &Config::default()).unwrap_err();
        assert!(matches!(err, Error::DuplicateProvisioner { ref id } if id == "gcp:gcp"));
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn same_name_with_different_types_is_allowed() {
        let key = TestKey::generate("admin-key");
        let provisioners = [
            Provisioner::Gcp(Gcp::new("shared", vec![])),
            Provisioner::Jwk(Jwk::new("shared", key.public_jwk())),
        ];

        let collection = Collection::new(provisioners, &Config::default()).unwrap();
        assert_eq!(collection.len(), 2);
    }

    #[tokio::test]
    async fn dispatches_by_id() {
        let key = TestKey::generate("admin-key");
        let collection = Collection::from_authority_config(authority_config(&key)).unwrap();
        let token = key.sign(&json!({
            "iss": "admin",
            "aud": "jwk:admin",
            "sub": "host.example.com",
            "iat": now(),
            "exp": now() + 60,
        }));

        let options = collection.authorize_sign("jwk:admin", &token).await.unwrap();
        assert_eq!(options.len(), 7);
        collection.authorize_revoke("jwk:admin", &token).await.unwrap();

        let err = collection
            .authorize_sign("jwk:unknown", &token)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn renewal_follows_claims() {
        let key = TestKey::generate("admin-key");
        let collection = Collection::from_authority_config(authority_config(&key)).unwrap();
        let certificate = key.certificate();

        collection.authorize_renewal("gcp:gcp", &certificate).unwrap();
        let err = collection
            .authorize_renewal("oidc:google", &certificate)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RenewalDisabled);
    }
}

//! A cache of remote token verification keys, indexed by key identifier.
//!
//! The remote endpoint always returns the complete key set, so every refresh
//! replaces the whole mapping. The mapping is an immutable snapshot which is
//! published atomically, readers never observe a partially updated set and
//! never block on a running refresh.
//!
//! Refresh policy:
//!
//! - A lookup of an unknown key identifier (including the very first lookup)
//!   blocks on a single fetch-and-replace before the mapping is queried again.
//! - A lookup of a known key identifier in an expired set returns the cached
//!   key immediately and starts a background refresh (refresh-ahead).
//! - If a refresh fails, cached keys keep being served.
use std::{
    collections::{BTreeMap, HashMap},
    fmt::Debug,
    sync::Arc,
    time::Instant,
};

use arc_swap::ArcSwap;
use authority_shared::time::Duration;
use const_oid::db::rfc5912::RSA_ENCRYPTION;
use jsonwebtoken::{
    Algorithm, DecodingKey,
    jwk::{AlgorithmParameters, EllipticCurve, Jwk},
};
use reqwest::header::{CACHE_CONTROL, HeaderMap};
use serde::Deserialize;
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};
use url::Url;
use x509_cert::{Certificate, der::DecodePem};

/// The age of a fetched key set if the response carries no `max-age` cache
/// directive.
pub const DEFAULT_CACHE_AGE: Duration = Duration::from_hours_unchecked(12);

const RSA_ALGORITHMS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
];

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("cannot find key for kid {kid:?}"))]
    UnknownKey { kid: String },

    #[snafu(display("trust source unavailable and no cached key for kid {kid:?}"))]
    TrustSourceUnavailable { kid: String, source: RefreshError },
}

#[derive(Debug, Snafu)]
pub enum RefreshError {
    #[snafu(display("failed to request key set from {url}"))]
    RequestKeySet { source: reqwest::Error, url: Url },

    #[snafu(display("failed to decode key set received from {url}"))]
    DecodeKeySet { source: reqwest::Error, url: Url },
}

/// Errors which can occur when turning key material into a
/// [`VerificationKey`].
#[derive(Debug, Snafu)]
pub enum KeyError {
    #[snafu(display("key has no key identifier (kid)"))]
    MissingKeyId,

    #[snafu(display("unsupported key type, only RSA, EC (P-256, P-384) and Ed25519 are supported"))]
    UnsupportedKeyType,

    #[snafu(display("failed to create decoding key from JWK"))]
    DecodeJwk { source: jsonwebtoken::errors::Error },

    #[snafu(display("failed to decode certificate from PEM"))]
    DecodeCertificate { source: x509_cert::der::Error },
}

/// A public key which can verify token signatures.
#[derive(Clone)]
pub struct VerificationKey {
    kid: String,
    key: DecodingKey,
    algorithms: Vec<Algorithm>,
}

impl Debug for VerificationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationKey")
            .field("kid", &self.kid)
            .field("algorithms", &self.algorithms)
            .finish_non_exhaustive()
    }
}

impl VerificationKey {
    /// Creates a key from a public JWK, which must carry a `kid`.
    pub fn from_jwk(jwk: &Jwk) -> Result<Self, KeyError> {
        let kid = jwk.common.key_id.clone().context(MissingKeyIdSnafu)?;
        let algorithms = match &jwk.algorithm {
            AlgorithmParameters::RSA(_) => RSA_ALGORITHMS.to_vec(),
            AlgorithmParameters::EllipticCurve(params) => match params.curve {
                EllipticCurve::P256 => vec![Algorithm::ES256],
                EllipticCurve::P384 => vec![Algorithm::ES384],
                _ => return UnsupportedKeyTypeSnafu.fail(),
            },
            AlgorithmParameters::OctetKeyPair(params) => match params.curve {
                EllipticCurve::Ed25519 => vec![Algorithm::EdDSA],
                _ => return UnsupportedKeyTypeSnafu.fail(),
            },
            // Symmetric keys can't be published and must never verify a
            // token issued by a remote identity source.
            AlgorithmParameters::OctetKey(_) => return UnsupportedKeyTypeSnafu.fail(),
        };
        let key = DecodingKey::from_jwk(jwk).context(DecodeJwkSnafu)?;

        Ok(Self {
            kid,
            key,
            algorithms,
        })
    }

    /// Creates a key from the subject public key of a PEM encoded X.509
    /// certificate. Only RSA keys are supported.
    pub fn from_certificate_pem(kid: impl Into<String>, pem: &str) -> Result<Self, KeyError> {
        let certificate =
            Certificate::from_pem(pem.as_bytes()).context(DecodeCertificateSnafu)?;
        let spki = &certificate.tbs_certificate.subject_public_key_info;

        if spki.algorithm.oid != RSA_ENCRYPTION {
            return UnsupportedKeyTypeSnafu.fail();
        }

        // For RSA the subject public key is the PKCS#1 RSAPublicKey.
        let key = DecodingKey::from_rsa_der(spki.subject_public_key.raw_bytes());

        Ok(Self {
            kid: kid.into(),
            key,
            algorithms: RSA_ALGORITHMS.to_vec(),
        })
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn decoding_key(&self) -> &DecodingKey {
        &self.key
    }

    /// The signature algorithms this key may verify.
    pub fn algorithms(&self) -> &[Algorithm] {
        &self.algorithms
    }
}

/// The two key set document shapes served by identity providers.
#[derive(Deserialize)]
#[serde(untagged)]
enum KeySetDocument {
    /// A standard JWK set, `{"keys": [...]}`. Keys are decoded one by one so
    /// that a single unsupported key doesn't invalidate the whole set.
    Jwks { keys: Vec<serde_json::Value> },

    /// A map of key identifiers to PEM encoded certificates.
    Certificates(BTreeMap<String, String>),
}

impl KeySetDocument {
    fn into_keys(self) -> HashMap<String, Arc<VerificationKey>> {
        let keys = match self {
            Self::Jwks { keys } => keys
                .into_iter()
                .filter_map(|value| {
                    let jwk = serde_json::from_value::<Jwk>(value)
                        .inspect_err(|error| warn!(%error, "skipping malformed JWK"))
                        .ok()?;
                    VerificationKey::from_jwk(&jwk)
                        .inspect_err(|error| warn!(%error, "skipping unusable JWK"))
                        .ok()
                })
                .collect::<Vec<_>>(),
            Self::Certificates(certificates) => certificates
                .into_iter()
                .filter_map(|(kid, pem)| {
                    VerificationKey::from_certificate_pem(&kid, &pem)
                        .inspect_err(|error| warn!(%error, %kid, "skipping unusable certificate"))
                        .ok()
                })
                .collect(),
        };

        keys.into_iter()
            .map(|key| (key.kid.clone(), Arc::new(key)))
            .collect()
    }
}

#[derive(Debug, Default)]
struct KeySet {
    keys: HashMap<String, Arc<VerificationKey>>,

    /// [`None`] until the first successful fetch.
    expires_at: Option<Instant>,
}

impl KeySet {
    fn is_expired(&self) -> bool {
        self.expires_at
            .is_none_or(|expires_at| Instant::now() >= expires_at)
    }
}

#[derive(Debug)]
struct Inner {
    url: Url,
    client: reqwest::Client,
    current: ArcSwap<KeySet>,

    /// Serializes refreshes, there is at most one writer at any time.
    refresh_lock: Mutex<()>,
}

/// Remote key store for one fixed key set URL. Cloning is cheap, all clones
/// share the same cache.
#[derive(Clone, Debug)]
pub struct KeyStore {
    inner: Arc<Inner>,
}

impl KeyStore {
    /// Creates a new key store. No network request is done until the first
    /// lookup.
    pub fn new(url: Url) -> Self {
        Self::with_client(url, reqwest::Client::new())
    }

    /// Same as [`Self::new`], but uses the provided client, which lets the
    /// caller control timeouts and proxies.
    pub fn with_client(url: Url, client: reqwest::Client) -> Self {
        Self {
            inner: Arc::new(Inner {
                url,
                client,
                current: ArcSwap::from_pointee(KeySet::default()),
                refresh_lock: Mutex::new(()),
            }),
        }
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    /// Returns the verification key for `kid`, refreshing the key set as
    /// described in the [module documentation](self).
    #[instrument(skip(self), fields(keystore.url = %self.inner.url))]
    pub async fn get(&self, kid: &str) -> Result<Arc<VerificationKey>> {
        let snapshot = self.inner.current.load_full();

        if let Some(key) = snapshot.keys.get(kid) {
            if snapshot.is_expired() {
                self.refresh_in_background();
            }
            return Ok(Arc::clone(key));
        }

        match self.inner.refresh(&snapshot).await {
            Ok(()) => self
                .inner
                .current
                .load()
                .keys
                .get(kid)
                .cloned()
                .context(UnknownKeySnafu { kid }),
            Err(source) => {
                // A concurrent refresh might have succeeded in the meantime.
                if let Some(key) = self.inner.current.load().keys.get(kid) {
                    warn!(error = %source, "failed to refresh key set, using cached key");
                    return Ok(Arc::clone(key));
                }
                Err(Error::TrustSourceUnavailable {
                    kid: kid.to_owned(),
                    source,
                })
            }
        }
    }

    fn refresh_in_background(&self) {
        let inner = Arc::clone(&self.inner);

        tokio::spawn(async move {
            // Another refresh is already running, it will publish a fresh set.
            let Ok(_guard) = inner.refresh_lock.try_lock() else {
                return;
            };

            if !inner.current.load().is_expired() {
                return;
            }

            if let Err(error) = inner.fetch_and_publish().await {
                warn!(%error, keystore.url = %inner.url, "background key set refresh failed");
            }
        });
    }
}

impl Inner {
    /// Refreshes the key set unless another refresh replaced `seen` while
    /// this call waited for the refresh lock.
    async fn refresh(&self, seen: &Arc<KeySet>) -> Result<(), RefreshError> {
        let _guard = self.refresh_lock.lock().await;

        if !Arc::ptr_eq(seen, &self.current.load()) {
            return Ok(());
        }

        self.fetch_and_publish().await
    }

    async fn fetch_and_publish(&self) -> Result<(), RefreshError> {
        let key_set = self.fetch().await?;
        debug!(
            keystore.url = %self.url,
            keystore.key_count = key_set.keys.len(),
            "refreshed key set"
        );
        self.current.store(Arc::new(key_set));

        Ok(())
    }

    async fn fetch(&self) -> Result<KeySet, RefreshError> {
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .context(RequestKeySetSnafu {
                url: self.url.clone(),
            })?;

        let max_age = cache_max_age(response.headers()).unwrap_or(DEFAULT_CACHE_AGE);
        let document: KeySetDocument = response.json().await.context(DecodeKeySetSnafu {
            url: self.url.clone(),
        })?;

        Ok(KeySet {
            keys: document.into_keys(),
            expires_at: Some(Instant::now() + *max_age),
        })
    }
}

/// Extracts the `max-age` directive of the `Cache-Control` header.
fn cache_max_age(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get_all(CACHE_CONTROL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .find_map(|directive| directive.trim().strip_prefix("max-age="))
        .and_then(|seconds| seconds.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use reqwest::header::HeaderValue;
    use rstest::rstest;

    use super::*;
    use crate::test_utils::{KeySetServer, TestKey, unreachable_url};

    #[rstest]
    #[case("public, max-age=19100, must-revalidate, no-transform", Some(19100))]
    #[case("max-age=60", Some(60))]
    #[case("no-cache", None)]
    #[case("max-age=soon", None)]
    fn parse_cache_control(#[case] value: &str, #[case] expected: Option<u64>) {
        let mut headers = HeaderMap::new();
        headers.insert(CACHE_CONTROL, HeaderValue::from_str(value).unwrap());

        assert_eq!(cache_max_age(&headers), expected.map(Duration::from_secs));
    }

    #[tokio::test]
    async fn fetches_jwks_on_first_lookup() {
        let key = TestKey::generate("key-1");
        let server = KeySetServer::start(key.jwks_document(), None).await;
        let store = KeyStore::new(server.url());

        let found = store.get("key-1").await.unwrap();
        assert_eq!(found.kid(), "key-1");
        assert!(found.algorithms().contains(&Algorithm::RS256));

        // Cached, no further request
        store.get("key-1").await.unwrap();
        assert_eq!(server.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fetches_certificate_map() {
        let key = TestKey::generate("cert-1");
        let server = KeySetServer::start(key.certificates_document(), None).await;
        let store = KeyStore::new(server.url());

        let found = store.get("cert-1").await.unwrap();
        assert_eq!(found.kid(), "cert-1");
    }

    #[tokio::test]
    async fn unknown_kid_refreshes_once_per_lookup() {
        let key = TestKey::generate("key-1");
        let server = KeySetServer::start(key.jwks_document(), None).await;
        let store = KeyStore::new(server.url());

        let err = store.get("other").await.unwrap_err();
        assert!(matches!(err, Error::UnknownKey { kid } if kid == "other"));
        assert_eq!(server.hits.load(Ordering::SeqCst), 1);

        store.get("other").await.unwrap_err();
        assert_eq!(server.hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unreachable_without_cache_is_unavailable() {
        let store = KeyStore::new(unreachable_url().await);

        let err = store.get("key-1").await.unwrap_err();
        assert!(matches!(err, Error::TrustSourceUnavailable { .. }));
    }

    #[tokio::test]
    async fn expired_key_is_served_while_refreshing() {
        let key = TestKey::generate("key-1");
        let server = KeySetServer::start(key.jwks_document(), Some("max-age=0")).await;
        let store = KeyStore::new(server.url());

        store.get("key-1").await.unwrap();
        assert_eq!(server.hits.load(Ordering::SeqCst), 1);

        // The set expired immediately, the cached key is returned without
        // waiting for the refresh.
        let found = store.get("key-1").await.unwrap();
        assert_eq!(found.kid(), "key-1");

        server.wait_for_hits(2).await;
    }

    #[tokio::test]
    async fn expired_key_is_served_when_refresh_fails() {
        let key = TestKey::generate("key-1");
        let server = KeySetServer::start(key.jwks_document(), Some("max-age=0")).await;
        let store = KeyStore::new(server.url());

        store.get("key-1").await.unwrap();
        server.set_available(false);

        // Starts a background refresh which fails
        store.get("key-1").await.unwrap();
        server.wait_for_hits(2).await;

        let found = store.get("key-1").await.unwrap();
        assert_eq!(found.kid(), "key-1");

        // Unknown kids still block on a refresh, which fails
        let err = store.get("other").await.unwrap_err();
        assert!(matches!(err, Error::TrustSourceUnavailable { kid, .. } if kid == "other"));

        store.get("key-1").await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_lookups_share_one_fetch() {
        let key = TestKey::generate("key-1");
        let server = KeySetServer::start(key.jwks_document(), None).await;
        let store = KeyStore::new(server.url());

        let mut lookups = tokio::task::JoinSet::new();
        for _ in 0..16 {
            let store = store.clone();
            lookups.spawn(async move { store.get("key-1").await });
        }

        while let Some(result) = lookups.join_next().await {
            assert_eq!(result.unwrap().unwrap().kid(), "key-1");
        }
        assert_eq!(server.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn skips_unusable_keys() {
        let key = TestKey::generate("key-1");
        let mut document = key.jwks_document();
        document["keys"]
            .as_array_mut()
            .unwrap()
            .push(serde_json::json!({"kty": "oct", "kid": "secret", "k": "c2VjcmV0"}));
        let server = KeySetServer::start(document, None).await;
        let store = KeyStore::new(server.url());

        store.get("key-1").await.unwrap();
        assert!(matches!(
            store.get("secret").await.unwrap_err(),
            Error::UnknownKey { .. }
        ));
    }
}

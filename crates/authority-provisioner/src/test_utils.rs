//! Keys, tokens and a local key set endpoint for tests.
use std::{
    net::SocketAddr,
    sync::{
        Arc, LazyLock,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{
    Json, Router,
    http::{HeaderMap, HeaderValue, StatusCode, header::CACHE_CONTROL},
    response::IntoResponse,
    routing::get,
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, EncodingKey, Header, jwk::Jwk};
use rand_core::OsRng;
use rsa::{
    RsaPrivateKey,
    pkcs1::EncodeRsaPrivateKey,
    pkcs8::{EncodePublicKey, LineEnding},
    signature::Keypair,
    traits::PublicKeyParts,
};
use serde_json::json;
use tokio::net::TcpListener;
use url::Url;
use x509_cert::{
    Certificate,
    builder::{Builder, CertificateBuilder, Profile},
    der::{DecodePem, EncodePem},
    serial_number::SerialNumber,
    spki::SubjectPublicKeyInfoOwned,
    time::Validity,
};

use crate::keystore::VerificationKey;

// Smaller RSA keys are rejected when verifying signatures.
const KEY_SIZE: usize = 2048;

// Generating RSA keys is slow, all tests share the same two keys.
static KEY: LazyLock<RsaPrivateKey> = LazyLock::new(generate_rsa_key);
static OTHER_KEY: LazyLock<RsaPrivateKey> = LazyLock::new(generate_rsa_key);

fn generate_rsa_key() -> RsaPrivateKey {
    RsaPrivateKey::new(&mut OsRng, KEY_SIZE).expect("failed to generate RSA key")
}

/// The current time as seconds since the Unix epoch.
pub fn now() -> u64 {
    jsonwebtoken::get_current_timestamp()
}

/// An RSA token signing key with a key identifier.
pub struct TestKey {
    kid: String,
    private_key: &'static RsaPrivateKey,
}

impl TestKey {
    pub fn generate(kid: &str) -> Self {
        Self {
            kid: kid.to_owned(),
            private_key: &KEY,
        }
    }

    /// A key which differs from the one returned by [`Self::generate`].
    pub fn other(kid: &str) -> Self {
        Self {
            kid: kid.to_owned(),
            private_key: &OTHER_KEY,
        }
    }

    /// Signs `claims` with RS256.
    pub fn sign(&self, claims: &serde_json::Value) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.kid.clone());

        let der = self
            .private_key
            .to_pkcs1_der()
            .expect("failed to encode private key");
        let key = EncodingKey::from_rsa_der(der.as_bytes());

        jsonwebtoken::encode(&header, claims, &key).expect("failed to sign token")
    }

    pub fn public_jwk(&self) -> Jwk {
        serde_json::from_value(json!({
            "kty": "RSA",
            "kid": self.kid,
            "use": "sig",
            "alg": "RS256",
            "n": URL_SAFE_NO_PAD.encode(self.private_key.n().to_bytes_be()),
            "e": URL_SAFE_NO_PAD.encode(self.private_key.e().to_bytes_be()),
        }))
        .expect("failed to create JWK")
    }

    pub fn verification_key(&self) -> VerificationKey {
        VerificationKey::from_jwk(&self.public_jwk()).expect("failed to create verification key")
    }

    /// A self-signed certificate of the public key.
    pub fn certificate(&self) -> Certificate {
        let signing_key = rsa::pkcs1v15::SigningKey::<sha2::Sha256>::new(self.private_key.clone());
        let spki_pem = signing_key
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .expect("failed to encode public key");
        let spki = SubjectPublicKeyInfoOwned::from_pem(spki_pem.as_bytes())
            .expect("failed to decode public key");

        let builder = CertificateBuilder::new(
            Profile::Root,
            SerialNumber::from(42u64),
            Validity::from_now(Duration::from_secs(3600)).expect("failed to create validity"),
            format!("CN={}", self.kid).parse().expect("failed to parse subject"),
            spki,
            &signing_key,
        )
        .expect("failed to create certificate builder");

        builder
            .build::<rsa::pkcs1v15::Signature>()
            .expect("failed to build certificate")
    }

    /// `{"keys": [<jwk>]}`
    pub fn jwks_document(&self) -> serde_json::Value {
        json!({ "keys": [self.public_jwk()] })
    }

    /// `{"<kid>": "<certificate PEM>"}`
    pub fn certificates_document(&self) -> serde_json::Value {
        let pem = self
            .certificate()
            .to_pem(LineEnding::LF)
            .expect("failed to encode certificate");
        serde_json::Value::Object(serde_json::Map::from_iter([(
            self.kid.clone(),
            pem.into(),
        )]))
    }
}

/// Serves a fixed key set document on `/certs` and counts the requests.
/// While unavailable, every request is answered with `503`.
pub struct KeySetServer {
    addr: SocketAddr,
    pub hits: Arc<AtomicUsize>,
    available: Arc<AtomicBool>,
}

impl KeySetServer {
    pub async fn start(document: serde_json::Value, cache_control: Option<&'static str>) -> Self {
        let hits = Arc::new(AtomicUsize::new(0));
        let available = Arc::new(AtomicBool::new(true));
        let counter = Arc::clone(&hits);
        let serving = Arc::clone(&available);

        let app = Router::new().route(
            "/certs",
            get(move || {
                let counter = Arc::clone(&counter);
                let serving = Arc::clone(&serving);
                let document = document.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if !serving.load(Ordering::SeqCst) {
                        return StatusCode::SERVICE_UNAVAILABLE.into_response();
                    }

                    let mut headers = HeaderMap::new();
                    if let Some(cache_control) = cache_control {
                        headers.insert(CACHE_CONTROL, HeaderValue::from_static(cache_control));
                    }
                    (headers, Json(document)).into_response()
                }
            }),
        );

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind listener");
        let addr = listener.local_addr().expect("failed to get local address");
        tokio::spawn(async move { axum::serve(listener, app).await });

        Self {
            addr,
            hits,
            available,
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Waits until the server received at least `count` requests.
    pub async fn wait_for_hits(&self, count: usize) {
        for _ in 0..100 {
            if self.hits.load(Ordering::SeqCst) >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(
            self.hits.load(Ordering::SeqCst) >= count,
            "key set server received fewer than {count} requests"
        );
    }

    pub fn url(&self) -> Url {
        format!("http://{}/certs", self.addr)
            .parse()
            .expect("failed to parse URL")
    }
}

/// A URL on which nothing is listening.
pub async fn unreachable_url() -> Url {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind listener");
    let addr = listener.local_addr().expect("failed to get local address");
    drop(listener);

    format!("http://{addr}/certs")
        .parse()
        .expect("failed to parse URL")
}

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::Url;
use serde::Serialize;
use std::collections::BTreeSet;
use x509_parser::parse_x509_certificate;

use crate::error::{FederationError, FederationResult};

const OID_RSA_ENCRYPTION: &str = "1.2.840.113549.1.1.1";
const OID_EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";
const OID_ED25519: &str = "1.3.101.112";

/// Which signature algorithms a key can verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum KeyFamily {
    Rsa,
    Ec,
    Ed25519,
}

impl KeyFamily {
    fn from_oid(oid: &str) -> Option<Self> {
        match oid {
            OID_RSA_ENCRYPTION => Some(KeyFamily::Rsa),
            OID_EC_PUBLIC_KEY => Some(KeyFamily::Ec),
            OID_ED25519 => Some(KeyFamily::Ed25519),
            _ => None,
        }
    }
}

/// Public key material an issuer signs tokens with.
///
/// Two keys are equal when their family and subject public key bytes are equal, so the same
/// key published in two certificates (or once in metadata and once in config) is one key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SigningKey {
    family: KeyFamily,
    /// Contents of the certificate's subjectPublicKey BIT STRING.
    public_key: Vec<u8>,
    /// hex(sha256(public_key)), matched against a token's `kid` header.
    key_id: String,
}

impl SigningKey {
    pub fn from_certificate_der(der: &[u8]) -> FederationResult<Self> {
        let (_, cert) = parse_x509_certificate(der).map_err(|err| {
            FederationError::MetadataMalformed(format!("certificate parsing error: {err}"))
        })?;
        let spki = cert.public_key();
        let oid = spki.algorithm.algorithm.to_id_string();
        let family = KeyFamily::from_oid(&oid).ok_or_else(|| {
            FederationError::MetadataMalformed(format!("unsupported key algorithm {oid}"))
        })?;
        Ok(Self::from_public_key(
            family,
            spki.subject_public_key.data.to_vec(),
        ))
    }

    /// Accepts the body of an `<X509Certificate>` element, whitespace and line breaks included.
    pub fn from_certificate_base64(text: &str) -> FederationResult<Self> {
        let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        let der = BASE64.decode(compact).map_err(|err| {
            FederationError::MetadataMalformed(format!("certificate is not base64: {err}"))
        })?;
        Self::from_certificate_der(&der)
    }

    pub fn from_public_key(family: KeyFamily, public_key: Vec<u8>) -> Self {
        let key_id = hex::encode(hmac_sha256::Hash::hash(&public_key));
        Self {
            family,
            public_key,
            key_id,
        }
    }

    pub fn family(&self) -> KeyFamily {
        self.family
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }
}

/// What an identity provider publishes about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FederationMetadata {
    pub issuer: String,
    pub signing_keys: BTreeSet<SigningKey>,
    /// Where browsers are sent to sign in (`wa=wsignin1.0`).
    pub passive_endpoint: Option<Url>,
}

/// The merged trust parameters every token is checked against.
///
/// Only [`crate::merge`] builds these and nothing hands out a `&mut`, so once published behind an
/// `Arc` they are read-only for the rest of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationParameters {
    valid_issuers: BTreeSet<String>,
    signing_keys: BTreeSet<SigningKey>,
    realm: String,
    sign_in_endpoint: Option<Url>,
}

impl ValidationParameters {
    pub(crate) fn new(
        valid_issuers: BTreeSet<String>,
        signing_keys: BTreeSet<SigningKey>,
        realm: String,
        sign_in_endpoint: Option<Url>,
    ) -> Self {
        Self {
            valid_issuers,
            signing_keys,
            realm,
            sign_in_endpoint,
        }
    }

    pub fn valid_issuers(&self) -> &BTreeSet<String> {
        &self.valid_issuers
    }

    pub fn signing_keys(&self) -> &BTreeSet<SigningKey> {
        &self.signing_keys
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn sign_in_endpoint(&self) -> Option<&Url> {
        self.sign_in_endpoint.as_ref()
    }

    /// Tokens can only be validated when there is at least one issuer and one key to trust.
    pub fn ensure_complete(&self) -> FederationResult<()> {
        if self.valid_issuers.is_empty() {
            return Err(FederationError::Configuration(
                "no valid issuers after merging federation metadata".to_string(),
            ));
        }
        if self.signing_keys.is_empty() {
            return Err(FederationError::Configuration(
                "no signing keys after merging federation metadata".to_string(),
            ));
        }
        Ok(())
    }
}

use jsonwebtoken::{decode, decode_header, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use quick_xml::{events::Event, Reader};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, time::Duration};

use crate::{
    data_model::{KeyFamily, SigningKey, ValidationParameters},
    error::{FederationError, FederationResult},
};

/// Default tolerance for `exp`/`nbf` checks.
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(300);

const HIDDEN_PII: &str = "[PII hidden]";

#[derive(Debug, Deserialize)]
struct TokenClaims {
    sub: Option<String>,
    iss: String,
    name: Option<String>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_json::Value>,
}

/// Who a validated token says the caller is.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FederatedIdentity {
    pub subject: String,
    pub issuer: String,
    pub name: Option<String>,
    /// Key id of the signing key that verified the token.
    pub key_id: String,
    pub claims: BTreeMap<String, serde_json::Value>,
}

fn rejected(reason: impl std::fmt::Display) -> FederationError {
    FederationError::ValidationFailure(reason.to_string())
}

fn family_for(alg: Algorithm) -> Option<KeyFamily> {
    match alg {
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512 => Some(KeyFamily::Rsa),
        Algorithm::ES256 | Algorithm::ES384 => Some(KeyFamily::Ec),
        Algorithm::EdDSA => Some(KeyFamily::Ed25519),
        // shared secrets have no place in federation metadata
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => None,
    }
}

fn decoding_key(key: &SigningKey) -> DecodingKey {
    match key.family() {
        KeyFamily::Rsa => DecodingKey::from_rsa_der(key.public_key()),
        KeyFamily::Ec => DecodingKey::from_ec_der(key.public_key()),
        KeyFamily::Ed25519 => DecodingKey::from_ed_der(key.public_key()),
    }
}

/// Checks tokens against published [`ValidationParameters`].
#[derive(Debug, Clone, Copy)]
pub struct TokenValidator {
    pub clock_skew: Duration,
    /// Log subjects and rejection details in full. Development only.
    pub show_pii: bool,
}

impl Default for TokenValidator {
    fn default() -> Self {
        Self {
            clock_skew: DEFAULT_CLOCK_SKEW,
            show_pii: false,
        }
    }
}

impl TokenValidator {
    /// Valid means: signed by a trusted key, issued by a trusted issuer, addressed to our realm
    /// and inside its lifetime.
    #[tracing::instrument(skip_all)]
    pub fn validate(
        &self,
        parameters: &ValidationParameters,
        token: &str,
    ) -> FederationResult<FederatedIdentity> {
        parameters.ensure_complete()?;

        let header = decode_header(token).map_err(rejected)?;
        let family = family_for(header.alg)
            .ok_or_else(|| rejected(format!("algorithm {:?} is not accepted", header.alg)))?;

        // a kid we know narrows it to one key, anything else means try every key that fits
        let by_kid: Vec<&SigningKey> = parameters
            .signing_keys()
            .iter()
            .filter(|key| header.kid.as_deref() == Some(key.key_id()))
            .collect();
        if let Some(key) = by_kid.iter().find(|key| key.family() != family) {
            return Err(rejected(format!(
                "kid {} names a {:?} key but the token is signed with {:?}",
                key.key_id(),
                key.family(),
                header.alg
            )));
        }
        let candidates: Vec<&SigningKey> = if by_kid.is_empty() {
            parameters
                .signing_keys()
                .iter()
                .filter(|key| key.family() == family)
                .collect()
        } else {
            by_kid
        };

        let mut validation = Validation::new(header.alg);
        validation.leeway = self.clock_skew.as_secs();
        validation.validate_nbf = true;
        validation.set_issuer(&parameters.valid_issuers().iter().collect::<Vec<_>>());
        validation.set_audience(&[parameters.realm()]);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);

        for key in candidates {
            match decode::<TokenClaims>(token, &decoding_key(key), &validation) {
                Ok(data) => return self.identity(data.claims, key),
                Err(err) if matches!(err.kind(), ErrorKind::InvalidSignature) => continue,
                Err(err) => {
                    if self.show_pii {
                        tracing::debug!(key_id = key.key_id(), "token rejected: {err}");
                    }
                    return Err(rejected(err));
                }
            }
        }
        Err(rejected("signature does not match any trusted signing key"))
    }

    fn identity(
        &self,
        claims: TokenClaims,
        key: &SigningKey,
    ) -> FederationResult<FederatedIdentity> {
        let subject = claims
            .sub
            .filter(|sub| !sub.is_empty())
            .ok_or_else(|| rejected("token has no subject"))?;
        tracing::info!(
            subject = if self.show_pii { subject.as_str() } else { HIDDEN_PII },
            issuer = %claims.iss,
            "token validated"
        );
        Ok(FederatedIdentity {
            subject,
            issuer: claims.iss,
            name: claims.name,
            key_id: key.key_id().to_string(),
            claims: claims.extra,
        })
    }
}

/// Gets the security token out of a sign-in response's `wresult`.
///
/// `wresult` is either the token itself or a `RequestSecurityTokenResponse` envelope with the
/// token as the text of its `RequestedSecurityToken` element.
pub fn token_from_wresult(wresult: &str) -> FederationResult<String> {
    let wresult = wresult.trim();
    if wresult.is_empty() {
        return Err(rejected("wresult is empty"));
    }
    if !wresult.starts_with('<') {
        return Ok(wresult.to_string());
    }

    let mut reader = Reader::from_str(wresult);
    reader.config_mut().trim_text(true);
    let mut inside = false;
    loop {
        match reader.read_event().map_err(rejected)? {
            Event::Start(element) if element.local_name().as_ref() == b"RequestedSecurityToken" => {
                inside = true;
            }
            Event::End(element) if element.local_name().as_ref() == b"RequestedSecurityToken" => {
                inside = false;
            }
            Event::Text(text) if inside => {
                return Ok(text.unescape().map_err(rejected)?.into_owned());
            }
            Event::CData(data) if inside => {
                return String::from_utf8(data.into_inner().into_owned()).map_err(rejected);
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Err(rejected("RequestedSecurityToken not found in wresult"))
}

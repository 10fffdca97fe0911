use reqwest::Url;
use std::collections::BTreeSet;

use crate::data_model::{FederationMetadata, SigningKey, ValidationParameters};

/// Trust that is configured locally rather than discovered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticTrust {
    pub realm: String,
    pub valid_issuers: BTreeSet<String>,
    pub signing_keys: BTreeSet<SigningKey>,
    /// Overrides the passive endpoint advertised in metadata.
    pub sign_in_endpoint: Option<Url>,
}

impl StaticTrust {
    pub fn merge(&self, metadata: &FederationMetadata) -> ValidationParameters {
        merge(
            &self.realm,
            &self.valid_issuers,
            &self.signing_keys,
            self.sign_in_endpoint.as_ref(),
            metadata,
        )
    }
}

/// Union of the static issuers/keys with the ones the metadata advertises.
///
/// Sets keep the result free of duplicates, so merging the same inputs twice gives equal output.
pub fn merge(
    realm: &str,
    static_issuers: &BTreeSet<String>,
    static_keys: &BTreeSet<SigningKey>,
    sign_in_endpoint: Option<&Url>,
    metadata: &FederationMetadata,
) -> ValidationParameters {
    let mut valid_issuers = static_issuers.clone();
    valid_issuers.insert(metadata.issuer.clone());

    let mut signing_keys = static_keys.clone();
    signing_keys.extend(metadata.signing_keys.iter().cloned());

    ValidationParameters::new(
        valid_issuers,
        signing_keys,
        realm.to_string(),
        sign_in_endpoint
            .cloned()
            .or_else(|| metadata.passive_endpoint.clone()),
    )
}

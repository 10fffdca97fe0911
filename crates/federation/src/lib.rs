//! Trust bootstrap for a WS-Federation relying party.
//!
//! Metadata is fetched once ([`metadata_cache`]), merged with locally configured trust
//! ([`merge`]) and published by [`bootstrap::Bootstrap`] before any token is checked
//! ([`validation`]).

pub mod bootstrap;
pub mod data_model;
pub mod error;
pub mod merge;
pub mod metadata;
pub mod metadata_cache;
pub mod validation;

pub use bootstrap::{Bootstrap, BootstrapMode, BootstrapState};
pub use data_model::{FederationMetadata, KeyFamily, SigningKey, ValidationParameters};
pub use error::{FederationError, FederationResult};
pub use merge::{merge, StaticTrust};
pub use metadata::{parse_federation_metadata, HttpMetadataSource, MetadataSource};
pub use metadata_cache::MetadataCache;
pub use validation::{token_from_wresult, FederatedIdentity, TokenValidator};

use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{watch, OnceCell};

use crate::{
    data_model::ValidationParameters,
    error::{FederationError, FederationResult},
    merge::StaticTrust,
    metadata_cache::MetadataCache,
};

/// Progress of the one-time trust bootstrap.
///
/// `Uninitialized -> Fetching -> Merged -> Ready`, or `Fetching -> Failed`. Failed is terminal
/// until the process restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapState {
    Uninitialized,
    Fetching,
    Merged,
    Ready,
    Failed,
}

impl BootstrapState {
    pub fn is_settled(self) -> bool {
        matches!(self, BootstrapState::Ready | BootstrapState::Failed)
    }
}

/// When the bootstrap runs: before the listener accepts connections, or on the first request
/// that needs trust parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BootstrapMode {
    #[default]
    Eager,
    Lazy,
}

/// Fetches metadata, merges it with static trust and publishes the result exactly once.
///
/// Publishing goes through a [`OnceCell`], whose set/get pair is a release/acquire barrier:
/// whoever sees the cell populated (or observes [`BootstrapState::Ready`], which is only sent
/// after the cell is populated) sees fully merged parameters. Concurrent callers of
/// [`Bootstrap::run`] wait on the single in-flight initialization instead of starting their own.
#[derive(Debug)]
pub struct Bootstrap {
    metadata_address: Url,
    trust: StaticTrust,
    cache: MetadataCache,
    published: OnceCell<FederationResult<Arc<ValidationParameters>>>,
    state: watch::Sender<BootstrapState>,
}

impl Bootstrap {
    pub fn new(metadata_address: Url, trust: StaticTrust, cache: MetadataCache) -> Self {
        let (state, _) = watch::channel(BootstrapState::Uninitialized);
        Self {
            metadata_address,
            trust,
            cache,
            published: OnceCell::new(),
            state,
        }
    }

    pub fn metadata_address(&self) -> &Url {
        &self.metadata_address
    }

    pub fn state(&self) -> BootstrapState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<BootstrapState> {
        self.state.subscribe()
    }

    /// Waits until the bootstrap is either ready or failed, without triggering it.
    pub async fn settled(&self) -> BootstrapState {
        let mut state = self.subscribe();
        let settled = match state.wait_for(|state| state.is_settled()).await {
            Ok(state) => *state,
            // the sender lives in self, so it can't be gone while we hold &self
            Err(_) => self.state(),
        };
        settled
    }

    /// The published parameters, if the bootstrap already finished. Never waits.
    pub fn published(&self) -> Option<FederationResult<Arc<ValidationParameters>>> {
        self.published.get().cloned()
    }

    /// Runs the bootstrap if nobody has yet, otherwise returns its outcome.
    ///
    /// A failed bootstrap keeps failing with [`FederationError::Configuration`] without going
    /// back to the metadata endpoint.
    pub async fn run(&self) -> FederationResult<Arc<ValidationParameters>> {
        let outcome = self
            .published
            .get_or_init(|| self.initialize())
            .await
            .clone();
        // both settled states are sent only once the cell holds the outcome
        self.transition(match outcome {
            Ok(_) => BootstrapState::Ready,
            Err(_) => BootstrapState::Failed,
        });
        outcome
    }

    fn transition(&self, next: BootstrapState) {
        self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            tracing::debug!(from = ?*state, to = ?next, "bootstrap state");
            *state = next;
            true
        });
    }

    #[tracing::instrument(skip_all, fields(metadata = %self.metadata_address))]
    async fn initialize(&self) -> FederationResult<Arc<ValidationParameters>> {
        self.transition(BootstrapState::Fetching);
        match self.fetch_and_merge().await {
            Ok(parameters) => {
                self.transition(BootstrapState::Merged);
                tracing::info!(
                    issuers = parameters.valid_issuers().len(),
                    signing_keys = parameters.signing_keys().len(),
                    realm = parameters.realm(),
                    "trust parameters merged"
                );
                Ok(Arc::new(parameters))
            }
            Err(err) => {
                tracing::error!(
                    retryable = err.is_retryable(),
                    "trust bootstrap failed, authentication disabled until restart: {err}"
                );
                Err(match err {
                    FederationError::Configuration(_) => err,
                    other => FederationError::Configuration(format!(
                        "trust parameters unavailable: {other}"
                    )),
                })
            }
        }
    }

    async fn fetch_and_merge(&self) -> FederationResult<ValidationParameters> {
        let metadata = self.cache.fetch(&self.metadata_address).await?;
        let parameters = self.trust.merge(&metadata);
        parameters.ensure_complete()?;
        Ok(parameters)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::{
        data_model::{tests::idp_key, FederationMetadata},
        metadata::{
            tests::{test_metadata, METADATA_ISSUER},
            MetadataSource, MockMetadataSource,
        },
        metadata_cache::{DEFAULT_METADATA_TIMEOUT, DEFAULT_METADATA_TTL},
    };
    use std::{collections::BTreeSet, time::Duration};

    pub const REALM: &str = "https://webapp.example.com/";

    pub fn metadata_address() -> Url {
        Url::parse("https://adfs.example.com/FederationMetadata/2007-06/FederationMetadata.xml")
            .unwrap()
    }

    pub fn test_trust() -> StaticTrust {
        StaticTrust {
            realm: REALM.to_string(),
            valid_issuers: BTreeSet::from(["https://sts.windows.net/static/".to_string()]),
            ..Default::default()
        }
    }

    pub fn bootstrap_with(source: impl MetadataSource + 'static, trust: StaticTrust) -> Bootstrap {
        let cache = MetadataCache::new(
            Arc::new(source),
            DEFAULT_METADATA_TTL,
            DEFAULT_METADATA_TIMEOUT,
        );
        Bootstrap::new(metadata_address(), trust, cache)
    }

    #[tokio::test]
    async fn test_run_publishes_merged_parameters() {
        let mut source = MockMetadataSource::new();
        source
            .expect_fetch_metadata()
            .withf(|address| *address == metadata_address())
            .times(1)
            .returning(|_| Ok(test_metadata()));
        let bootstrap = bootstrap_with(source, test_trust());
        assert_eq!(bootstrap.state(), BootstrapState::Uninitialized);
        assert!(bootstrap.published().is_none());

        let parameters = bootstrap.run().await.unwrap();
        assert_eq!(bootstrap.state(), BootstrapState::Ready);
        assert_eq!(
            parameters.valid_issuers(),
            &BTreeSet::from([
                "https://sts.windows.net/static/".to_string(),
                METADATA_ISSUER.to_string()
            ])
        );
        assert_eq!(parameters.signing_keys(), &BTreeSet::from([idp_key()]));
        assert_eq!(parameters.realm(), REALM);
        assert!(Arc::ptr_eq(
            &parameters,
            &bootstrap.published().unwrap().unwrap()
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_runs_fetch_once() {
        let mut source = MockMetadataSource::new();
        source.expect_fetch_metadata().times(1).returning(|_| {
            // keep the fetch in flight long enough for every task to pile up behind it
            std::thread::sleep(Duration::from_millis(100));
            Ok(test_metadata())
        });
        let bootstrap = Arc::new(bootstrap_with(source, test_trust()));
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let bootstrap = bootstrap.clone();
                tokio::spawn(async move { bootstrap.run().await })
            })
            .collect();
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }
        assert!(results.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
        assert_eq!(bootstrap.state(), BootstrapState::Ready);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_unreachable_metadata_fails_every_request() {
        let mut source = MockMetadataSource::new();
        source
            .expect_fetch_metadata()
            .times(1)
            .returning(|_| Err(FederationError::MetadataUnreachable("connection refused".into())));
        let bootstrap = Arc::new(bootstrap_with(source, test_trust()));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let bootstrap = bootstrap.clone();
                tokio::spawn(async move { bootstrap.run().await })
            })
            .collect();
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, FederationError::Configuration(_)), "{err:?}");
        }
        assert_eq!(bootstrap.state(), BootstrapState::Failed);
        assert_eq!(bootstrap.settled().await, BootstrapState::Failed);

        // terminal: no new fetch, same answer
        let err = bootstrap.run().await.unwrap_err();
        assert!(matches!(err, FederationError::Configuration(_)));
        assert!(matches!(
            bootstrap.published(),
            Some(Err(FederationError::Configuration(_)))
        ));
    }

    #[tokio::test]
    async fn test_metadata_without_keys_is_a_configuration_error() {
        let mut source = MockMetadataSource::new();
        source.expect_fetch_metadata().times(1).returning(|_| {
            Ok(FederationMetadata {
                issuer: "https://idp.example.com/".to_string(),
                signing_keys: BTreeSet::new(),
                passive_endpoint: None,
            })
        });
        let bootstrap = bootstrap_with(source, test_trust());
        let err = bootstrap.run().await.unwrap_err();
        assert!(matches!(err, FederationError::Configuration(_)), "{err:?}");
        assert_eq!(bootstrap.state(), BootstrapState::Failed);
    }

    #[tokio::test]
    async fn test_static_keys_cover_keyless_metadata() {
        let mut source = MockMetadataSource::new();
        source.expect_fetch_metadata().times(1).returning(|_| {
            Ok(FederationMetadata {
                issuer: "https://idp.example.com/".to_string(),
                signing_keys: BTreeSet::new(),
                passive_endpoint: None,
            })
        });
        let mut trust = test_trust();
        trust.signing_keys.insert(idp_key());
        let bootstrap = bootstrap_with(source, trust);
        let parameters = bootstrap.run().await.unwrap();
        assert_eq!(parameters.signing_keys().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_state_is_observable_while_fetching() {
        let mut source = MockMetadataSource::new();
        source.expect_fetch_metadata().times(1).returning(|_| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(test_metadata())
        });
        let bootstrap = Arc::new(bootstrap_with(source, test_trust()));
        let mut states = bootstrap.subscribe();
        let runner = {
            let bootstrap = bootstrap.clone();
            tokio::spawn(async move { bootstrap.run().await })
        };
        states
            .wait_for(|state| *state == BootstrapState::Fetching)
            .await
            .unwrap();
        assert!(bootstrap.published().is_none());
        assert_eq!(bootstrap.settled().await, BootstrapState::Ready);
        // Ready is only announced once the parameters can be read
        assert!(matches!(bootstrap.published(), Some(Ok(_))));
        runner.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failed_is_announced_after_the_outcome_is_published() {
        let mut source = MockMetadataSource::new();
        source.expect_fetch_metadata().times(1).returning(|_| {
            std::thread::sleep(Duration::from_millis(300));
            Err(FederationError::MetadataMalformed("no entityID".into()))
        });
        let bootstrap = Arc::new(bootstrap_with(source, test_trust()));
        let runner = {
            let bootstrap = bootstrap.clone();
            tokio::spawn(async move { bootstrap.run().await })
        };
        assert_eq!(bootstrap.settled().await, BootstrapState::Failed);
        assert!(matches!(
            bootstrap.published(),
            Some(Err(FederationError::Configuration(_)))
        ));
        assert!(runner.await.unwrap().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_ready_parameters_never_change() {
        let mut source = MockMetadataSource::new();
        source
            .expect_fetch_metadata()
            .times(1)
            .returning(|_| Ok(test_metadata()));
        let bootstrap = Arc::new(bootstrap_with(source, test_trust()));
        let snapshot = (*bootstrap.run().await.unwrap()).clone();
        let handles: Vec<_> = (0..1000)
            .map(|_| {
                let bootstrap = bootstrap.clone();
                tokio::spawn(async move { bootstrap.run().await })
            })
            .collect();
        for handle in handles {
            assert_eq!(*handle.await.unwrap().unwrap(), snapshot);
        }
        assert_eq!(*bootstrap.run().await.unwrap(), snapshot);
    }
}

use axum::{
    extract::{OriginalUri, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use federation::{
    token_from_wresult, Bootstrap, BootstrapMode, BootstrapState, FederatedIdentity,
    FederationError, MetadataCache, MetadataSource, TokenValidator, ValidationParameters,
};
use serde::{Deserialize, Serialize};
use std::{error::Error, future::Future, sync::Arc};
use tokio::net::TcpListener;
use tower_http::trace::{DefaultOnFailure, TraceLayer};
use tracing::Level;

use crate::config::AppConfig;

pub const SIGN_IN_ACTION: &str = "wsignin1.0";
pub const SIGN_IN_CALLBACK_PATH: &str = "/signin-wsfed";

#[derive(Clone, Debug)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub bootstrap: Arc<Bootstrap>,
    pub validator: TokenValidator,
}

impl AppState {
    pub fn new(config: AppConfig, source: impl MetadataSource + 'static) -> Self {
        let cache =
            MetadataCache::new(Arc::new(source), config.metadata_ttl, config.metadata_timeout);
        let bootstrap =
            Bootstrap::new(config.metadata_address.clone(), config.trust.clone(), cache);
        let validator = TokenValidator {
            clock_skew: config.clock_skew,
            show_pii: config.is_development(),
        };
        Self {
            config: Arc::new(config),
            bootstrap: Arc::new(bootstrap),
            validator,
        }
    }

    /// Trust parameters for a request, running the bootstrap first if nothing has yet.
    async fn parameters(&self) -> Result<Arc<ValidationParameters>, (StatusCode, &'static str)> {
        self.bootstrap.run().await.map_err(error_response)
    }

    fn validate(
        &self,
        parameters: &ValidationParameters,
        token: &str,
    ) -> Result<FederatedIdentity, (StatusCode, &'static str)> {
        self.validator.validate(parameters, token).map_err(error_response)
    }
}

/// Clients only ever see a generic message, details go to the log.
///
/// A failed bootstrap was already logged at error level when it happened, every request after
/// that only gets a debug line.
fn error_response(err: FederationError) -> (StatusCode, &'static str) {
    match err {
        FederationError::ValidationFailure(_) => {
            tracing::warn!("{err}");
            (StatusCode::UNAUTHORIZED, "invalid security token")
        }
        _ => {
            tracing::debug!("{err}");
            (StatusCode::INTERNAL_SERVER_ERROR, "authentication is unavailable")
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/secure", get(secure))
        .route(SIGN_IN_CALLBACK_PATH, post(signin_wsfed))
        .route("/healthz", get(healthz))
        .layer(
            // 5xx here are the echo of a bootstrap failure that was already logged as an error
            TraceLayer::new_for_http().on_failure(DefaultOnFailure::new().level(Level::WARN)),
        )
        .with_state(state)
}

pub async fn index() -> impl IntoResponse {
    (
        StatusCode::OK,
        "Public page. Visit /secure to sign in through the identity provider.",
    )
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("Bearer") && !token.is_empty()).then_some(token)
}

/// `wctx` is echoed back by the identity provider, so only same-origin paths are honoured.
/// `//host` and `/\host` are read as another origin by browsers.
fn return_to(wctx: Option<String>) -> String {
    wctx.filter(|wctx| {
        wctx.starts_with('/')
            && !wctx.starts_with("//")
            && !wctx.starts_with("/\\")
            && !wctx.chars().any(char::is_control)
    })
    .unwrap_or_else(|| "/".to_string())
}

#[tracing::instrument(skip_all)]
pub async fn secure(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Result<Response, (StatusCode, &'static str)> {
    let parameters = state.parameters().await?;
    let Some(token) = bearer_token(&headers) else {
        let context = uri.path_and_query().map(|path| path.as_str()).unwrap_or("/");
        return challenge(&state, &parameters, context);
    };
    let identity = state.validate(&parameters, token)?;
    Ok(Json(identity).into_response())
}

/// 302 to the identity provider's passive sign-in endpoint.
fn challenge(
    state: &AppState,
    parameters: &ValidationParameters,
    context: &str,
) -> Result<Response, (StatusCode, &'static str)> {
    let mut location = parameters
        .sign_in_endpoint()
        .cloned()
        .ok_or_else(|| {
            tracing::error!("no sign-in endpoint in metadata or config");
            (StatusCode::INTERNAL_SERVER_ERROR, "authentication is unavailable")
        })?;
    {
        let mut query = location.query_pairs_mut();
        query
            .append_pair("wa", SIGN_IN_ACTION)
            .append_pair("wtrealm", parameters.realm());
        if let Some(reply_url) = &state.config.reply_url {
            query.append_pair("wreply", reply_url.as_str());
        }
        query.append_pair("wctx", context);
    }
    tracing::debug!(location = %location, "challenging unauthenticated request");
    Ok((StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response())
}

/// The sign-in response the identity provider posts back.
#[derive(Debug, Deserialize)]
pub struct SignInResponse {
    pub wa: String,
    pub wresult: Option<String>,
    pub wctx: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SignedIn {
    pub identity: FederatedIdentity,
    /// Where the user was headed before the challenge.
    pub return_to: String,
}

#[tracing::instrument(skip_all)]
pub async fn signin_wsfed(
    State(state): State<AppState>,
    Form(form): Form<SignInResponse>,
) -> impl IntoResponse {
    if form.wa != SIGN_IN_ACTION {
        tracing::debug!(wa = %form.wa, "ignoring sign-in response");
        return Err((StatusCode::BAD_REQUEST, "unsupported wa"));
    }
    let wresult = form
        .wresult
        .as_deref()
        .ok_or((StatusCode::BAD_REQUEST, "wresult missing"))?;
    let parameters = state.parameters().await?;
    let token = token_from_wresult(wresult).map_err(error_response)?;
    let identity = state.validate(&parameters, &token)?;
    Ok::<_, (StatusCode, _)>((
        StatusCode::OK,
        Json(SignedIn {
            identity,
            return_to: return_to(form.wctx),
        }),
    ))
}

#[derive(Debug, Serialize)]
pub struct Health {
    pub bootstrap: BootstrapState,
}

pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let bootstrap = state.bootstrap.state();
    let status = match bootstrap {
        BootstrapState::Ready => StatusCode::OK,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(Health { bootstrap }))
}

/// Binds `listen_address`. In eager mode the trust bootstrap has settled before this returns.
///
/// A failed bootstrap doesn't stop the server, requests that need authentication get a 500
/// instead.
pub async fn bind(state: &AppState) -> std::io::Result<TcpListener> {
    if state.config.bootstrap_mode == BootstrapMode::Eager {
        let _ = state.bootstrap.run().await;
    }
    let listener = TcpListener::bind(&state.config.listen_address).await?;
    tracing::info!(
        address = %listener.local_addr()?,
        bootstrap = ?state.bootstrap.state(),
        "listening"
    );
    Ok(listener)
}

/// Serves on `listener` until `shutdown` resolves.
pub async fn serve_with_shutdown(
    state: AppState,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

/// Binds `listen_address` and serves until ctrl-c.
#[tracing::instrument(skip_all, err)]
pub async fn serve(state: AppState) -> Result<(), Box<dyn Error>> {
    let listener = bind(&state).await?;
    serve_with_shutdown(state, listener, shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("{err:?}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

use std::error::Error;

use federation::HttpMetadataSource;
use wsfed_webapp::{
    config::AppConfig,
    observability,
    web::{self, AppState},
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = AppConfig::load()?;
    observability::init(&config)?;
    tracing::info!(
        environment = ?config.environment,
        realm = config.realm(),
        metadata = %config.metadata_address,
        bootstrap = ?config.bootstrap_mode,
        "starting"
    );
    let source = HttpMetadataSource::new(config.metadata_timeout)?;
    web::serve(AppState::new(config, source)).await
}

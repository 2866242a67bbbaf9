use std::sync::Arc;

use common::{
    storage::db::SurrealDbClient, storage::store::StorageManager, utils::config::get_config,
};
use ingestion_pipeline::{run_worker_loop, KnowledgeEngine};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = get_config()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );
    db.ensure_initialized().await?;

    let openai_client = Arc::new(async_openai::Client::with_config(
        async_openai::config::OpenAIConfig::new()
            .with_api_key(&config.openai_api_key)
            .with_api_base(&config.openai_base_url),
    ));

    let storage = StorageManager::new(&config).await?;
    let engine = Arc::new(KnowledgeEngine::new(
        Arc::clone(&db),
        storage,
        openai_client,
        &config,
    )?);

    let concurrency = config.worker_concurrency.max(1);
    info!(concurrency, "starting knowledge workers");
    let workers: Vec<_> = (0..concurrency)
        .map(|_| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                if let Err(err) = run_worker_loop(engine).await {
                    error!(error = %err, "worker loop exited");
                }
            })
        })
        .collect();

    futures::future::join_all(workers).await;
    Ok(())
}

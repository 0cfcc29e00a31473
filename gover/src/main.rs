use std::sync::Arc;

use gover::config::AppConfig;
use gover::consumer::{
    ConsumerOptions, DanmakuConsumer, DanmakuDispatcher, KeywordRuleDispatcher, NoopDispatcher,
};
use gover::database::{self, repositories::SqlxStore};
use gover::integration::executor::{
    BotExecutor, LogOnlyController, PtzBotExecutor, WebhookExecutor,
};
use gover::integration::{ExecutorRegistry, IntegrationRuntime, IntegrationService};
use gover::logging::init_logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    // Dropping the guard flushes the file appender.
    let _log_guard = init_logging(&config.logging)?;

    danmaku::http::install_rustls_provider();

    let pool = database::init_pool(&config.database_url).await?;
    let write_pool = database::init_write_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;

    let store = Arc::new(SqlxStore::new(pool, write_pool));

    let controller = Arc::new(LogOnlyController);
    let bot_runner = Arc::new(PtzBotExecutor::new(
        controller.clone(),
        controller.clone(),
        controller,
    ));
    let executors = ExecutorRegistry::new()
        .with(Arc::new(WebhookExecutor::new(store.clone())?))
        .with(Arc::new(BotExecutor::new(bot_runner, store.clone())));

    let service = Arc::new(IntegrationService::new(store.clone(), executors));

    let dispatcher: Arc<dyn DanmakuDispatcher> = match &config.danmaku_rules {
        Some(path) => Arc::new(KeywordRuleDispatcher::from_file(path, service.clone()).await?),
        None => Arc::new(NoopDispatcher),
    };
    let consumer = Arc::new(DanmakuConsumer::new(
        store,
        service.features().clone(),
        dispatcher,
        ConsumerOptions {
            cookie_file: config.cookie_file.clone(),
        },
    )?);

    let runtime = IntegrationRuntime::new(service, Some(consumer));
    runtime.start().await;
    tracing::info!("gover started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    runtime.stop().await;
    tracing::info!("gover stopped");

    Ok(())
}

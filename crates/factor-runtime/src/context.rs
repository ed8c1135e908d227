use std::sync::Arc;

use factor_core::FactorError;
use factor_data::{
    DocumentStore, FactorRepository, FactorSeriesLoader, LogRepository, ResultRepository,
    StoreConfig, TaskRepository,
};

use crate::log_hub::{LogHub, MongoLogSink};
use crate::scheduler::{JobScheduler, SchedulerConfig};

/// The explicit dependency bundle: store handle, repositories, log hub, and
/// scheduler, built once at startup and shared by reference.
pub struct AppContext {
    pub store: Arc<DocumentStore>,
    pub factors: FactorRepository,
    pub tasks: TaskRepository,
    pub results: ResultRepository,
    pub logs: LogRepository,
    pub loader: FactorSeriesLoader,
    pub log_hub: Arc<LogHub>,
    pub scheduler: JobScheduler,
}

impl AppContext {
    pub async fn initialize(
        store_config: &StoreConfig,
        scheduler_config: SchedulerConfig,
    ) -> Result<Arc<Self>, FactorError> {
        let store = Arc::new(DocumentStore::connect(store_config).await?);
        store.ensure_indexes().await?;

        let factors = FactorRepository::new(&store);
        let tasks = TaskRepository::new(&store);
        let results = ResultRepository::new(&store);
        let logs = LogRepository::new(&store);
        let loader = FactorSeriesLoader::new(store.clone());

        let log_hub = Arc::new(LogHub::new(Arc::new(MongoLogSink::new(
            logs.clone(),
            tasks.clone(),
        ))));
        log_hub.start();

        let scheduler = JobScheduler::new(
            factors.clone(),
            tasks.clone(),
            results.clone(),
            loader.clone(),
            log_hub.clone(),
            scheduler_config,
        );

        Ok(Arc::new(AppContext {
            store,
            factors,
            tasks,
            results,
            logs,
            loader,
            log_hub,
            scheduler,
        }))
    }

    /// Graceful shutdown: drain the log hub so buffered entries land.
    pub async fn shutdown(&self) {
        self.log_hub.shutdown().await;
    }
}

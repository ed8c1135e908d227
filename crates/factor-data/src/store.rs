use std::time::Duration;

use factor_core::FactorError;
use mongodb::bson::doc;
use mongodb::options::{ClientOptions, IndexOptions};
use mongodb::{Client, Collection, Database, IndexModel};

/// Connection settings for the document store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub uri: String,
    pub database: String,
}

impl StoreConfig {
    pub fn from_env() -> Self {
        StoreConfig {
            uri: std::env::var("MONGO_URI")
                .unwrap_or_else(|_| "mongodb://localhost:27017".to_string()),
            database: std::env::var("MONGO_DB").unwrap_or_else(|_| "quantfactor".to_string()),
        }
    }
}

/// Shared handle to the document store. Constructed once at startup and
/// passed by reference inside the application context.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    db: Database,
}

impl DocumentStore {
    pub async fn connect(config: &StoreConfig) -> Result<Self, FactorError> {
        let mut options = ClientOptions::parse(&config.uri).await?;
        options.connect_timeout = Some(Duration::from_secs(20));
        options.server_selection_timeout = Some(Duration::from_secs(30));
        let client = Client::with_options(options)?;
        Ok(DocumentStore {
            db: client.database(&config.database),
        })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn collection<T>(&self, name: &str) -> Collection<T> {
        self.db.collection(name)
    }

    pub async fn collection_exists(&self, name: &str) -> Result<bool, FactorError> {
        let names = self
            .db
            .list_collection_names(doc! { "name": name })
            .await?;
        Ok(!names.is_empty())
    }

    /// Create the secondary indexes the query surface depends on.
    /// Index creation is idempotent, so this runs on every startup.
    pub async fn ensure_indexes(&self) -> Result<(), FactorError> {
        let unique = IndexOptions::builder().unique(true).build();

        self.collection::<mongodb::bson::Document>("user_factors")
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "user_id": 1, "factor_name": 1 })
                    .options(unique.clone())
                    .build(),
                None,
            )
            .await?;
        self.collection::<mongodb::bson::Document>("user_factors")
            .create_index(
                IndexModel::builder().keys(doc! { "factor_name": 1 }).build(),
                None,
            )
            .await?;

        self.collection::<mongodb::bson::Document>("tasks")
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "task_id": 1 })
                    .options(unique.clone())
                    .build(),
                None,
            )
            .await?;
        self.collection::<mongodb::bson::Document>("tasks")
            .create_index(
                IndexModel::builder().keys(doc! { "factor_id": 1 }).build(),
                None,
            )
            .await?;

        self.collection::<mongodb::bson::Document>("factor_analysis_stage_logs")
            .create_index(
                IndexModel::builder().keys(doc! { "task_id": 1 }).build(),
                None,
            )
            .await?;

        self.collection::<mongodb::bson::Document>("factor_analysis_results")
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "task_id": 1 })
                    .options(unique.clone())
                    .build(),
                None,
            )
            .await?;

        for market in ["stock_market", "factor_base"] {
            self.collection::<mongodb::bson::Document>(market)
                .create_index(
                    IndexModel::builder()
                        .keys(doc! { "date": 1, "symbol": 1 })
                        .options(unique.clone())
                        .build(),
                    None,
                )
                .await?;
        }

        Ok(())
    }
}

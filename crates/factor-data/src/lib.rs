pub mod factors;
pub mod market;
pub mod repo;
pub mod store;

pub use factors::FactorSeriesLoader;
pub use market::{MarketDataReader, MarketQuery};
pub use repo::{FactorRepository, LogRepository, ResultRepository, TaskRepository};
pub use store::{DocumentStore, StoreConfig};

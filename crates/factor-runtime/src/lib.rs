pub mod context;
pub mod log_hub;
pub mod scheduler;

pub use context::AppContext;
pub use log_hub::{LogHub, LogSink, MongoLogSink, PendingLog};
pub use scheduler::{admit, new_task_id, JobScheduler, SchedulerConfig};

//! The asynchronous job runtime: admission, task creation, and staged
//! execution of factor evaluations on a bounded worker pool.

use std::collections::HashMap;
use std::sync::Arc;

use factor_analysis::{
    align, assign_groups, build_bundle, observations_from_points, trim_outliers, zscore,
    BundleInput,
};
use factor_core::{
    now_iso, FactorDefinition, FactorError, LogLevel, Stage, Task, TaskStatus,
};
use factor_data::{
    FactorRepository, FactorSeriesLoader, MarketQuery, ResultRepository, TaskRepository,
};
use mongodb::bson::doc;
use tokio::sync::Semaphore;

use crate::log_hub::LogHub;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of evaluation tasks running at once.
    pub max_concurrent_tasks: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            max_concurrent_tasks: 4,
        }
    }
}

/// Admission check: parameter enums and factor code. A factor that fails
/// here never produces a task record.
pub fn admit(definition: &FactorDefinition) -> Result<(), FactorError> {
    definition.params.validate()?;
    factor_expr::validate(&definition.code, definition.code_type)
}

/// UUID v4 with the separators stripped, the task-id shape of the store.
pub fn new_task_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Runs evaluations off the request path. Cloning shares the pool.
#[derive(Clone)]
pub struct JobScheduler {
    factors: FactorRepository,
    tasks: TaskRepository,
    results: ResultRepository,
    loader: FactorSeriesLoader,
    log_hub: Arc<LogHub>,
    semaphore: Arc<Semaphore>,
}

impl JobScheduler {
    pub fn new(
        factors: FactorRepository,
        tasks: TaskRepository,
        results: ResultRepository,
        loader: FactorSeriesLoader,
        log_hub: Arc<LogHub>,
        config: SchedulerConfig,
    ) -> Self {
        JobScheduler {
            factors,
            tasks,
            results,
            loader,
            log_hub,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1))),
        }
    }

    /// Validate, create the task record, flip the factor to running, and
    /// schedule execution. Returns the new task id immediately.
    pub async fn run_factor(&self, factor_id: &str) -> Result<String, FactorError> {
        let definition = self
            .factors
            .find_by_id(factor_id)
            .await?
            .ok_or_else(|| FactorError::DataAvailability(format!("factor {factor_id} not found")))?;

        admit(&definition)?;

        let task_id = new_task_id();
        let now = now_iso();
        let task = Task {
            id: None,
            task_id: task_id.clone(),
            factor_id: factor_id.to_string(),
            user_id: definition.user_id.clone(),
            factor_name: definition.factor_name.clone(),
            params: definition.params.clone(),
            status: TaskStatus::Running,
            process_status: 0,
            created_at: now.clone(),
            updated_at: now.clone(),
            start_time: now,
            end_time: None,
            error_message: None,
            last_log_message: None,
            last_log_time: None,
            last_log_level: None,
            current_stage: None,
        };
        self.tasks.insert(&task).await?;
        self.factors
            .set_fields(
                factor_id,
                doc! {
                    "status": "running",
                    "current_task_id": task_id.clone(),
                    "updated_at": now_iso(),
                },
            )
            .await?;

        tracing::info!(factor_id, task_id = %task_id, "scheduled factor evaluation");

        let scheduler = self.clone();
        let spawned_task_id = task_id.clone();
        tokio::spawn(async move {
            // The permit is acquired inside the spawned task so the request
            // path never blocks on a full pool.
            let Ok(_permit) = scheduler.semaphore.clone().acquire_owned().await else {
                return;
            };
            scheduler.execute_and_record(definition, spawned_task_id).await;
        });

        Ok(task_id)
    }

    async fn execute_and_record(&self, definition: FactorDefinition, task_id: String) {
        let factor_id = definition.factor_id();
        match self.execute(&definition, &task_id).await {
            Ok(()) => {
                tracing::info!(task_id = %task_id, "factor evaluation finished");
            }
            Err(err) => {
                tracing::error!(task_id = %task_id, error = %err, "factor evaluation failed");
                let mut details: HashMap<String, String> = HashMap::new();
                if let FactorError::Computation {
                    location: Some(location),
                    ..
                } = &err
                {
                    details.insert("line".to_string(), location.line.to_string());
                    details.insert("column".to_string(), location.column.to_string());
                    details.insert("context".to_string(), location.context.clone());
                }
                self.log_hub
                    .log(
                        &task_id,
                        &factor_id,
                        LogLevel::Error,
                        "error",
                        err.to_string(),
                        (!details.is_empty()).then_some(details),
                    )
                    .await;

                let now = now_iso();
                if let Err(write_err) = self
                    .tasks
                    .set_fields(
                        &task_id,
                        doc! {
                            "status": "failed",
                            "process_status": -1,
                            "error_message": err.to_string(),
                            "end_time": now.clone(),
                            "updated_at": now,
                        },
                    )
                    .await
                {
                    tracing::error!(task_id = %task_id, error = %write_err, "failed to mark task failed");
                }
                if let Err(write_err) = self
                    .factors
                    .set_fields(&factor_id, doc! { "status": "failed", "updated_at": now_iso() })
                    .await
                {
                    tracing::error!(factor_id = %factor_id, error = %write_err, "failed to mark factor failed");
                }
            }
        }
    }

    async fn advance(&self, task_id: &str, stage: Stage) -> Result<(), FactorError> {
        self.tasks
            .set_fields(
                task_id,
                doc! { "process_status": stage.as_i32(), "updated_at": now_iso() },
            )
            .await
    }

    async fn execute(
        &self,
        definition: &FactorDefinition,
        task_id: &str,
    ) -> Result<(), FactorError> {
        let factor_id = definition.factor_id();
        let params = &definition.params;
        let start = params.start_date_compact();
        let end = params.end_date_compact();

        self.advance(task_id, Stage::Started).await?;
        self.log_hub
            .log(
                task_id,
                &factor_id,
                LogLevel::Info,
                Stage::Started.label(),
                format!("evaluation started for {}", definition.factor_name),
                None,
            )
            .await;

        self.advance(task_id, Stage::LoadMarket).await?;
        let mut query = MarketQuery::range(&start, &end);
        query.pool = params.stock_pool.clone();
        query.include_st = params.include_st;
        query.fields = Some(vec!["open".to_string(), "close".to_string(), "name".to_string()]);
        let market = self.loader.market().load_market(&query).await?;
        if market.is_empty() {
            return Err(FactorError::DataAvailability(format!(
                "no market data between {start} and {end} for pool {}",
                params.stock_pool
            )));
        }
        self.log_hub
            .log(
                task_id,
                &factor_id,
                LogLevel::Info,
                Stage::LoadMarket.label(),
                format!("loaded {} market rows", market.len()),
                None,
            )
            .await;

        self.advance(task_id, Stage::LoadFactor).await?;
        let points = self
            .loader
            .load_custom_factor(definition, &start, &end)
            .await?;
        if points.is_empty() {
            return Err(FactorError::DataAvailability(
                "factor series is empty, check the factor definition and date range".to_string(),
            ));
        }
        self.log_hub
            .log(
                task_id,
                &factor_id,
                LogLevel::Info,
                Stage::LoadFactor.label(),
                format!("loaded {} factor rows", points.len()),
                None,
            )
            .await;

        self.advance(task_id, Stage::Preprocess).await?;
        let mut observations = observations_from_points(points);
        trim_outliers(&mut observations, params.extreme_value_processing);
        zscore(&mut observations);

        self.advance(task_id, Stage::ForwardReturns).await?;
        let aligned = align(&market, &observations, params.adjustment_cycle as usize);
        self.log_hub
            .log(
                task_id,
                &factor_id,
                LogLevel::Info,
                Stage::ForwardReturns.label(),
                format!("{} rows with a forward window", aligned.len()),
                None,
            )
            .await;

        self.advance(task_id, Stage::Grouping).await?;
        let (grouped, _benchmark) =
            assign_groups(&aligned, params.group_number, params.factor_direction);

        self.advance(task_id, Stage::Statistics).await?;
        let snapshot_symbols = latest_date_symbols(&observations);
        let symbol_names = if snapshot_symbols.is_empty() {
            HashMap::new()
        } else {
            self.loader
                .market()
                .symbol_names(&snapshot_symbols)
                .await
                .unwrap_or_default()
        };
        let bundle = build_bundle(BundleInput {
            task_id,
            factor_name: &definition.factor_name,
            params,
            cleaned_factor: &observations,
            aligned: &aligned,
            grouped: &grouped,
            symbol_names: &symbol_names,
        });

        // Bundle write is the commit point: the task only becomes
        // observable as succeeded after this insert lands.
        self.advance(task_id, Stage::Persist).await?;
        self.results.insert(&bundle).await?;

        self.advance(task_id, Stage::Finalized).await?;
        let now = now_iso();
        self.tasks
            .set_fields(
                task_id,
                doc! { "status": "succeeded", "end_time": now.clone(), "updated_at": now },
            )
            .await?;
        self.factors
            .set_fields(&factor_id, doc! { "status": "succeeded", "updated_at": now_iso() })
            .await?;
        self.log_hub
            .log(
                task_id,
                &factor_id,
                LogLevel::Info,
                Stage::Finalized.label(),
                "evaluation finished",
                None,
            )
            .await;
        Ok(())
    }
}

fn latest_date_symbols(observations: &[factor_analysis::FactorObservation]) -> Vec<String> {
    let Some(last_date) = observations.iter().map(|o| o.date).max() else {
        return Vec::new();
    };
    observations
        .iter()
        .filter(|o| o.date == last_date)
        .map(|o| o.symbol.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use factor_core::{CodeType, ExtremeValueMethod, FactorDirection, FactorStatus, Params};

    fn definition(cycle: u32, code: &str) -> FactorDefinition {
        FactorDefinition {
            id: None,
            user_id: "u1".to_string(),
            name: "Momentum".to_string(),
            factor_name: "momentum".to_string(),
            code: code.to_string(),
            code_type: CodeType::Formula,
            params: Params {
                start_date: "2024-01-02".to_string(),
                end_date: "2024-01-05".to_string(),
                adjustment_cycle: cycle,
                stock_pool: "000985".to_string(),
                factor_direction: FactorDirection::Positive,
                group_number: 2,
                include_st: true,
                extreme_value_processing: ExtremeValueMethod::Median,
            },
            status: FactorStatus::Idle,
            current_task_id: None,
            created_at: now_iso(),
            updated_at: now_iso(),
        }
    }

    #[test]
    fn admits_valid_factor() {
        assert!(admit(&definition(1, "CLOSE / OPEN - 1")).is_ok());
    }

    #[test]
    fn rejects_bad_cycle_before_task_creation() {
        let err = admit(&definition(7, "CLOSE / OPEN - 1")).unwrap_err();
        assert!(matches!(err, FactorError::Validation(_)));
    }

    #[test]
    fn rejects_invalid_code_before_task_creation() {
        let err = admit(&definition(1, "EVAL(close)")).unwrap_err();
        assert!(matches!(err, FactorError::Validation(_)));
    }

    #[test]
    fn task_ids_are_unique_and_dashless() {
        let a = new_task_id();
        let b = new_task_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert!(!a.contains('-'));
    }
}

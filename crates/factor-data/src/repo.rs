use factor_core::{FactorDefinition, FactorError, LogEntry, ResultBundle, Task};
use futures_util::stream::TryStreamExt;
use mongodb::bson::oid::ObjectId;
use mongodb::bson::{doc, Document};
use mongodb::options::FindOptions;
use mongodb::Collection;

use crate::store::DocumentStore;

pub fn parse_object_id(id: &str) -> Result<ObjectId, FactorError> {
    ObjectId::parse_str(id)
        .map_err(|_| FactorError::Validation(format!("invalid object id {id:?}")))
}

/// CRUD over the `user_factors` collection.
#[derive(Clone)]
pub struct FactorRepository {
    coll: Collection<FactorDefinition>,
}

impl FactorRepository {
    pub fn new(store: &DocumentStore) -> Self {
        FactorRepository {
            coll: store.collection("user_factors"),
        }
    }

    pub async fn insert(&self, definition: &FactorDefinition) -> Result<String, FactorError> {
        let result = self.coll.insert_one(definition, None).await?;
        Ok(result
            .inserted_id
            .as_object_id()
            .map(|id| id.to_hex())
            .unwrap_or_default())
    }

    pub async fn find_by_id(&self, factor_id: &str) -> Result<Option<FactorDefinition>, FactorError> {
        let id = parse_object_id(factor_id)?;
        Ok(self.coll.find_one(doc! { "_id": id }, None).await?)
    }

    /// Duplicate-name check, optionally excluding the factor being updated.
    pub async fn exists_by_name(
        &self,
        user_id: &str,
        factor_name: &str,
        exclude_id: Option<&str>,
    ) -> Result<bool, FactorError> {
        let mut filter = doc! { "user_id": user_id, "factor_name": factor_name };
        if let Some(exclude) = exclude_id {
            filter.insert("_id", doc! { "$ne": parse_object_id(exclude)? });
        }
        Ok(self.coll.find_one(filter, None).await?.is_some())
    }

    pub async fn replace(
        &self,
        factor_id: &str,
        definition: &FactorDefinition,
    ) -> Result<bool, FactorError> {
        let id = parse_object_id(factor_id)?;
        let result = self
            .coll
            .replace_one(doc! { "_id": id }, definition, None)
            .await?;
        Ok(result.matched_count > 0)
    }

    pub async fn delete(&self, factor_id: &str) -> Result<bool, FactorError> {
        let id = parse_object_id(factor_id)?;
        let result = self.coll.delete_one(doc! { "_id": id }, None).await?;
        Ok(result.deleted_count > 0)
    }

    pub async fn find_by_user(&self, user_id: &str) -> Result<Vec<FactorDefinition>, FactorError> {
        let cursor = self.coll.find(doc! { "user_id": user_id }, None).await?;
        Ok(cursor.try_collect().await?)
    }

    /// Per-field `$set`; runtime and flusher write disjoint fields so their
    /// updates commute.
    pub async fn set_fields(&self, factor_id: &str, fields: Document) -> Result<(), FactorError> {
        let id = parse_object_id(factor_id)?;
        self.coll
            .update_one(doc! { "_id": id }, doc! { "$set": fields }, None)
            .await?;
        Ok(())
    }
}

/// CRUD over the `tasks` collection.
#[derive(Clone)]
pub struct TaskRepository {
    coll: Collection<Task>,
}

impl TaskRepository {
    pub fn new(store: &DocumentStore) -> Self {
        TaskRepository {
            coll: store.collection("tasks"),
        }
    }

    pub async fn insert(&self, task: &Task) -> Result<(), FactorError> {
        self.coll.insert_one(task, None).await?;
        Ok(())
    }

    pub async fn find_by_task_id(&self, task_id: &str) -> Result<Option<Task>, FactorError> {
        Ok(self.coll.find_one(doc! { "task_id": task_id }, None).await?)
    }

    pub async fn set_fields(&self, task_id: &str, fields: Document) -> Result<(), FactorError> {
        self.coll
            .update_one(doc! { "task_id": task_id }, doc! { "$set": fields }, None)
            .await?;
        Ok(())
    }
}

/// Write-once result bundles keyed by `task_id`.
#[derive(Clone)]
pub struct ResultRepository {
    coll: Collection<ResultBundle>,
}

impl ResultRepository {
    pub fn new(store: &DocumentStore) -> Self {
        ResultRepository {
            coll: store.collection("factor_analysis_results"),
        }
    }

    pub async fn insert(&self, bundle: &ResultBundle) -> Result<(), FactorError> {
        self.coll.insert_one(bundle, None).await?;
        Ok(())
    }

    pub async fn find_by_task_id(&self, task_id: &str) -> Result<Option<ResultBundle>, FactorError> {
        Ok(self.coll.find_one(doc! { "task_id": task_id }, None).await?)
    }
}

/// Append-only stage logs with ordinal-based incremental tails.
#[derive(Clone)]
pub struct LogRepository {
    coll: Collection<LogEntry>,
}

impl LogRepository {
    pub fn new(store: &DocumentStore) -> Self {
        LogRepository {
            coll: store.collection("factor_analysis_stage_logs"),
        }
    }

    /// Append entries preserving slice order.
    pub async fn append(&self, entries: &[LogEntry]) -> Result<(), FactorError> {
        if entries.is_empty() {
            return Ok(());
        }
        self.coll.insert_many(entries, None).await?;
        Ok(())
    }

    /// Entries with storage ordinal strictly greater than `last_log_id`,
    /// insertion-ordered, plus the new maximum ordinal.
    pub async fn tail(
        &self,
        task_id: &str,
        last_log_id: Option<&str>,
    ) -> Result<(Vec<LogEntry>, Option<String>), FactorError> {
        let mut filter = doc! { "task_id": task_id };
        if let Some(last) = last_log_id {
            filter.insert("_id", doc! { "$gt": parse_object_id(last)? });
        }
        let options = FindOptions::builder().sort(doc! { "_id": 1 }).build();
        let cursor = self.coll.find(filter, options).await?;
        let entries: Vec<LogEntry> = cursor.try_collect().await?;
        let max_ordinal = entries.last().and_then(|e| e.id).map(|id| id.to_hex());
        Ok((entries, max_ordinal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_id_parsing_round_trips() {
        let id = ObjectId::new();
        assert_eq!(parse_object_id(&id.to_hex()).unwrap(), id);
    }

    #[test]
    fn malformed_object_id_is_a_validation_error() {
        let err = parse_object_id("not-an-id").unwrap_err();
        assert!(matches!(err, FactorError::Validation(_)));
    }
}

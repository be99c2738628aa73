//! Document store contract
//!
//! The persistence engine is an external collaborator reached through a few
//! keyed CRUD primitives. Documents are JSON objects with a string `_id`,
//! filters are top-level equality matches and patches are field-level merges.
//!
//! [`MemoryStore`] is an in-process implementation for tests and local runs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::ErrorKind;

/// A stored document
pub type Document = Map<String, Value>;

pub const ID_FIELD: &str = "_id";
pub const CREATED_AT_FIELD: &str = "createdAt";
pub const UPDATED_AT_FIELD: &str = "updatedAt";

/// Store-level faults
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store operation timed out: {0}")]
    Timeout(String),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable(_) => ErrorKind::Database,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::DuplicateKey(_) | Self::InvalidDocument(_) => ErrorKind::Validation,
        }
    }
}

/// Equality filter over top-level fields
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter(Map<String, Value>);

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    pub fn matches(&self, document: &Document) -> bool {
        self.0
            .iter()
            .all(|(field, expected)| document.get(field) == Some(expected))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, Value>> for Filter {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

/// Field-level `$set` merge
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch(Map<String, Value>);

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    /// Build a patch from a serializable struct; `null` fields are skipped
    pub fn from_serializable<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        match serde_json::to_value(value)? {
            Value::Object(fields) => Ok(Self(
                fields.into_iter().filter(|(_, v)| !v.is_null()).collect(),
            )),
            other => Err(serde::ser::Error::custom(format!(
                "patch must serialize to an object, got {other}"
            ))),
        }
    }

    pub fn apply(&self, document: &mut Document) {
        for (field, value) in &self.0 {
            if field != ID_FIELD {
                document.insert(field.clone(), value.clone());
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Options for [`DocumentStore::find`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FindOptions {
    /// Fields to keep; `_id` is always kept
    pub projection: Option<Vec<String>>,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
}

impl FindOptions {
    pub fn project(&self, document: Document) -> Document {
        match &self.projection {
            Some(fields) => document
                .into_iter()
                .filter(|(field, _)| field == ID_FIELD || fields.contains(field))
                .collect(),
            None => document,
        }
    }
}

/// Keyed CRUD primitives of the backing store
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn find_by_id(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>, StoreError>;

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError>;

    /// Insert a document, assigning `_id` when missing; returns the stored form
    async fn insert(&self, collection: &str, document: Document) -> Result<Document, StoreError>;

    async fn update_by_id(
        &self,
        collection: &str,
        id: &str,
        patch: &Patch,
    ) -> Result<Option<Document>, StoreError>;

    /// Atomically apply `patch` only if the document matches `condition`
    ///
    /// Returns `None` when the document is missing or the condition failed.
    async fn update_one_where(
        &self,
        collection: &str,
        id: &str,
        condition: &Filter,
        patch: &Patch,
    ) -> Result<Option<Document>, StoreError>;

    async fn delete_by_id(&self, collection: &str, id: &str) -> Result<bool, StoreError>;

    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError>;
}

fn timestamp() -> Value {
    Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn document_id(document: &Document) -> Option<&str> {
    document.get(ID_FIELD).and_then(Value::as_str)
}

/// In-process document store
///
/// Every operation takes one lock, so `update_one_where` is a true
/// compare-and-swap.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, Vec<Document>>>,
    unique_fields: HashMap<String, Vec<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject inserts that repeat `field` within `collection`
    pub fn with_unique_field(mut self, collection: &str, field: &str) -> Self {
        self.unique_fields
            .entry(collection.to_string())
            .or_default()
            .push(field.to_string());
        self
    }

    fn check_unique(
        &self,
        collection: &str,
        existing: &[Document],
        document: &Document,
    ) -> Result<(), StoreError> {
        let Some(fields) = self.unique_fields.get(collection) else {
            return Ok(());
        };
        for field in fields {
            let Some(value) = document.get(field) else {
                continue;
            };
            if existing.iter().any(|doc| doc.get(field) == Some(value)) {
                return Err(StoreError::DuplicateKey(format!("{collection}.{field}")));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find_by_id(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let collections = self.collections.lock().await;
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.iter().find(|doc| document_id(doc) == Some(id)))
            .cloned())
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>, StoreError> {
        let collections = self.collections.lock().await;
        let Some(docs) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        Ok(docs
            .iter()
            .filter(|doc| filter.matches(doc))
            .skip(options.skip.unwrap_or(0))
            .take(options.limit.unwrap_or(usize::MAX))
            .map(|doc| options.project(doc.clone()))
            .collect())
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        let collections = self.collections.lock().await;
        let matched = collections
            .get(collection)
            .map_or(0, |docs| docs.iter().filter(|doc| filter.matches(doc)).count());
        Ok(u64::try_from(matched).unwrap_or(u64::MAX))
    }

    async fn insert(
        &self,
        collection: &str,
        mut document: Document,
    ) -> Result<Document, StoreError> {
        let mut collections = self.collections.lock().await;
        let docs = collections.entry(collection.to_string()).or_default();

        let requested_id = match document.get(ID_FIELD) {
            None | Some(Value::Null) => None,
            Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
            Some(other) => {
                return Err(StoreError::InvalidDocument(format!(
                    "_id must be a non-empty string, got {other}"
                )));
            }
        };
        match requested_id {
            Some(id) => {
                if docs.iter().any(|doc| document_id(doc) == Some(id.as_str())) {
                    return Err(StoreError::DuplicateKey(format!("{collection}._id")));
                }
            }
            None => {
                document.insert(ID_FIELD.to_string(), Value::String(Uuid::new_v4().to_string()));
            }
        }
        self.check_unique(collection, docs, &document)?;

        let now = timestamp();
        document
            .entry(CREATED_AT_FIELD.to_string())
            .or_insert_with(|| now.clone());
        document.insert(UPDATED_AT_FIELD.to_string(), now);

        docs.push(document.clone());
        Ok(document)
    }

    async fn update_by_id(
        &self,
        collection: &str,
        id: &str,
        patch: &Patch,
    ) -> Result<Option<Document>, StoreError> {
        self.update_one_where(collection, id, &Filter::new(), patch)
            .await
    }

    async fn update_one_where(
        &self,
        collection: &str,
        id: &str,
        condition: &Filter,
        patch: &Patch,
    ) -> Result<Option<Document>, StoreError> {
        let mut collections = self.collections.lock().await;
        let Some(document) = collections.get_mut(collection).and_then(|docs| {
            docs.iter_mut()
                .find(|doc| document_id(doc) == Some(id) && condition.matches(doc))
        }) else {
            return Ok(None);
        };

        patch.apply(document);
        document.insert(UPDATED_AT_FIELD.to_string(), timestamp());
        Ok(Some(document.clone()))
    }

    async fn delete_by_id(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        let mut collections = self.collections.lock().await;
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(false);
        };
        let before = docs.len();
        docs.retain(|doc| document_id(doc) != Some(id));
        Ok(docs.len() < before)
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        let mut collections = self.collections.lock().await;
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = docs.len();
        docs.retain(|doc| !filter.matches(doc));
        Ok(u64::try_from(before - docs.len()).unwrap_or(u64::MAX))
    }
}

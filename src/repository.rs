//! Generic retrying CRUD over one collection
//!
//! Every store call runs under the [`RetryPolicy`] and answers with an
//! [`Outcome`]. Store faults become `DatabaseError`-class records before the
//! retry decision; a stored document that does not deserialize into `D` is a
//! `ValidationError` and is not retried.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{ErrorKind, ErrorRecord};
use crate::outcome::Outcome;
use crate::retry::RetryPolicy;
use crate::store::{Document, DocumentStore, Filter, FindOptions, Patch, StoreError};

pub struct Repository<D> {
    store: Arc<dyn DocumentStore>,
    collection: String,
    retry: RetryPolicy,
    _document: PhantomData<fn() -> D>,
}

impl<D> Clone for Repository<D> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            collection: self.collection.clone(),
            retry: self.retry,
            _document: PhantomData,
        }
    }
}

impl<D> fmt::Debug for Repository<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("collection", &self.collection)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

fn store_failure<T>(error: &StoreError) -> Outcome<T> {
    Outcome::failure(ErrorRecord::from_error(error.kind(), error))
}

impl<D> Repository<D>
where
    D: Serialize + DeserializeOwned + Send,
{
    pub fn new(
        store: Arc<dyn DocumentStore>,
        collection: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            collection: collection.into(),
            retry,
            _document: PhantomData,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn operation(&self, name: &str) -> String {
        format!("{}.{name}", self.collection)
    }

    fn decode(document: Document) -> Outcome<D> {
        match serde_json::from_value(Value::Object(document)) {
            Ok(value) => Outcome::Value(value),
            Err(e) => Outcome::failure(ErrorRecord::from_error(ErrorKind::Validation, &e)),
        }
    }

    fn decode_all(documents: Vec<Document>) -> Outcome<Vec<D>> {
        documents
            .into_iter()
            .map(|document| serde_json::from_value(Value::Object(document)))
            .collect::<Result<Vec<D>, _>>()
            .map_or_else(
                |e| Outcome::failure(ErrorRecord::from_error(ErrorKind::Validation, &e)),
                Outcome::Value,
            )
    }

    pub async fn get_by_id(&self, id: &str) -> Outcome<D> {
        let store = self.store.as_ref();
        let collection = self.collection.as_str();
        self.retry
            .run(&self.operation("get_by_id"), move || async move {
                match store.find_by_id(collection, id).await {
                    Ok(document) => Outcome::success(document),
                    Err(e) => store_failure(&e),
                }
            })
            .await
            .and_then(Self::decode)
    }

    /// Unique lookup: a value only when exactly one document matches
    pub async fn get_by_filter(&self, filter: &Filter, options: &FindOptions) -> Outcome<D> {
        let store = self.store.as_ref();
        let collection = self.collection.as_str();
        self.retry
            .run(&self.operation("get_by_filter"), move || async move {
                match store.find(collection, filter, options).await {
                    Ok(mut documents) if documents.len() == 1 => Outcome::success(documents.pop()),
                    Ok(_) => Outcome::Empty,
                    Err(e) => store_failure(&e),
                }
            })
            .await
            .and_then(Self::decode)
    }

    /// All matching documents; no match is `Empty`
    pub async fn get_all(&self, filter: &Filter, options: &FindOptions) -> Outcome<Vec<D>> {
        let store = self.store.as_ref();
        let collection = self.collection.as_str();
        self.retry
            .run(&self.operation("get_all"), move || async move {
                match store.find(collection, filter, options).await {
                    Ok(documents) if documents.is_empty() => Outcome::Empty,
                    Ok(documents) => Outcome::Value(documents),
                    Err(e) => store_failure(&e),
                }
            })
            .await
            .and_then(Self::decode_all)
    }

    /// Number of matching documents; zero is a value
    pub async fn count(&self, filter: &Filter) -> Outcome<u64> {
        let store = self.store.as_ref();
        let collection = self.collection.as_str();
        self.retry
            .run(&self.operation("count"), move || async move {
                match store.count(collection, filter).await {
                    Ok(total) => Outcome::Value(total),
                    Err(e) => store_failure(&e),
                }
            })
            .await
    }

    /// Insert `schema` and return the stored document
    pub async fn create<S: Serialize + ?Sized>(&self, schema: &S) -> Outcome<D> {
        let document = match serde_json::to_value(schema) {
            Ok(Value::Object(document)) => document,
            Ok(other) => {
                return Outcome::failure(ErrorRecord::new(
                    ErrorKind::Validation,
                    format!("{} schema must be an object, got {other}", self.collection),
                ))
            }
            Err(e) => return Outcome::failure(ErrorRecord::from_error(ErrorKind::Validation, &e)),
        };

        let store = self.store.as_ref();
        let collection = self.collection.as_str();
        let document = &document;
        self.retry
            .run(&self.operation("create"), move || async move {
                match store.insert(collection, document.clone()).await {
                    Ok(stored) => Outcome::Value(stored),
                    Err(e) => store_failure(&e),
                }
            })
            .await
            .and_then(Self::decode)
    }

    /// Merge `patch` into the document; `Empty` when the id is gone
    pub async fn update_by_id(&self, id: &str, patch: &Patch) -> Outcome<D> {
        let store = self.store.as_ref();
        let collection = self.collection.as_str();
        self.retry
            .run(&self.operation("update_by_id"), move || async move {
                match store.update_by_id(collection, id, patch).await {
                    Ok(document) => Outcome::success(document),
                    Err(e) => store_failure(&e),
                }
            })
            .await
            .and_then(Self::decode)
    }

    /// Compare-and-swap: merge `patch` only while `condition` holds
    ///
    /// `Empty` means the document is gone or no longer matches `condition`.
    pub async fn update_by_id_if(&self, id: &str, condition: &Filter, patch: &Patch) -> Outcome<D> {
        let store = self.store.as_ref();
        let collection = self.collection.as_str();
        self.retry
            .run(&self.operation("update_by_id_if"), move || async move {
                match store.update_one_where(collection, id, condition, patch).await {
                    Ok(document) => Outcome::success(document),
                    Err(e) => store_failure(&e),
                }
            })
            .await
            .and_then(Self::decode)
    }

    /// `Value(true)` when one document was removed, `Empty` when none was
    pub async fn delete_by_id(&self, id: &str) -> Outcome<bool> {
        let store = self.store.as_ref();
        let collection = self.collection.as_str();
        self.retry
            .run(&self.operation("delete_by_id"), move || async move {
                match store.delete_by_id(collection, id).await {
                    Ok(true) => Outcome::Value(true),
                    Ok(false) => Outcome::Empty,
                    Err(e) => store_failure(&e),
                }
            })
            .await
    }

    /// `Value(true)` when at least one document was removed
    pub async fn delete_many(&self, filter: &Filter) -> Outcome<bool> {
        let store = self.store.as_ref();
        let collection = self.collection.as_str();
        self.retry
            .run(&self.operation("delete_many"), move || async move {
                match store.delete_many(collection, filter).await {
                    Ok(0) => Outcome::Empty,
                    Ok(_) => Outcome::Value(true),
                    Err(e) => store_failure(&e),
                }
            })
            .await
    }
}

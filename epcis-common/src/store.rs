//! Record store interface.
//!
//! Collections are addressed by name and records are flat JSON objects, which is all
//! the pipelines need from the document store. `MemoryStore` backs unit tests and
//! dry runs; `crate::directus::DirectusStore` talks to the real thing.
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

use crate::dispatch::RecordId;

pub type Fields = serde_json::Map<String, Value>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("request to record store failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("record store responded with {status}: {body}")]
    Status { status: u16, body: String },
    #[error("could not decode record store response: {0}")]
    Decode(String),
    #[error("{collection}/{id} does not exist")]
    NotFound { collection: String, id: String },
    #[error("record store did not return an id for the new record")]
    MissingId,
    #[error("record store client could not be built: {0}")]
    Client(String),
    #[error("poisoned record store lock")]
    Poisoned,
}

/// A subset of the document store filter language.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    In(String, Vec<Value>),
    IsNull(String),
    NotNull(String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Filter::Eq(field.to_owned(), value.into())
    }

    pub fn is_in<V: Into<Value>>(field: &str, values: impl IntoIterator<Item = V>) -> Self {
        Filter::In(field.to_owned(), values.into_iter().map(Into::into).collect())
    }

    pub fn is_null(field: &str) -> Self {
        Filter::IsNull(field.to_owned())
    }

    pub fn not_null(field: &str) -> Self {
        Filter::NotNull(field.to_owned())
    }

    /// Render as the document store's JSON filter syntax.
    pub fn to_json(&self) -> Value {
        match self {
            Filter::Eq(field, value) => json!({ field: { "_eq": value } }),
            Filter::In(field, values) => json!({ field: { "_in": values } }),
            Filter::IsNull(field) => json!({ field: { "_null": true } }),
            Filter::NotNull(field) => json!({ field: { "_nnull": true } }),
            Filter::And(filters) => {
                json!({ "_and": filters.iter().map(Filter::to_json).collect::<Vec<_>>() })
            }
            Filter::Or(filters) => {
                json!({ "_or": filters.iter().map(Filter::to_json).collect::<Vec<_>>() })
            }
        }
    }

    /// Evaluate against a record the way the store would. Ids and numbers compare
    /// loosely, so `7` matches `"7"`.
    pub fn matches(&self, record: &Fields) -> bool {
        let field_value = |field: &str| record.get(field).filter(|v| !v.is_null());

        match self {
            Filter::Eq(field, expected) => {
                field_value(field).map_or(false, |actual| loosely_equal(actual, expected))
            }
            Filter::In(field, candidates) => field_value(field).map_or(false, |actual| {
                candidates
                    .iter()
                    .any(|expected| loosely_equal(actual, expected))
            }),
            Filter::IsNull(field) => field_value(field).is_none(),
            Filter::NotNull(field) => field_value(field).is_some(),
            Filter::And(filters) => filters.iter().all(|f| f.matches(record)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(record)),
        }
    }
}

fn loosely_equal(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    match (RecordId::from_value(actual), RecordId::from_value(expected)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filter: Option<Filter>,
    pub fields: Vec<String>,
    /// Sort keys, ascending unless prefixed with `-`. Missing values sort first.
    pub sort: Vec<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl Query {
    pub fn filter(filter: Filter) -> Self {
        Self {
            filter: Some(filter),
            ..Default::default()
        }
    }

    pub fn fields(mut self, fields: &[&str]) -> Self {
        self.fields = fields.iter().map(|f| (*f).to_owned()).collect();
        self
    }

    pub fn sort(mut self, keys: &[&str]) -> Self {
        self.sort = keys.iter().map(|k| (*k).to_owned()).collect();
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn query_records(&self, collection: &str, query: &Query)
        -> Result<Vec<Fields>, StoreError>;

    /// Create a record and return its new identity.
    async fn create_record(&self, collection: &str, fields: Fields)
        -> Result<RecordId, StoreError>;

    /// Patch the given fields of an existing record.
    async fn update_record(
        &self,
        collection: &str,
        id: &RecordId,
        fields: Fields,
    ) -> Result<(), StoreError>;

    /// Raw content of a stored file.
    async fn read_file(&self, file_id: &str) -> Result<Vec<u8>, StoreError>;
}

/// In-memory `DocumentStore`. Records get sequential numeric ids on creation.
/// Every query and update is logged so tests can assert on the work done.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    collections: HashMap<String, Vec<Fields>>,
    files: HashMap<String, Vec<u8>>,
    next_id: i64,
    queries: Vec<(String, Query)>,
    updates: Vec<(String, RecordId, Fields)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record as-is, keeping whatever id it carries.
    pub fn insert(&self, collection: &str, record: Value) {
        if let (Ok(mut state), Value::Object(fields)) = (self.state.lock(), record) {
            state
                .collections
                .entry(collection.to_owned())
                .or_default()
                .push(fields);
        }
    }

    pub fn insert_file(&self, file_id: &str, content: impl Into<Vec<u8>>) {
        if let Ok(mut state) = self.state.lock() {
            state.files.insert(file_id.to_owned(), content.into());
        }
    }

    pub fn records(&self, collection: &str) -> Vec<Fields> {
        self.state
            .lock()
            .map(|state| {
                state
                    .collections
                    .get(collection)
                    .cloned()
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    pub fn queries(&self, collection: &str) -> Vec<Query> {
        self.state
            .lock()
            .map(|state| {
                state
                    .queries
                    .iter()
                    .filter(|(c, _)| c == collection)
                    .map(|(_, q)| q.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn updates(&self, collection: &str) -> Vec<(RecordId, Fields)> {
        self.state
            .lock()
            .map(|state| {
                state
                    .updates
                    .iter()
                    .filter(|(c, _, _)| c == collection)
                    .map(|(_, id, fields)| (id.clone(), fields.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn query_records(
        &self,
        collection: &str,
        query: &Query,
    ) -> Result<Vec<Fields>, StoreError> {
        let mut state = self.state.lock().map_err(|_| StoreError::Poisoned)?;
        state.queries.push((collection.to_owned(), query.clone()));

        let mut matching: Vec<&Fields> = state
            .collections
            .get(collection)
            .map(|records| {
                records
                    .iter()
                    .filter(|record| query.filter.as_ref().map_or(true, |f| f.matches(record)))
                    .collect()
            })
            .unwrap_or_default();
        if !query.sort.is_empty() {
            matching.sort_by(|a, b| compare_records(a, b, &query.sort));
        }

        Ok(matching
            .into_iter()
            .skip(query.offset.unwrap_or(0))
            .take(query.limit.unwrap_or(usize::MAX))
            .map(|record| project(record, &query.fields))
            .collect())
    }

    async fn create_record(
        &self,
        collection: &str,
        mut fields: Fields,
    ) -> Result<RecordId, StoreError> {
        let mut state = self.state.lock().map_err(|_| StoreError::Poisoned)?;
        state.next_id += 1;
        let id = state.next_id;

        fields.insert("id".to_owned(), json!(id));
        state
            .collections
            .entry(collection.to_owned())
            .or_default()
            .push(fields);

        Ok(RecordId::from(id))
    }

    async fn update_record(
        &self,
        collection: &str,
        id: &RecordId,
        fields: Fields,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().map_err(|_| StoreError::Poisoned)?;

        let record = state
            .collections
            .get_mut(collection)
            .and_then(|records| {
                records.iter_mut().find(|record| {
                    record.get("id").and_then(RecordId::from_value).as_ref() == Some(id)
                })
            })
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_owned(),
                id: id.to_string(),
            })?;

        for (key, value) in fields.iter() {
            record.insert(key.clone(), value.clone());
        }
        state
            .updates
            .push((collection.to_owned(), id.clone(), fields));

        Ok(())
    }

    async fn read_file(&self, file_id: &str) -> Result<Vec<u8>, StoreError> {
        let state = self.state.lock().map_err(|_| StoreError::Poisoned)?;
        state
            .files
            .get(file_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                collection: "files".to_owned(),
                id: file_id.to_owned(),
            })
    }
}

fn compare_records(a: &Fields, b: &Fields, keys: &[String]) -> Ordering {
    keys.iter()
        .map(|key| match key.strip_prefix('-') {
            Some(field) => compare_values(b.get(field), a.get(field)),
            None => compare_values(a.get(key), b.get(key)),
        })
        .find(|ordering| ordering.is_ne())
        .unwrap_or(Ordering::Equal)
}

/// Nulls, then numbers, then strings. Timestamps are stored in one format, so they
/// order correctly as strings.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(value: Option<&Value>) -> u8 {
        match value {
            None | Some(Value::Null) => 0,
            Some(Value::Number(_)) => 1,
            Some(_) => 2,
        }
    }

    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

fn project(record: &Fields, fields: &[String]) -> Fields {
    if fields.is_empty() || fields.iter().any(|f| f == "*") {
        return record.clone();
    }
    record
        .iter()
        .filter(|(key, _)| fields.iter().any(|f| f == *key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_json() {
        let filter = Filter::And(vec![
            Filter::eq("status", "approved"),
            Filter::is_in("shipping_operation_id", ["1", "2"]),
            Filter::not_null("partner_transaction_id"),
            Filter::Or(vec![
                Filter::is_null("partner_status"),
                Filter::eq("partner_status", "pending"),
            ]),
        ]);

        assert_eq!(
            filter.to_json(),
            json!({"_and": [
                {"status": {"_eq": "approved"}},
                {"shipping_operation_id": {"_in": ["1", "2"]}},
                {"partner_transaction_id": {"_nnull": true}},
                {"_or": [
                    {"partner_status": {"_null": true}},
                    {"partner_status": {"_eq": "pending"}},
                ]},
            ]})
        );
    }

    #[test]
    fn test_filter_matches_loosely() {
        let record = match json!({"id": 7, "status": "Failed", "note": null}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };

        assert!(Filter::eq("id", "7").matches(&record));
        assert!(Filter::is_in("id", [json!("3"), json!(7)]).matches(&record));
        assert!(!Filter::eq("status", "failed").matches(&record));
        assert!(Filter::is_null("note").matches(&record));
        assert!(Filter::is_null("missing").matches(&record));
        assert!(!Filter::not_null("note").matches(&record));
    }

    #[tokio::test]
    async fn test_memory_store_sorts_and_pages() {
        let store = MemoryStore::new();
        store.insert("ledger", json!({"id": 1, "checked": "2024-03-02T00:00:00.000Z"}));
        store.insert("ledger", json!({"id": 2}));
        store.insert("ledger", json!({"id": 3, "checked": "2024-03-01T00:00:00.000Z"}));
        store.insert("ledger", json!({"id": 4, "checked": null}));

        let ids = |rows: Vec<Fields>| -> Vec<Value> {
            rows.into_iter().map(|row| row["id"].clone()).collect()
        };

        let sorted = store
            .query_records("ledger", &Query::default().sort(&["checked"]))
            .await
            .unwrap();
        assert_eq!(ids(sorted), vec![json!(2), json!(4), json!(3), json!(1)]);

        let newest_first = store
            .query_records("ledger", &Query::default().sort(&["-checked"]).limit(1))
            .await
            .unwrap();
        assert_eq!(ids(newest_first), vec![json!(1)]);

        let second_page = store
            .query_records("ledger", &Query::default().limit(2).offset(2))
            .await
            .unwrap();
        assert_eq!(ids(second_page), vec![json!(3), json!(4)]);
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        store.insert("ops", json!({"id": "a", "status": "approved", "x": 1}));
        store.insert("ops", json!({"id": "b", "status": "draft"}));

        let found = store
            .query_records(
                "ops",
                &Query::filter(Filter::eq("status", "approved")).fields(&["id"]),
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].get("id"), Some(&json!("a")));
        assert!(found[0].get("x").is_none());

        let id = store.create_record("ledger", Fields::new()).await.unwrap();
        assert_eq!(id, RecordId::from(1));

        let mut patch = Fields::new();
        patch.insert("status".to_owned(), json!("Failed"));
        store.update_record("ledger", &id, patch).await.unwrap();
        assert_eq!(store.records("ledger")[0].get("status"), Some(&json!("Failed")));
        assert_eq!(store.updates("ledger").len(), 1);

        let missing = store
            .update_record("ledger", &RecordId::from(99), Fields::new())
            .await;
        assert!(matches!(missing, Err(StoreError::NotFound { .. })));

        store.insert_file("f1", "<xml/>");
        assert_eq!(store.read_file("f1").await.unwrap(), b"<xml/>".to_vec());
        assert!(store.read_file("f2").await.is_err());
    }
}

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors for document-store operations.
#[derive(Debug, Error)]
pub enum StoreError {
	#[error("document not found: {collection}/{id}")]
	NotFound { collection: String, id: String },

	#[error("document already exists: {collection}/{id}")]
	AlreadyExists { collection: String, id: String },

	#[error("field {field} is not an array")]
	NotAnArray { field: String },

	#[error("field {field} is not a number")]
	NotANumber { field: String },

	#[error("serialization error: {0}")]
	Serialize(#[from] serde_json::Error),
}

impl From<StoreError> for wayfarer_domain::ChatError {
	fn from(e: StoreError) -> Self {
		use wayfarer_domain::ChatError;
		match e {
			StoreError::NotFound { collection, .. } => ChatError::NotFound(collection),
			StoreError::AlreadyExists { collection, id } => ChatError::Conflict(format!("{collection}/{id} already exists")),
			other => ChatError::Transport(format!("store error: {other}")),
		}
	}
}

/// A single mutation applied to a document.
///
/// All operations passed to one [`DocumentStore::update`] call take effect
/// atomically: a concurrent reader sees either none of them or all of them.
/// Field names use dotted paths (`member_meta.u42.role`).
#[derive(Debug, Clone)]
pub enum UpdateOp {
	Set { field: String, value: Value },
	Delete { field: String },
	ArrayUnion { field: String, value: Value },
	ArrayRemove { field: String, value: Value },
	Increment { field: String, by: i64 },
}

impl UpdateOp {
	pub fn set(field: impl Into<String>, value: Value) -> Self {
		UpdateOp::Set {
			field: field.into(),
			value,
		}
	}

	pub fn delete(field: impl Into<String>) -> Self {
		UpdateOp::Delete { field: field.into() }
	}

	pub fn array_union(field: impl Into<String>, value: Value) -> Self {
		UpdateOp::ArrayUnion {
			field: field.into(),
			value,
		}
	}

	pub fn array_remove(field: impl Into<String>, value: Value) -> Self {
		UpdateOp::ArrayRemove {
			field: field.into(),
			value,
		}
	}

	pub fn increment(field: impl Into<String>, by: i64) -> Self {
		UpdateOp::Increment { field: field.into(), by }
	}
}

/// Sort direction for [`Query::order_by`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
	Asc,
	Desc,
}

/// Query filter kinds.
#[derive(Debug, Clone)]
pub enum Filter {
	Eq { field: String, value: Value },
	ArrayContains { field: String, value: Value },
}

/// Query-by-field with order-by, offset and limit.
#[derive(Debug, Clone, Default)]
pub struct Query {
	pub filters: Vec<Filter>,
	pub order_by: Option<(String, Order)>,
	pub offset: usize,
	pub limit: Option<usize>,
}

impl Query {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn filter_eq(mut self, field: impl Into<String>, value: Value) -> Self {
		self.filters.push(Filter::Eq {
			field: field.into(),
			value,
		});
		self
	}

	pub fn filter_array_contains(mut self, field: impl Into<String>, value: Value) -> Self {
		self.filters.push(Filter::ArrayContains {
			field: field.into(),
			value,
		});
		self
	}

	pub fn order_by(mut self, field: impl Into<String>, order: Order) -> Self {
		self.order_by = Some((field.into(), order));
		self
	}

	pub fn offset(mut self, offset: usize) -> Self {
		self.offset = offset;
		self
	}

	pub fn limit(mut self, limit: usize) -> Self {
		self.limit = Some(limit);
		self
	}
}

/// Document create/read/update/query with the atomic-mutation semantics the
/// chat core's consistency model relies on.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync + 'static {
	/// Insert a new document; fails if it already exists.
	async fn create(&self, collection: &str, id: &str, doc: Value) -> Result<(), StoreError>;

	/// Fetch a document by id.
	async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError>;

	/// Apply `ops` to an existing document atomically.
	async fn update(&self, collection: &str, id: &str, ops: Vec<UpdateOp>) -> Result<(), StoreError>;

	/// Run a filtered, ordered, paged query. Returns `(id, document)` pairs.
	async fn query(&self, collection: &str, query: Query) -> Result<Vec<(String, Value)>, StoreError>;

	/// Count documents matching the query's filters (offset/limit ignored).
	async fn count(&self, collection: &str, query: Query) -> Result<usize, StoreError>;
}

/// In-memory reference backend.
///
/// A single write lock spans every `update` call, which is what makes the
/// multi-op atomicity guarantee hold.
#[derive(Default)]
pub struct MemStore {
	collections: RwLock<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn shared() -> Arc<Self> {
		Arc::new(Self::new())
	}
}

#[async_trait::async_trait]
impl DocumentStore for MemStore {
	async fn create(&self, collection: &str, id: &str, doc: Value) -> Result<(), StoreError> {
		let mut cols = self.collections.write().await;
		let col = cols.entry(collection.to_string()).or_default();
		if col.contains_key(id) {
			return Err(StoreError::AlreadyExists {
				collection: collection.to_string(),
				id: id.to_string(),
			});
		}
		col.insert(id.to_string(), doc);
		Ok(())
	}

	async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
		let cols = self.collections.read().await;
		Ok(cols.get(collection).and_then(|col| col.get(id)).cloned())
	}

	async fn update(&self, collection: &str, id: &str, ops: Vec<UpdateOp>) -> Result<(), StoreError> {
		let mut cols = self.collections.write().await;
		let doc = cols
			.get_mut(collection)
			.and_then(|col| col.get_mut(id))
			.ok_or_else(|| StoreError::NotFound {
				collection: collection.to_string(),
				id: id.to_string(),
			})?;

		for op in ops {
			apply_op(doc, op)?;
		}
		Ok(())
	}

	async fn query(&self, collection: &str, query: Query) -> Result<Vec<(String, Value)>, StoreError> {
		let cols = self.collections.read().await;
		let Some(col) = cols.get(collection) else {
			return Ok(Vec::new());
		};

		let mut hits: Vec<(String, Value)> = col
			.iter()
			.filter(|(_, doc)| matches_filters(doc, &query.filters))
			.map(|(id, doc)| (id.clone(), doc.clone()))
			.collect();

		if let Some((field, order)) = &query.order_by {
			hits.sort_by(|(_, a), (_, b)| {
				let ord = cmp_field(a, b, field);
				match order {
					Order::Asc => ord,
					Order::Desc => ord.reverse(),
				}
			});
		}

		let hits = hits
			.into_iter()
			.skip(query.offset)
			.take(query.limit.unwrap_or(usize::MAX))
			.collect();
		Ok(hits)
	}

	async fn count(&self, collection: &str, query: Query) -> Result<usize, StoreError> {
		let cols = self.collections.read().await;
		let Some(col) = cols.get(collection) else {
			return Ok(0);
		};
		Ok(col.values().filter(|doc| matches_filters(doc, &query.filters)).count())
	}
}

fn apply_op(doc: &mut Value, op: UpdateOp) -> Result<(), StoreError> {
	match op {
		UpdateOp::Set { field, value } => {
			*path_slot_mut(doc, &field) = value;
			Ok(())
		}
		UpdateOp::Delete { field } => {
			delete_path(doc, &field);
			Ok(())
		}
		UpdateOp::ArrayUnion { field, value } => {
			let slot = path_slot_mut(doc, &field);
			if slot.is_null() {
				*slot = Value::Array(Vec::new());
			}
			let Some(arr) = slot.as_array_mut() else {
				return Err(StoreError::NotAnArray { field });
			};
			if !arr.contains(&value) {
				arr.push(value);
			}
			Ok(())
		}
		UpdateOp::ArrayRemove { field, value } => {
			let slot = path_slot_mut(doc, &field);
			if slot.is_null() {
				return Ok(());
			}
			let Some(arr) = slot.as_array_mut() else {
				return Err(StoreError::NotAnArray { field });
			};
			arr.retain(|v| v != &value);
			Ok(())
		}
		UpdateOp::Increment { field, by } => {
			let slot = path_slot_mut(doc, &field);
			let current = match slot {
				Value::Null => 0,
				Value::Number(n) => n.as_i64().ok_or(StoreError::NotANumber { field: field.clone() })?,
				_ => return Err(StoreError::NotANumber { field }),
			};
			*slot = Value::from(current + by);
			Ok(())
		}
	}
}

/// Resolve a dotted path to a mutable slot, creating intermediate objects.
fn path_slot_mut<'a>(doc: &'a mut Value, field: &str) -> &'a mut Value {
	let mut current = doc;
	for part in field.split('.') {
		if !current.is_object() {
			*current = Value::Object(serde_json::Map::new());
		}
		current = current
			.as_object_mut()
			.expect("just coerced to object")
			.entry(part.to_string())
			.or_insert(Value::Null);
	}
	current
}

fn delete_path(doc: &mut Value, field: &str) {
	let Some((parent_path, leaf)) = field.rsplit_once('.') else {
		if let Some(map) = doc.as_object_mut() {
			map.remove(field);
		}
		return;
	};

	let mut current = doc;
	for part in parent_path.split('.') {
		match current.get_mut(part) {
			Some(next) => current = next,
			None => return,
		}
	}
	if let Some(map) = current.as_object_mut() {
		map.remove(leaf);
	}
}

fn path_get<'a>(doc: &'a Value, field: &str) -> Option<&'a Value> {
	let mut current = doc;
	for part in field.split('.') {
		current = current.get(part)?;
	}
	Some(current)
}

fn matches_filters(doc: &Value, filters: &[Filter]) -> bool {
	filters.iter().all(|f| match f {
		Filter::Eq { field, value } => path_get(doc, field) == Some(value),
		Filter::ArrayContains { field, value } => path_get(doc, field)
			.and_then(Value::as_array)
			.is_some_and(|arr| arr.contains(value)),
	})
}

fn cmp_field(a: &Value, b: &Value, field: &str) -> Ordering {
	let av = path_get(a, field);
	let bv = path_get(b, field);
	match (av, bv) {
		(Some(Value::Number(x)), Some(Value::Number(y))) => {
			let x = x.as_f64().unwrap_or(0.0);
			let y = y.as_f64().unwrap_or(0.0);
			x.partial_cmp(&y).unwrap_or(Ordering::Equal)
		}
		(Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
		(Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
		(Some(_), None) => Ordering::Greater,
		(None, Some(_)) => Ordering::Less,
		_ => Ordering::Equal,
	}
}

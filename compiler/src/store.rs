//! In-memory tables the plan executor runs against.
//!
//! Rows are JSON objects keyed by column name. Every table carries the
//! Trinity columns (`pk_<entity>`, `id`, `identifier`), the tenant column
//! when the entity is tenant scoped, and the audit columns.

use crate::ir::TableRef;
use crate::mutation::MutationResult;
use crate::plpgsql::UUID_PATTERN;
use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use specql_model::EntityCatalog;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use uuid::Uuid;

pub type Row = Map<String, Value>;

const AUDIT_COLUMNS: &[&str] = &[
    "created_at",
    "created_by",
    "updated_at",
    "updated_by",
    "deleted_at",
    "deleted_by",
];

fn looks_like_uuid(reference: &str) -> bool {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(&format!("(?i){}", UUID_PATTERN)).ok())
        .as_ref()
        .map_or(false, |re| re.is_match(reference))
}

pub fn now() -> Value {
    Value::String(Utc::now().to_rfc3339())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub pk_column: String,
    pub tenant_scoped: bool,
    /// Every column a fresh row carries, in declaration order.
    pub columns: Vec<String>,
    pub rows: BTreeMap<i64, Row>,
    next_pk: i64,
}

impl Table {
    fn for_ref(table: &TableRef, fields: Vec<String>) -> Self {
        let mut columns = vec![
            table.pk_column.clone(),
            "id".to_string(),
            "identifier".to_string(),
        ];
        if table.tenant_scoped {
            columns.push("tenant_id".to_string());
        }
        columns.extend(fields);
        columns.extend(AUDIT_COLUMNS.iter().map(|c| c.to_string()));
        Self {
            pk_column: table.pk_column.clone(),
            tenant_scoped: table.tenant_scoped,
            columns,
            rows: BTreeMap::new(),
            next_pk: 1,
        }
    }

    /// Row visible to a tenant's statements: same tenant, not deleted.
    pub fn is_active(&self, row: &Row, tenant_id: &Uuid) -> bool {
        let live = row.get("deleted_at").map_or(true, Value::is_null);
        live && (!self.tenant_scoped || tenant_matches(row, tenant_id))
    }
}

fn tenant_matches(row: &Row, tenant_id: &Uuid) -> bool {
    row.get("tenant_id")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
        .as_ref()
        == Some(tenant_id)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    pub function: String,
    pub result: MutationResult,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboxEvent {
    pub event: String,
    pub entity: String,
    pub entity_id: Value,
    pub tenant_id: Uuid,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshCall {
    pub function: String,
    pub pk: Value,
}

/// A whole database: tables plus the shared audit log, event outbox and
/// projection refresh log. Cloning takes a snapshot.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: BTreeMap<String, Table>,
    pub(crate) audit: Vec<AuditRecord>,
    pub(crate) outbox: Vec<OutboxEvent>,
    pub(crate) refreshes: Vec<RefreshCall>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store with one empty table per catalog entity.
    pub fn from_catalog(catalog: &EntityCatalog) -> Self {
        let mut store = Self::new();
        for entity in catalog.entities() {
            let table = TableRef::new(catalog, entity);
            let fields = entity.fields.iter().map(|f| f.column_name()).collect();
            store
                .tables
                .insert(table.qualified(), Table::for_ref(&table, fields));
        }
        store
    }

    pub fn table(&self, qualified: &str) -> Option<&Table> {
        self.tables.get(qualified)
    }

    fn table_mut(&mut self, table: &TableRef) -> &mut Table {
        self.tables
            .entry(table.qualified())
            .or_insert_with(|| Table::for_ref(table, Vec::new()))
    }

    /// Rows of a table in key order.
    pub fn rows(&self, qualified: &str) -> Vec<&Row> {
        self.tables
            .get(qualified)
            .map(|t| t.rows.values().collect())
            .unwrap_or_default()
    }

    pub fn row(&self, qualified: &str, pk: i64) -> Option<&Row> {
        self.tables.get(qualified).and_then(|t| t.rows.get(&pk))
    }

    pub fn find_by_id(&self, qualified: &str, id: &str) -> Option<&Row> {
        self.tables
            .get(qualified)?
            .rows
            .values()
            .find(|row| row.get("id").and_then(Value::as_str) == Some(id))
    }

    /// Active rows of `table` visible to `tenant_id`, in key order.
    pub fn active_rows(&self, table: &TableRef, tenant_id: &Uuid) -> Vec<(i64, &Row)> {
        let Some(t) = self.tables.get(&table.qualified()) else {
            return Vec::new();
        };
        t.rows
            .iter()
            .filter(|(_, row)| t.is_active(row, tenant_id))
            .map(|(pk, row)| (*pk, row))
            .collect()
    }

    /// Store a row, filling every missing column with NULL and assigning the
    /// next internal key.
    pub fn insert(&mut self, table: &TableRef, values: Row) -> Row {
        let t = self.table_mut(table);
        let pk = t.next_pk;
        t.next_pk += 1;
        let mut row = Row::new();
        for column in &t.columns {
            row.insert(column.clone(), Value::Null);
        }
        row.extend(values);
        row.insert(t.pk_column.clone(), Value::from(pk));
        t.rows.insert(pk, row.clone());
        row
    }

    /// Apply `changes` to one row and return the new row.
    pub fn update(&mut self, table: &TableRef, pk: i64, changes: Row) -> Option<Row> {
        let row = self.table_mut(table).rows.get_mut(&pk)?;
        row.extend(changes);
        Some(row.clone())
    }

    pub fn delete(&mut self, table: &TableRef, pk: i64) -> Option<Row> {
        self.table_mut(table).rows.remove(&pk)
    }

    /// Add a row the way a fixture would: `id`, `identifier`, tenant and
    /// creation columns are filled unless `values` provides them.
    pub fn seed(&mut self, table: &TableRef, tenant_id: Uuid, values: Value) -> Row {
        let mut row = match values {
            Value::Object(map) => map,
            _ => Row::new(),
        };
        let id = Uuid::new_v4().to_string();
        row.entry("id").or_insert_with(|| Value::String(id.clone()));
        let id = row.get("id").cloned().unwrap_or(Value::String(id));
        row.entry("identifier").or_insert(id);
        if table.tenant_scoped {
            row.entry("tenant_id")
                .or_insert_with(|| Value::String(tenant_id.to_string()));
        }
        row.entry("created_at").or_insert_with(now);
        self.insert(table, row)
    }

    /// `<entity>_pk`: an external UUID or identifier to the internal key of
    /// the lowest matching row, deleted or not.
    pub fn resolve_pk(&self, table: &TableRef, reference: &str, tenant_id: &Uuid) -> Option<i64> {
        let t = self.tables.get(&table.qualified())?;
        let by_id = looks_like_uuid(reference);
        let wanted_id = by_id
            .then(|| Uuid::parse_str(reference).ok())
            .flatten()
            .map(|u| u.to_string());
        t.rows
            .iter()
            .find(|(_, row)| {
                if t.tenant_scoped && !tenant_matches(row, tenant_id) {
                    return false;
                }
                if by_id {
                    row.get("id").and_then(Value::as_str).map(str::to_lowercase) == wanted_id
                } else {
                    row.get("identifier").and_then(Value::as_str) == Some(reference)
                }
            })
            .map(|(pk, _)| *pk)
    }

    /// `<entity>_id`
    pub fn id_of(&self, table: &TableRef, pk: i64) -> Value {
        self.row(&table.qualified(), pk)
            .and_then(|row| row.get("id").cloned())
            .unwrap_or(Value::Null)
    }

    /// `<entity>_identifier`
    pub fn identifier_of(&self, table: &TableRef, pk: i64) -> Value {
        self.row(&table.qualified(), pk)
            .and_then(|row| row.get("identifier").cloned())
            .unwrap_or(Value::Null)
    }

    /// Whether any row of `table`, in any tenant and deleted or not, holds
    /// `pk` in `column`.
    pub fn is_referenced(&self, table: &TableRef, column: &str, pk: i64) -> bool {
        self.tables.get(&table.qualified()).map_or(false, |t| {
            t.rows
                .values()
                .any(|row| row.get(column).and_then(Value::as_i64) == Some(pk))
        })
    }

    pub fn audit(&self) -> &[AuditRecord] {
        &self.audit
    }

    pub fn outbox(&self) -> &[OutboxEvent] {
        &self.outbox
    }

    pub fn refreshes(&self) -> &[RefreshCall] {
        &self.refreshes
    }
}

//! Plan executor: runs compiled plans against a [`MemoryStore`] with the
//! semantics of the generated PL/pgSQL. Used to test actions without a
//! database.

use crate::canonical_log::{CanonicalLog, LogLevel};
use crate::composite::CompositeType;
use crate::ir::{
    CompiledExpr, DeleteOp, EmitOp, InsertOp, InvokeOp, LoopOp, LoopSource, Op, Presence,
    RowSource, RowTarget, SqlType, TableRef, Termination, UpdateOp,
};
use crate::mutation::{MutationResult, MutationStatus};
use crate::orchestrator::ActionPlan;
use crate::store::{now, AuditRecord, MemoryStore, OutboxEvent, RefreshCall, Row};
use chrono::{DateTime, NaiveDate};
use regex::Regex;
use serde_json::{json, Map, Number, Value};
use specql_model::utils::slugify;
use specql_model::{ArithOp, CompareOp, ContextVar, ErrorMode, LogicalOp};
use std::cmp::Ordering;
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

/// Nested action calls deeper than this fail the call.
pub const MAX_CALL_DEPTH: usize = 16;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("no generated function named '{0}'")]
    UnknownFunction(String),

    #[error("invalid input for {function}: {message}")]
    InvalidPayload { function: String, message: String },
}

/// Caller identity passed to every generated function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallContext {
    pub tenant_id: Uuid,
    pub user_id: Uuid,
}

impl CallContext {
    pub fn new(tenant_id: Uuid, user_id: Uuid) -> Self {
        Self { tenant_id, user_id }
    }
}

/// Compiled plans indexed by every name they can be called by.
#[derive(Debug, Clone, Default)]
pub struct PlanSet {
    plans: Vec<ActionPlan>,
    by_name: HashMap<String, usize>,
    /// Rich-type guard patterns, compiled once.
    patterns: HashMap<String, Regex>,
}

impl PlanSet {
    pub fn new(plans: Vec<ActionPlan>) -> Self {
        let mut by_name = HashMap::new();
        for (i, plan) in plans.iter().enumerate() {
            by_name.insert(plan.app_function.clone(), i);
            by_name.insert(plan.core_function.clone(), i);
            by_name.entry(plan.action.clone()).or_insert(i);
            by_name.entry(plan.qualified_name()).or_insert(i);
        }
        let mut patterns = HashMap::new();
        for plan in &plans {
            for op in &plan.body {
                op.walk(&mut |op| {
                    for expr in op.expressions() {
                        expr.walk(&mut |e| {
                            if let CompiledExpr::Matches { pattern, .. } = e {
                                if !patterns.contains_key(pattern) {
                                    if let Ok(re) = Regex::new(pattern) {
                                        patterns.insert(pattern.clone(), re);
                                    }
                                }
                            }
                        });
                    }
                });
            }
        }
        Self {
            plans,
            by_name,
            patterns,
        }
    }

    fn pattern(&self, pattern: &str) -> Result<Regex, regex::Error> {
        match self.patterns.get(pattern) {
            Some(re) => Ok(re.clone()),
            None => Regex::new(pattern),
        }
    }

    /// Look up by app function, core function, `Entity.action` or bare action name.
    pub fn get(&self, name: &str) -> Option<&ActionPlan> {
        self.by_name.get(name).map(|&i| &self.plans[i])
    }

    pub fn plans(&self) -> &[ActionPlan] {
        &self.plans
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}

/// Why an action's block stopped early.
#[derive(Debug)]
enum Flow {
    /// A terminating status was set on the result and raised.
    Raise,
    /// Any other error; becomes `failed:unexpected_error`.
    Error(String),
}

type Exec<T> = Result<T, Flow>;

pub struct Vm<'p> {
    plans: &'p PlanSet,
}

impl<'p> Vm<'p> {
    pub fn new(plans: &'p PlanSet) -> Self {
        Self { plans }
    }

    /// Call a generated function the way the `app.` wrapper would.
    pub fn execute(
        &self,
        store: &mut MemoryStore,
        function: &str,
        ctx: CallContext,
        payload: Value,
    ) -> Result<MutationResult, VmError> {
        let plan = self
            .plans
            .get(function)
            .ok_or_else(|| VmError::UnknownFunction(function.to_string()))?;
        let mut log = CanonicalLog::new("execute_action");
        log.set("function", &plan.core_function);
        let result = self.run(store, plan, ctx, payload, 0)?;
        log.set("status", result.mutation_status.to_string())
            .set("updated_fields", &result.updated_fields);
        if result.mutation_status.is_failure() {
            log.set_level(LogLevel::Warn);
        }
        Ok(result)
    }

    fn run(
        &self,
        store: &mut MemoryStore,
        plan: &ActionPlan,
        ctx: CallContext,
        payload: Value,
        depth: usize,
    ) -> Result<MutationResult, VmError> {
        let payload = match payload {
            Value::Null => Map::new(),
            Value::Object(map) => map,
            other => {
                return Err(VmError::InvalidPayload {
                    function: plan.core_function.clone(),
                    message: format!("expected a JSON object, got {}", other),
                })
            }
        };
        let input = populate(&plan.input, &payload).map_err(|message| VmError::InvalidPayload {
            function: plan.core_function.clone(),
            message,
        })?;

        let mut frame = Frame::new(self, plan, ctx, input, payload, depth);
        let snapshot = store.clone();
        match frame.ops(store, &plan.body) {
            Ok(()) => {}
            Err(flow) => {
                *store = snapshot;
                if let Flow::Error(message) = flow {
                    tracing::warn!(function = %plan.core_function, "{} failed: {}", plan.core_function, message);
                    frame.result.status = Some(MutationStatus::failed("unexpected_error").to_string());
                    frame.result.message = Some(message);
                }
                frame.updated_fields.clear();
                frame.locals.insert("v_current".to_string(), Value::Null);
            }
        }
        let result = frame.finish();
        store.audit.push(AuditRecord {
            function: plan.core_function.clone(),
            result: result.clone(),
        });
        Ok(result)
    }
}

/// `jsonb_populate_record`: read each declared key from the payload and cast
/// it to the field's type. Unknown keys are ignored.
fn populate(input: &CompositeType, payload: &Map<String, Value>) -> Result<Map<String, Value>, String> {
    let mut out = Map::new();
    for field in &input.fields {
        let value = match payload.get(&field.name) {
            None | Some(Value::Null) => Value::Null,
            Some(Value::Array(_) | Value::Object(_)) if field.sql_type != SqlType::Jsonb => {
                return Err(format!("'{}' must be a {}", field.name, field.sql_type.as_sql()))
            }
            Some(value) => cast(value, field.sql_type)
                .map_err(|e| format!("'{}': {}", field.name, e))?,
        };
        out.insert(field.name.clone(), value);
    }
    Ok(out)
}

#[derive(Debug, Default)]
struct ResultState {
    status: Option<String>,
    message: Option<String>,
    entity_id: Value,
    metadata: Map<String, Value>,
}

struct Frame<'v, 'p> {
    vm: &'v Vm<'p>,
    plan: &'v ActionPlan,
    ctx: CallContext,
    input: Map<String, Value>,
    payload: Map<String, Value>,
    locals: HashMap<String, Value>,
    result: ResultState,
    updated_fields: Vec<String>,
    payload_before: Value,
    processed: i64,
    failed: i64,
    failed_items: Vec<Value>,
    truncated: bool,
    depth: usize,
}

impl<'v, 'p> Frame<'v, 'p> {
    fn new(
        vm: &'v Vm<'p>,
        plan: &'v ActionPlan,
        ctx: CallContext,
        input: Map<String, Value>,
        payload: Map<String, Value>,
        depth: usize,
    ) -> Self {
        let mut locals: HashMap<String, Value> = plan
            .locals
            .iter()
            .map(|l| (l.name.clone(), Value::Null))
            .collect();
        locals.insert("v_current".to_string(), Value::Null);
        locals.insert("v_pk".to_string(), Value::Null);
        Self {
            vm,
            plan,
            ctx,
            input,
            payload,
            locals,
            result: ResultState::default(),
            updated_fields: Vec::new(),
            payload_before: Value::Null,
            processed: 0,
            failed: 0,
            failed_items: Vec::new(),
            truncated: false,
            depth,
        }
    }

    fn local(&self, name: &str) -> &Value {
        self.locals.get(name).unwrap_or(&Value::Null)
    }

    fn set_local(&mut self, name: &str, value: Value) {
        self.locals.insert(name.to_string(), value);
    }

    fn tenant(&self) -> &Uuid {
        &self.ctx.tenant_id
    }

    fn terminate<T>(&mut self, t: &Termination) -> Exec<T> {
        self.result.status = Some(t.status.to_string());
        self.result.message = Some(t.message.clone());
        Err(Flow::Raise)
    }

    fn ops(&mut self, store: &mut MemoryStore, ops: &[Op]) -> Exec<()> {
        for op in ops {
            self.op(store, op)?;
        }
        Ok(())
    }

    fn op(&mut self, store: &mut MemoryStore, op: &Op) -> Exec<()> {
        tracing::debug!(function = %self.plan.core_function, op = op_kind(op), "execute op");
        match op {
            Op::Guard { condition, on_fail } => {
                if !is_true(&self.eval(store, condition, None)?) {
                    return self.terminate(on_fail);
                }
            }
            Op::Resolve {
                dest,
                table,
                value,
                optional,
                require_active,
                on_missing,
            } => {
                let value = self.eval(store, value, None)?;
                let Some(reference) = text_form(&value) else {
                    if *optional {
                        self.set_local(dest, Value::Null);
                        return Ok(());
                    }
                    return self.terminate(on_missing);
                };
                let pk = store
                    .resolve_pk(table, &reference, self.tenant())
                    .filter(|pk| !*require_active || !is_deleted(store, table, *pk));
                self.set_local(dest, pk.map_or(Value::Null, Value::from));
                if pk.is_none() {
                    return self.terminate(on_missing);
                }
            }
            Op::Load {
                table,
                pk,
                record,
                capture_before,
            } => {
                let row = self
                    .local(pk)
                    .as_i64()
                    .and_then(|pk| store.row(&table.qualified(), pk))
                    .cloned();
                if *capture_before {
                    self.payload_before = match &row {
                        Some(row) => Value::Object(without(row, &table.pk_column)),
                        None => Value::Null,
                    };
                }
                self.set_local(record, row.map_or(Value::Null, Value::Object));
            }
            Op::Insert(insert) => self.insert(store, insert)?,
            Op::Update(update) => self.update(store, update)?,
            Op::Delete(delete) => self.delete(store, delete)?,
            Op::Branch {
                condition,
                then_ops,
                else_ops,
            } => {
                if is_true(&self.eval(store, condition, None)?) {
                    self.ops(store, then_ops)?;
                } else {
                    self.ops(store, else_ops)?;
                }
            }
            Op::Loop(l) => self.run_loop(store, l)?,
            Op::Invoke(invoke) => self.invoke(store, invoke)?,
            Op::Emit(emit) => self.emit(store, emit),
            Op::Refresh { function, pk } => {
                let pk = match pk {
                    Some(pk) => self.eval(store, pk, None)?,
                    None => Value::Null,
                };
                store.refreshes.push(RefreshCall {
                    function: function.clone(),
                    pk,
                });
            }
        }
        Ok(())
    }

    fn matching_row(
        &self,
        store: &MemoryStore,
        table: &TableRef,
        columns: &[(String, CompiledExpr)],
    ) -> Exec<Option<Row>> {
        let mut wanted = Vec::with_capacity(columns.len());
        for (column, expr) in columns {
            wanted.push((column, self.eval(store, expr, None)?));
        }
        Ok(store
            .active_rows(table, self.tenant())
            .into_iter()
            .find(|(_, row)| {
                wanted.iter().all(|(column, value)| {
                    let current = row.get(column.as_str()).unwrap_or(&Value::Null);
                    compare(CompareOp::Eq, current, value) == Value::Bool(true)
                })
            })
            .map(|(_, row)| row.clone()))
    }

    fn insert(&mut self, store: &mut MemoryStore, insert: &InsertOp) -> Exec<()> {
        let table = &insert.table;
        let reused = match &insert.reuse {
            Some(lookup) => self.matching_row(store, table, lookup)?,
            None => None,
        };

        let row = match reused {
            Some(row) => row,
            None => {
                for check in &insert.unique {
                    if let Some(conflict) = self.matching_row(store, table, &check.columns)? {
                        let id = conflict.get("id").cloned().unwrap_or(Value::Null);
                        self.result.entity_id = id.clone();
                        self.result.metadata.insert(
                            "conflict".to_string(),
                            json!({
                                "constraint": check.constraint,
                                "id": id,
                                "identifier": conflict.get("identifier").cloned().unwrap_or(Value::Null),
                            }),
                        );
                        return self.terminate(&check.on_conflict);
                    }
                }

                let new_id = Uuid::new_v4().to_string();
                let identifier = match &insert.identifier {
                    Some(template) => {
                        let mut parts = Vec::new();
                        for part in &template.parts {
                            if let Some(text) = text_form(&self.eval(store, part, None)?) {
                                parts.push(slugify(&text));
                            }
                        }
                        let joined = parts.join(&template.separator);
                        if joined.is_empty() {
                            new_id.clone()
                        } else {
                            joined
                        }
                    }
                    None => new_id.clone(),
                };

                let mut values = Row::new();
                values.insert("id".into(), Value::String(new_id));
                values.insert("identifier".into(), Value::String(identifier));
                if table.tenant_scoped {
                    values.insert("tenant_id".into(), json!(self.ctx.tenant_id.to_string()));
                }
                values.insert("created_at".into(), now());
                values.insert("created_by".into(), json!(self.ctx.user_id.to_string()));
                for a in &insert.assignments {
                    let mut value = self.eval(store, &a.value, None)?;
                    if value.is_null() {
                        if let Some(default) = &a.default {
                            value = default.clone();
                        }
                    }
                    values.insert(a.column.clone(), value);
                }
                for (column, default) in &insert.defaults {
                    values.insert(column.clone(), default.clone());
                }
                let row = store.insert(table, values);
                if insert.primary {
                    let fields: Vec<String> =
                        insert.assignments.iter().map(|a| a.field.clone()).collect();
                    merge_fields(&mut self.updated_fields, &fields);
                }
                row
            }
        };

        let pk = row.get(&table.pk_column).cloned().unwrap_or(Value::Null);
        self.set_local(&insert.record, Value::Object(row));
        if insert.primary {
            if insert.record != "v_current" {
                let row = self.local(&insert.record).clone();
                self.set_local("v_current", row);
            }
            self.set_local("v_pk", pk);
        }
        Ok(())
    }

    fn row_key(&self, target: &RowTarget) -> Option<(Option<i64>, String)> {
        match target {
            RowTarget::Current => Some((self.local("v_pk").as_i64(), "v_current".to_string())),
            RowTarget::Pk { local, record } => Some((self.local(local).as_i64(), record.clone())),
            RowTarget::Filter(_) => None,
        }
    }

    fn present(&self, store: &MemoryStore, presence: &Presence) -> Exec<bool> {
        match presence.condition() {
            None => Ok(true),
            Some(condition) => Ok(is_true(&self.eval(store, &condition, None)?)),
        }
    }

    fn audit_columns(&self, changes: &mut Row, verb: &str) {
        changes.insert(format!("{}_at", verb), now());
        changes.insert(format!("{}_by", verb), json!(self.ctx.user_id.to_string()));
    }

    /// Active rows matching a set filter, in key order.
    fn filtered(
        &self,
        store: &MemoryStore,
        table: &TableRef,
        condition: &CompiledExpr,
    ) -> Exec<Vec<(i64, Row)>> {
        let mut out = Vec::new();
        for (pk, row) in store.active_rows(table, self.tenant()) {
            if is_true(&self.eval(store, condition, Some(row))?) {
                out.push((pk, row.clone()));
            }
        }
        Ok(out)
    }

    fn update(&mut self, store: &mut MemoryStore, update: &UpdateOp) -> Exec<()> {
        let table = &update.table;
        if let Some((key, record)) = self.row_key(&update.target) {
            let current = self.local(&record).clone();
            let mut changed = Vec::new();
            let mut changes = Row::new();
            for a in &update.assignments {
                if !self.present(store, &a.presence)? {
                    continue;
                }
                let value = self.eval(store, &a.value, None)?;
                let old = current.get(&a.column).unwrap_or(&Value::Null);
                if update.track_changes && !distinct(old, &value) {
                    continue;
                }
                changed.push(a.field.clone());
                changes.insert(a.column.clone(), value);
            }
            if changed.is_empty() {
                return Ok(());
            }
            self.audit_columns(&mut changes, "updated");
            let row = key.and_then(|pk| store.update(table, pk, changes));
            self.set_local(&record, row.map_or(Value::Null, Value::Object));
            if update.track_changes {
                merge_fields(&mut self.updated_fields, &changed);
            }
            return Ok(());
        }

        let RowTarget::Filter(condition) = &update.target else {
            return Ok(());
        };
        let mut pending = Vec::new();
        for (pk, row) in self.filtered(store, table, condition)? {
            let mut changes = Row::new();
            for a in &update.assignments {
                if self.present(store, &a.presence)? {
                    changes.insert(a.column.clone(), self.eval(store, &a.value, Some(&row))?);
                }
            }
            self.audit_columns(&mut changes, "updated");
            pending.push((pk, changes));
        }
        for (pk, changes) in pending {
            store.update(table, pk, changes);
        }
        Ok(())
    }

    fn delete(&mut self, store: &mut MemoryStore, delete: &DeleteOp) -> Exec<()> {
        let table = &delete.table;
        match (self.row_key(&delete.target), delete.hard) {
            (Some((key, record)), true) => {
                if let Some(pk) = key {
                    if delete
                        .dependents
                        .iter()
                        .any(|d| store.is_referenced(&d.table, &d.column, pk))
                    {
                        return self.terminate(&delete.on_dependents);
                    }
                    store.delete(table, pk);
                }
                self.set_local(&record, Value::Null);
            }
            (Some((key, record)), false) => {
                let mut changes = Row::new();
                self.audit_columns(&mut changes, "deleted");
                let row = key.and_then(|pk| store.update(table, pk, changes));
                self.set_local(&record, row.map_or(Value::Null, Value::Object));
            }
            (None, _) => {
                let RowTarget::Filter(condition) = &delete.target else {
                    return Ok(());
                };
                for (pk, _) in self.filtered(store, table, condition)? {
                    let mut changes = Row::new();
                    self.audit_columns(&mut changes, "deleted");
                    store.update(table, pk, changes);
                }
            }
        }
        Ok(())
    }

    fn loop_items(&self, store: &MemoryStore, source: &LoopSource) -> Exec<Vec<Value>> {
        let array = match source {
            LoopSource::InputArray { key } => self.input.get(key).cloned().unwrap_or(Value::Null),
            LoopSource::ItemArray { var, key } => {
                self.local(var).get(key).cloned().unwrap_or(Value::Null)
            }
            LoopSource::Rows { table, condition } => {
                let rows = match condition {
                    Some(c) => self.filtered(store, table, c)?,
                    None => store
                        .active_rows(table, self.tenant())
                        .into_iter()
                        .map(|(pk, row)| (pk, row.clone()))
                        .collect(),
                };
                return Ok(rows.into_iter().map(|(_, row)| Value::Object(row)).collect());
            }
        };
        match array {
            Value::Null => Ok(Vec::new()),
            Value::Array(items) => Ok(items),
            _ => Err(Flow::Error("cannot extract elements from a scalar".to_string())),
        }
    }

    fn run_loop(&mut self, store: &mut MemoryStore, l: &LoopOp) -> Exec<()> {
        let items = self.loop_items(store, &l.source)?;
        let by_row = matches!(l.source, LoopSource::Rows { .. });
        self.set_local(&l.index, json!(0));
        for (index, item) in items.into_iter().enumerate() {
            let identity = match item.get("id").and_then(text_form) {
                Some(id) => Value::String(id),
                None if by_row => Value::Null,
                None => Value::String(index.to_string()),
            };
            self.set_local(&l.var, item);
            match l.policy {
                Some(policy) if policy.mode == ErrorMode::ContinueOnError => {
                    let snapshot = store.clone();
                    let fields_before = self.updated_fields.clone();
                    let locals_before = self.locals.clone();
                    match self.ops(store, &l.body) {
                        Ok(()) => self.processed += 1,
                        Err(flow) => {
                            *store = snapshot;
                            self.updated_fields = fields_before;
                            self.locals = locals_before;
                            let (status, message) = match flow {
                                Flow::Raise => (
                                    self.result.status.clone().map_or(Value::Null, Value::String),
                                    self.result.message.clone().map_or(Value::Null, Value::String),
                                ),
                                Flow::Error(message) => (
                                    json!(MutationStatus::failed("unexpected_error").to_string()),
                                    Value::String(message),
                                ),
                            };
                            self.failed += 1;
                            if self.failed_items.len() < policy.max_errors {
                                self.failed_items.push(json!({
                                    "index": index,
                                    "id": identity,
                                    "status": status,
                                    "message": message,
                                }));
                            } else {
                                if !self.truncated {
                                    tracing::warn!(
                                        function = %self.plan.core_function,
                                        max_errors = policy.max_errors,
                                        "batch failure list truncated"
                                    );
                                }
                                self.truncated = true;
                            }
                            self.result = ResultState::default();
                        }
                    }
                }
                Some(_) => {
                    self.ops(store, &l.body)?;
                    self.processed += 1;
                }
                None => self.ops(store, &l.body)?,
            }
            self.set_local(&l.index, json!(index + 1));
        }
        Ok(())
    }

    fn invoke(&mut self, store: &mut MemoryStore, invoke: &InvokeOp) -> Exec<()> {
        let mut args = Map::new();
        for (name, expr) in &invoke.args {
            args.insert(name.clone(), self.eval(store, expr, None)?);
        }
        if self.depth + 1 > MAX_CALL_DEPTH {
            return Err(Flow::Error("stack depth limit exceeded".to_string()));
        }
        let vm = self.vm;
        let plan = vm
            .plans
            .get(&invoke.function)
            .ok_or_else(|| Flow::Error(format!("function {} does not exist", invoke.function)))?;
        let result = vm
            .run(store, plan, self.ctx, Value::Object(args), self.depth + 1)
            .map_err(|e| Flow::Error(e.to_string()))?;
        let failed = result.mutation_status.is_failure();
        let status = result.mutation_status.to_string();
        let message = result.message.clone();
        self.set_local(
            &invoke.record,
            serde_json::to_value(&result).map_err(|e| Flow::Error(e.to_string()))?,
        );
        if !failed {
            return Ok(());
        }
        let qualified = format!("{}.{}", invoke.entity, invoke.action);
        if invoke.non_fatal {
            tracing::info!(call = %qualified, status = %status, "non-fatal call failed");
            return Ok(());
        }
        self.result.metadata.insert(
            "failed_call".to_string(),
            json!({"action": qualified, "status": status, "message": message}),
        );
        self.result.status = Some(status);
        self.result.message = message;
        Err(Flow::Raise)
    }

    fn emit(&mut self, store: &mut MemoryStore, emit: &EmitOp) {
        let mut payload = Map::new();
        for (key, expr) in &emit.payload {
            match self.eval(store, expr, None) {
                Ok(value) => {
                    payload.insert(key.clone(), value);
                }
                Err(Flow::Error(message)) => {
                    tracing::warn!(event = %emit.event, "event not staged: {}", message);
                    return;
                }
                Err(Flow::Raise) => return,
            }
        }
        let entity_id = self.local("v_current").get("id").cloned().unwrap_or(Value::Null);
        store.outbox.push(OutboxEvent {
            event: emit.event.clone(),
            entity: emit.entity.clone(),
            entity_id,
            tenant_id: self.ctx.tenant_id,
            payload: Value::Object(payload),
        });
    }

    fn eval(&self, store: &MemoryStore, expr: &CompiledExpr, target: Option<&Row>) -> Exec<Value> {
        Ok(match expr {
            CompiledExpr::Literal(value) => value.clone(),
            CompiledExpr::Column { source, column, .. } => {
                let row = match source {
                    RowSource::Current => self.local("v_current"),
                    RowSource::Record(record) => self.local(record),
                    RowSource::Target => {
                        return Ok(target
                            .and_then(|row| row.get(column))
                            .cloned()
                            .unwrap_or(Value::Null))
                    }
                };
                row.get(column).cloned().unwrap_or(Value::Null)
            }
            CompiledExpr::Input { key, sql_type } => {
                let value = self.input.get(key).cloned().unwrap_or(Value::Null);
                let declared = self.plan.input.field(key).map(|f| f.sql_type);
                match sql_type {
                    Some(ty) if declared != Some(*ty) && !value.is_null() => {
                        cast(&value, *ty).map_err(Flow::Error)?
                    }
                    _ => value,
                }
            }
            CompiledExpr::Item { var, key, cast: ty } => {
                let item = self.local(var);
                let Some(key) = key else {
                    return Ok(item.clone());
                };
                let value = item.get(key).cloned().unwrap_or(Value::Null);
                match ty {
                    _ if value.is_null() => Value::Null,
                    Some(SqlType::Jsonb) => value,
                    Some(ty) => {
                        let text = text_form(&value).unwrap_or_default();
                        cast(&Value::String(text), *ty).map_err(Flow::Error)?
                    }
                    None => text_form(&value).map_or(Value::Null, Value::String),
                }
            }
            CompiledExpr::Local { name, .. } => self.local(name).clone(),
            CompiledExpr::Context(var) => match var {
                ContextVar::AuthUserId => json!(self.ctx.user_id.to_string()),
                ContextVar::AuthTenantId => json!(self.ctx.tenant_id.to_string()),
                ContextVar::EntityId => self
                    .local("v_current")
                    .get("id")
                    .cloned()
                    .unwrap_or(Value::Null),
                ContextVar::Now => now(),
            },
            CompiledExpr::CallField { record, field } => self
                .local(record)
                .get(field)
                .cloned()
                .unwrap_or(Value::Null),
            CompiledExpr::Present(presence) => Value::Bool(match presence {
                Presence::Always => true,
                Presence::InputKey(key) => self.payload.contains_key(key),
                Presence::ItemKey { var, key } => self
                    .local(var)
                    .as_object()
                    .map_or(false, |item| item.contains_key(key)),
            }),
            CompiledExpr::Compare { op, left, right } => {
                let left = self.eval(store, left, target)?;
                let right = self.eval(store, right, target)?;
                compare(*op, &left, &right)
            }
            CompiledExpr::Logical { op, operands } => {
                let mut saw_null = false;
                let decisive = *op == LogicalOp::Or;
                for operand in operands {
                    match self.eval(store, operand, target)? {
                        Value::Bool(b) if b == decisive => return Ok(Value::Bool(decisive)),
                        Value::Null => saw_null = true,
                        _ => {}
                    }
                }
                if saw_null {
                    Value::Null
                } else {
                    Value::Bool(!decisive)
                }
            }
            CompiledExpr::Not(inner) => match self.eval(store, inner, target)? {
                Value::Bool(b) => Value::Bool(!b),
                _ => Value::Null,
            },
            CompiledExpr::IsNull { expr, negated } => {
                Value::Bool(self.eval(store, expr, target)?.is_null() != *negated)
            }
            CompiledExpr::In {
                expr,
                list,
                negated,
            } => {
                let value = self.eval(store, expr, target)?;
                if value.is_null() {
                    return Ok(Value::Null);
                }
                let mut saw_null = false;
                let mut found = false;
                for item in list {
                    match compare(CompareOp::Eq, &value, &self.eval(store, item, target)?) {
                        Value::Bool(true) => {
                            found = true;
                            break;
                        }
                        Value::Null => saw_null = true,
                        _ => {}
                    }
                }
                if found {
                    Value::Bool(!*negated)
                } else if saw_null {
                    Value::Null
                } else {
                    Value::Bool(*negated)
                }
            }
            CompiledExpr::Arith { op, left, right } => {
                let left = self.eval(store, left, target)?;
                let right = self.eval(store, right, target)?;
                arith(*op, &left, &right).map_err(Flow::Error)?
            }
            CompiledExpr::Matches { expr, pattern } => {
                let value = self.eval(store, expr, target)?;
                match text_form(&value) {
                    None => Value::Null,
                    Some(text) => {
                        let re = self
                            .vm
                            .plans
                            .pattern(pattern)
                            .map_err(|e| Flow::Error(e.to_string()))?;
                        Value::Bool(re.is_match(&text))
                    }
                }
            }
            CompiledExpr::Exists {
                table,
                condition,
                negated,
            } => {
                let found = self.count(store, table, condition.as_deref())? > 0;
                Value::Bool(found != *negated)
            }
            CompiledExpr::Count { table, condition } => {
                json!(self.count(store, table, condition.as_deref())?)
            }
            CompiledExpr::ResolvePk { table, value } => {
                match text_form(&self.eval(store, value, target)?) {
                    None => Value::Null,
                    Some(reference) => store
                        .resolve_pk(table, &reference, self.tenant())
                        .map_or(Value::Null, Value::from),
                }
            }
            CompiledExpr::IdOf { table, pk } => match self.eval(store, pk, target)?.as_i64() {
                None => Value::Null,
                Some(pk) => store.id_of(table, pk),
            },
        })
    }

    fn count(
        &self,
        store: &MemoryStore,
        table: &TableRef,
        condition: Option<&CompiledExpr>,
    ) -> Exec<i64> {
        let mut n = 0;
        for (_, row) in store.active_rows(table, self.tenant()) {
            let hit = match condition {
                Some(c) => is_true(&self.eval(store, c, Some(row))?),
                None => true,
            };
            if hit {
                n += 1;
            }
        }
        Ok(n)
    }

    fn finish(self) -> MutationResult {
        let plan = self.plan;
        let mut result = self.result;
        if result.status.is_none() {
            if plan.batch.is_some() && self.failed > 0 {
                result.status = Some(MutationStatus::Partial("items_failed".into()).to_string());
                result.message = Some(format!(
                    "{} of {} items failed",
                    self.failed,
                    self.processed + self.failed
                ));
            } else {
                result.status = Some(MutationStatus::Success.to_string());
                result.message = Some(plan.success_message.clone());
            }
        }

        let current = self.locals.get("v_current").cloned().unwrap_or(Value::Null);
        let entity_id = [
            &result.entity_id,
            current.get("id").unwrap_or(&Value::Null),
            self.payload_before.get("id").unwrap_or(&Value::Null),
        ]
        .into_iter()
        .find_map(|v| v.as_str().and_then(|s| Uuid::parse_str(s).ok()));

        let payload_after = match &current {
            Value::Object(row) if !row.get(&plan.table.pk_column).map_or(true, Value::is_null) => {
                Some(Value::Object(without(row, &plan.table.pk_column)))
            }
            _ => None,
        };

        let mut metadata = result.metadata;
        metadata.insert("_meta".to_string(), plan.impact.to_meta());
        if plan.batch.is_some() {
            metadata.insert("processed_count".to_string(), json!(self.processed));
            metadata.insert("failed_count".to_string(), json!(self.failed));
            metadata.insert("failed_items".to_string(), Value::Array(self.failed_items));
            metadata.insert("errors_truncated".to_string(), json!(self.truncated));
        }

        let status = result
            .status
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| MutationStatus::failed("unexpected_error"));

        MutationResult {
            tenant_id: self.ctx.tenant_id,
            user_id: self.ctx.user_id,
            entity_name: plan.entity.clone(),
            entity_id,
            mutation_type: plan.mutation_type().to_string(),
            mutation_status: status,
            updated_fields: self.updated_fields,
            message: result.message,
            payload_before: Some(self.payload_before).filter(|v| !v.is_null()),
            payload_after,
            metadata,
        }
    }
}

fn op_kind(op: &Op) -> &'static str {
    match op {
        Op::Guard { .. } => "guard",
        Op::Resolve { .. } => "resolve",
        Op::Load { .. } => "load",
        Op::Insert(_) => "insert",
        Op::Update(_) => "update",
        Op::Delete(_) => "delete",
        Op::Branch { .. } => "branch",
        Op::Loop(_) => "loop",
        Op::Invoke(_) => "invoke",
        Op::Emit(_) => "emit",
        Op::Refresh { .. } => "refresh",
    }
}

fn is_true(value: &Value) -> bool {
    matches!(value, Value::Bool(true))
}

fn is_deleted(store: &MemoryStore, table: &TableRef, pk: i64) -> bool {
    store
        .row(&table.qualified(), pk)
        .and_then(|row| row.get("deleted_at"))
        .map_or(false, |v| !v.is_null())
}

fn without(row: &Row, column: &str) -> Row {
    let mut out = row.clone();
    out.remove(column);
    out
}

/// `app.merge_fields`: append fields not already listed, keeping order.
fn merge_fields(existing: &mut Vec<String>, new: &[String]) {
    for field in new {
        if !existing.contains(field) {
            existing.push(field.clone());
        }
    }
}

/// `::text` of a value; `None` for NULL.
fn text_form(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

/// `value::<ty>`.
fn cast(value: &Value, ty: SqlType) -> Result<Value, String> {
    let invalid = || format!("invalid input syntax for type {}: {}", ty.as_sql(), value);
    let text = text_form(value).ok_or_else(invalid)?;
    Ok(match ty {
        SqlType::Text => Value::String(text),
        SqlType::Jsonb => value.clone(),
        SqlType::Integer => match value {
            Value::Number(n) if n.is_i64() => value.clone(),
            Value::Number(n) => json!(n.as_f64().map(f64::round).ok_or_else(invalid)? as i64),
            Value::String(s) => json!(s.trim().parse::<i64>().map_err(|_| invalid())?),
            _ => return Err(invalid()),
        },
        SqlType::Numeric => match value {
            Value::Number(_) => value.clone(),
            Value::String(s) => {
                let s = s.trim();
                match s.parse::<i64>() {
                    Ok(i) => json!(i),
                    Err(_) => s
                        .parse::<f64>()
                        .ok()
                        .and_then(Number::from_f64)
                        .map(Value::Number)
                        .ok_or_else(invalid)?,
                }
            }
            _ => return Err(invalid()),
        },
        SqlType::Boolean => match value {
            Value::Bool(_) => value.clone(),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "t" | "true" | "y" | "yes" | "on" | "1" => Value::Bool(true),
                "f" | "false" | "n" | "no" | "off" | "0" => Value::Bool(false),
                _ => return Err(invalid()),
            },
            _ => return Err(invalid()),
        },
        SqlType::Uuid => Value::String(
            Uuid::parse_str(text.trim())
                .map_err(|_| invalid())?
                .to_string(),
        ),
        SqlType::Date => {
            NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d").map_err(|_| invalid())?;
            Value::String(text)
        }
        SqlType::Timestamptz => {
            DateTime::parse_from_rfc3339(text.trim()).map_err(|_| invalid())?;
            Value::String(text)
        }
    })
}

fn sql_order(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::Number(a), Value::String(s)) => match s.trim().parse::<f64>() {
            Ok(b) => a.as_f64()?.partial_cmp(&b),
            Err(_) => Some(a.to_string().as_str().cmp(s.as_str())),
        },
        (Value::String(_), Value::Number(_)) => sql_order(right, left).map(Ordering::reverse),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (a, b) if a == b => Some(Ordering::Equal),
        _ => None,
    }
}

/// SQL comparison: NULL when either side is NULL.
fn compare(op: CompareOp, left: &Value, right: &Value) -> Value {
    if left.is_null() || right.is_null() {
        return Value::Null;
    }
    let Some(ordering) = sql_order(left, right) else {
        return Value::Bool(op == CompareOp::Ne);
    };
    Value::Bool(match op {
        CompareOp::Eq => ordering == Ordering::Equal,
        CompareOp::Ne => ordering != Ordering::Equal,
        CompareOp::Lt => ordering == Ordering::Less,
        CompareOp::Le => ordering != Ordering::Greater,
        CompareOp::Gt => ordering == Ordering::Greater,
        CompareOp::Ge => ordering != Ordering::Less,
    })
}

/// `IS DISTINCT FROM`
fn distinct(left: &Value, right: &Value) -> bool {
    match (left.is_null(), right.is_null()) {
        (true, true) => false,
        (true, false) | (false, true) => true,
        _ => compare(CompareOp::Eq, left, right) != Value::Bool(true),
    }
}

fn number(value: &Value) -> Option<Value> {
    match value {
        Value::Number(_) => Some(value.clone()),
        Value::String(s) => cast(value, SqlType::Numeric).ok().filter(|_| !s.is_empty()),
        _ => None,
    }
}

fn arith(op: ArithOp, left: &Value, right: &Value) -> Result<Value, String> {
    if left.is_null() || right.is_null() {
        return Ok(Value::Null);
    }
    let (Some(a), Some(b)) = (number(left), number(right)) else {
        return Err(format!(
            "operator does not exist: {} {} {}",
            left,
            op.symbol(),
            right
        ));
    };
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        let value = match op {
            ArithOp::Add => x.checked_add(y),
            ArithOp::Sub => x.checked_sub(y),
            ArithOp::Mul => x.checked_mul(y),
            ArithOp::Div if y == 0 => return Err("division by zero".to_string()),
            ArithOp::Div => x.checked_div(y),
        };
        return value
            .map(Value::from)
            .ok_or_else(|| "integer out of range".to_string());
    }
    let (x, y) = (
        a.as_f64().unwrap_or_default(),
        b.as_f64().unwrap_or_default(),
    );
    let value = match op {
        ArithOp::Add => x + y,
        ArithOp::Sub => x - y,
        ArithOp::Mul => x * y,
        ArithOp::Div if y == 0.0 => return Err("division by zero".to_string()),
        ArithOp::Div => x / y,
    };
    Number::from_f64(value)
        .map(Value::Number)
        .ok_or_else(|| "numeric value out of range".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_three_valued_comparison() {
        assert_eq!(compare(CompareOp::Eq, &json!(1), &json!(1.0)), json!(true));
        assert_eq!(compare(CompareOp::Eq, &json!(5), &json!("5")), json!(true));
        assert_eq!(compare(CompareOp::Lt, &json!("a"), &json!("b")), json!(true));
        assert_eq!(compare(CompareOp::Eq, &Value::Null, &json!(1)), Value::Null);
        assert!(!distinct(&Value::Null, &Value::Null));
        assert!(distinct(&Value::Null, &json!("x")));
        assert!(!distinct(&json!(2), &json!(2.0)));
    }

    #[test]
    fn test_integer_arithmetic_truncates() {
        assert_eq!(arith(ArithOp::Div, &json!(7), &json!(2)), Ok(json!(3)));
        assert_eq!(arith(ArithOp::Mul, &json!(2), &json!(1.5)), Ok(json!(3.0)));
        assert_eq!(arith(ArithOp::Add, &Value::Null, &json!(1)), Ok(Value::Null));
        assert!(arith(ArithOp::Div, &json!(1), &json!(0)).is_err());
    }

    #[test]
    fn test_casts() {
        assert_eq!(cast(&json!("42"), SqlType::Integer), Ok(json!(42)));
        assert_eq!(cast(&json!("2.5"), SqlType::Numeric), Ok(json!(2.5)));
        assert_eq!(cast(&json!("yes"), SqlType::Boolean), Ok(json!(true)));
        assert_eq!(cast(&json!(7), SqlType::Text), Ok(json!("7")));
        assert!(cast(&json!("soon"), SqlType::Date).is_err());
        assert!(cast(&json!("abc"), SqlType::Integer).is_err());
        let id = "A0EEBC99-9C0B-4EF8-BB6D-6BB9BD380A11";
        assert_eq!(
            cast(&json!(id), SqlType::Uuid),
            Ok(json!(id.to_lowercase()))
        );
    }

    #[test]
    fn test_plan_set_compiles_guard_patterns_once() {
        let doc = specql_model::parse::parse_spec_content(
            r#"{"entities": [{"name": "Contact", "schema": "crm",
                "fields": [{"name": "email", "type": "email"}, {"name": "site", "type": "url"}],
                "actions": [
                    {"name": "create_contact", "steps": [{"type": "insert", "entity": "Contact",
                        "values": {"email": "$input.email", "site": "$input.site"}}]},
                    {"name": "update_contact", "steps": [{"type": "update",
                        "set": {"email": "$input.email"}}]}
                ]}]}"#,
        )
        .unwrap();
        let catalog = specql_model::EntityCatalog::new(doc).unwrap();
        let plans = crate::FunctionGenerator::new(&catalog)
            .generate()
            .unwrap()
            .plan_set();
        assert_eq!(plans.patterns.len(), 2);
        for pattern in plans.patterns.keys() {
            assert_eq!(plans.pattern(pattern).unwrap().as_str(), pattern);
        }
    }

    #[test]
    fn test_merge_fields_keeps_order() {
        let mut fields = vec!["email".to_string()];
        merge_fields(&mut fields, &["status".to_string(), "email".to_string()]);
        assert_eq!(fields, vec!["email", "status"]);
    }
}

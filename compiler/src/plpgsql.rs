//! PL/pgSQL rendering of compiled plans. This is the only place that
//! produces SQL text.

use crate::composite::{CompositeType, OUTPUT_TYPE};
use crate::ir::{
    Assignment, CompiledExpr, DeleteOp, EmitOp, InsertOp, InvokeOp, LocalType, LoopOp,
    LoopSource, Op, Presence, RowSource, RowTarget, SqlType, TableRef, Termination, UpdateOp,
};
use crate::orchestrator::ActionPlan;
use crate::trinity::TrinityHelpers;
use serde_json::Value;
use specql_model::{ContextVar, ErrorMode};
use std::fmt::Write as _;

/// SQLSTATE raised by a terminating status; caught by the action's own block.
pub const TERMINATE_SQLSTATE: &str = "SQ001";

/// Case-insensitive match for an external UUID, used by the `_pk` helpers.
pub const UUID_PATTERN: &str =
    "^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$";

pub fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

pub fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote(s),
        other => format!("{}::jsonb", quote(&other.to_string())),
    }
}

fn text_array(items: &[String]) -> String {
    let quoted: Vec<String> = items.iter().map(|s| quote(s)).collect();
    format!("ARRAY[{}]::TEXT[]", quoted.join(", "))
}

/// Rows of `table` a statement may see: this tenant's, not deleted.
fn active_scope(table: &TableRef) -> String {
    if table.tenant_scoped {
        "tenant_id = auth_tenant_id AND deleted_at IS NULL".to_string()
    } else {
        "deleted_at IS NULL".to_string()
    }
}

struct Writer {
    out: String,
    depth: usize,
}

impl Writer {
    fn new(depth: usize) -> Self {
        Self {
            out: String::new(),
            depth,
        }
    }

    fn line(&mut self, text: impl AsRef<str>) {
        for _ in 0..self.depth {
            self.out.push_str("    ");
        }
        self.out.push_str(text.as_ref());
        self.out.push('\n');
    }
}

/// Renders expressions against one action's input record.
pub struct ExprRenderer<'a> {
    input: &'a CompositeType,
}

impl<'a> ExprRenderer<'a> {
    pub fn new(input: &'a CompositeType) -> Self {
        Self { input }
    }

    pub fn render(&self, expr: &CompiledExpr) -> String {
        match expr {
            CompiledExpr::Literal(value) => literal(value),
            CompiledExpr::Column { source, column, .. } => match source {
                RowSource::Current => format!("v_current.{}", column),
                RowSource::Target => column.clone(),
                RowSource::Record(record) => format!("{}.{}", record, column),
            },
            CompiledExpr::Input { key, sql_type } => {
                let declared = self.input.field(key).map(|f| f.sql_type);
                match sql_type {
                    Some(ty) if declared != Some(*ty) => {
                        format!("(input_data.{})::{}", key, ty.as_sql())
                    }
                    _ => format!("input_data.{}", key),
                }
            }
            CompiledExpr::Item { var, key, cast } => match (key, cast) {
                (None, _) => var.clone(),
                (Some(key), Some(SqlType::Jsonb)) => format!("({}->{})", var, quote(key)),
                (Some(key), Some(ty)) => format!("(({}->>{})::{})", var, quote(key), ty.as_sql()),
                (Some(key), None) => format!("({}->>{})", var, quote(key)),
            },
            CompiledExpr::Local { name, .. } => name.clone(),
            CompiledExpr::Context(var) => match var {
                ContextVar::AuthUserId => "auth_user_id".to_string(),
                ContextVar::AuthTenantId => "auth_tenant_id".to_string(),
                ContextVar::EntityId => "v_current.id".to_string(),
                ContextVar::Now => "now()".to_string(),
            },
            CompiledExpr::CallField { record, field } => format!("{}.{}", record, field),
            CompiledExpr::Present(presence) => match presence {
                Presence::Always => "TRUE".to_string(),
                Presence::InputKey(key) => format!("(input_payload ? {})", quote(key)),
                Presence::ItemKey { var, key } => format!("({} ? {})", var, quote(key)),
            },
            CompiledExpr::Compare { op, left, right } => format!(
                "({} {} {})",
                self.render(left),
                op.symbol(),
                self.render(right)
            ),
            CompiledExpr::Logical { op, operands } => {
                let parts: Vec<String> = operands.iter().map(|e| self.render(e)).collect();
                format!("({})", parts.join(&format!(" {} ", op.keyword())))
            }
            CompiledExpr::Not(inner) => format!("(NOT {})", self.render(inner)),
            CompiledExpr::IsNull { expr, negated } => format!(
                "({} IS {}NULL)",
                self.render(expr),
                if *negated { "NOT " } else { "" }
            ),
            CompiledExpr::In {
                expr,
                list,
                negated,
            } => {
                let items: Vec<String> = list.iter().map(|e| self.render(e)).collect();
                format!(
                    "({} {}IN ({}))",
                    self.render(expr),
                    if *negated { "NOT " } else { "" },
                    items.join(", ")
                )
            }
            CompiledExpr::Arith { op, left, right } => format!(
                "({} {} {})",
                self.render(left),
                op.symbol(),
                self.render(right)
            ),
            CompiledExpr::Matches { expr, pattern } => {
                format!("(({})::text ~ {})", self.render(expr), quote(pattern))
            }
            CompiledExpr::Exists {
                table,
                condition,
                negated,
            } => format!(
                "({}EXISTS (SELECT 1 FROM {} WHERE {}))",
                if *negated { "NOT " } else { "" },
                table.qualified(),
                self.subquery_filter(table, condition.as_deref())
            ),
            CompiledExpr::Count { table, condition } => format!(
                "(SELECT count(*) FROM {} WHERE {})::INTEGER",
                table.qualified(),
                self.subquery_filter(table, condition.as_deref())
            ),
            CompiledExpr::ResolvePk { table, value } => format!(
                "{}(({})::text, auth_tenant_id)",
                TrinityHelpers::for_table(table).pk,
                self.render(value)
            ),
            CompiledExpr::IdOf { table, pk } => {
                format!("{}({})", TrinityHelpers::for_table(table).id, self.render(pk))
            }
        }
    }

    fn subquery_filter(&self, table: &TableRef, condition: Option<&CompiledExpr>) -> String {
        match condition {
            Some(c) => format!("{} AND {}", active_scope(table), self.render(c)),
            None => active_scope(table),
        }
    }
}

/// Schema objects shared by every generated action.
pub fn render_base() -> String {
    let mut w = Writer::new(0);
    w.line("CREATE SCHEMA IF NOT EXISTS app;");
    w.line("");
    w.line("DO $$");
    w.line("BEGIN");
    w.line(format!("    CREATE TYPE {} AS (", OUTPUT_TYPE));
    let fields = [
        ("tenant_id", "UUID"),
        ("user_id", "UUID"),
        ("entity_name", "TEXT"),
        ("entity_id", "UUID"),
        ("mutation_type", "TEXT"),
        ("mutation_status", "TEXT"),
        ("updated_fields", "TEXT[]"),
        ("message", "TEXT"),
        ("payload_before", "JSONB"),
        ("payload_after", "JSONB"),
        ("metadata", "JSONB"),
    ];
    for (i, (name, ty)) in fields.iter().enumerate() {
        let sep = if i + 1 < fields.len() { "," } else { "" };
        w.line(format!("        {} {}{}", name, ty, sep));
    }
    w.line("    );");
    w.line("EXCEPTION WHEN duplicate_object THEN NULL;");
    w.line("END");
    w.line("$$;");
    w.line("");
    w.line("CREATE TABLE IF NOT EXISTS app.tb_mutation_audit (");
    w.line("    pk_mutation_audit BIGSERIAL PRIMARY KEY,");
    w.line("    tenant_id UUID,");
    w.line("    user_id UUID,");
    w.line("    entity_name TEXT NOT NULL,");
    w.line("    entity_id UUID,");
    w.line("    function_name TEXT NOT NULL,");
    w.line("    mutation_type TEXT NOT NULL,");
    w.line("    mutation_status TEXT NOT NULL,");
    w.line("    updated_fields TEXT[],");
    w.line("    message TEXT,");
    w.line("    payload_before JSONB,");
    w.line("    payload_after JSONB,");
    w.line("    metadata JSONB,");
    w.line("    created_at TIMESTAMPTZ NOT NULL DEFAULT now()");
    w.line(");");
    w.line("");
    w.line("CREATE TABLE IF NOT EXISTS app.tb_event_outbox (");
    w.line("    pk_event_outbox BIGSERIAL PRIMARY KEY,");
    w.line("    id UUID NOT NULL DEFAULT gen_random_uuid(),");
    w.line("    tenant_id UUID,");
    w.line("    event_type TEXT NOT NULL,");
    w.line("    entity_name TEXT,");
    w.line("    entity_id UUID,");
    w.line("    payload JSONB NOT NULL DEFAULT '{}'::jsonb,");
    w.line("    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),");
    w.line("    published_at TIMESTAMPTZ");
    w.line(");");
    w.line("");
    w.line("CREATE OR REPLACE FUNCTION app.slugify(p_value TEXT) RETURNS TEXT");
    w.line("LANGUAGE sql IMMUTABLE AS $$");
    w.line("    SELECT trim(both '-' from regexp_replace(lower(p_value), '[^a-z0-9]+', '-', 'g'))");
    w.line("$$;");
    w.line("");
    w.line("CREATE OR REPLACE FUNCTION app.merge_fields(p_existing TEXT[], p_new TEXT[]) RETURNS TEXT[]");
    w.line("LANGUAGE sql IMMUTABLE AS $$");
    w.line("    SELECT COALESCE(p_existing, ARRAY[]::TEXT[]) || COALESCE(ARRAY(");
    w.line("        SELECT f FROM unnest(p_new) WITH ORDINALITY AS t(f, n)");
    w.line("        WHERE NOT f = ANY(COALESCE(p_existing, ARRAY[]::TEXT[]))");
    w.line("        ORDER BY n");
    w.line("    ), ARRAY[]::TEXT[])");
    w.line("$$;");
    w.out
}

/// `<entity>_pk`, `<entity>_id` and `<entity>_identifier` for one table.
pub fn render_helpers(table: &TableRef) -> String {
    let helpers = TrinityHelpers::for_table(table);
    let pk = &table.pk_column;
    let mut w = Writer::new(0);
    w.line(format!(
        "CREATE OR REPLACE FUNCTION {}(p_ref TEXT, p_tenant_id UUID) RETURNS INTEGER",
        helpers.pk
    ));
    w.line("LANGUAGE sql STABLE AS $$");
    w.line(format!("    SELECT {} FROM {}", pk, table.qualified()));
    w.line(format!(
        "    WHERE CASE WHEN p_ref ~* {} THEN id = p_ref::uuid ELSE identifier = p_ref END",
        quote(UUID_PATTERN)
    ));
    if table.tenant_scoped {
        w.line("      AND tenant_id = p_tenant_id");
    }
    w.line(format!("    ORDER BY {} LIMIT 1", pk));
    w.line("$$;");
    w.line("");
    for (name, column, ty) in [
        (&helpers.id, "id", "UUID"),
        (&helpers.identifier, "identifier", "TEXT"),
    ] {
        w.line(format!(
            "CREATE OR REPLACE FUNCTION {}(p_pk INTEGER) RETURNS {}",
            name, ty
        ));
        w.line("LANGUAGE sql STABLE AS $$");
        w.line(format!(
            "    SELECT {} FROM {} WHERE {} = p_pk",
            column,
            table.qualified(),
            pk
        ));
        w.line("$$;");
        w.line("");
    }
    w.out.truncate(w.out.trim_end().len());
    w.out.push('\n');
    w.out
}

pub fn render_input_type(ty: &CompositeType) -> String {
    let mut w = Writer::new(0);
    w.line(format!("DROP TYPE IF EXISTS {} CASCADE;", ty.name));
    if ty.fields.is_empty() {
        w.line(format!("CREATE TYPE {} AS ();", ty.name));
        return w.out;
    }
    w.line(format!("CREATE TYPE {} AS (", ty.name));
    for (i, field) in ty.fields.iter().enumerate() {
        let sep = if i + 1 < ty.fields.len() { "," } else { "" };
        w.line(format!("    {} {}{}", field.name, field.sql_type.as_sql(), sep));
    }
    w.line(");");
    w.out
}

pub fn render_app_wrapper(plan: &ActionPlan) -> String {
    let mut w = Writer::new(0);
    w.line(format!("CREATE OR REPLACE FUNCTION {}(", plan.app_function));
    w.line("    auth_tenant_id UUID,");
    w.line("    auth_user_id UUID,");
    w.line("    input_payload JSONB");
    w.line(format!(") RETURNS {}", OUTPUT_TYPE));
    w.line("LANGUAGE plpgsql");
    w.line("AS $$");
    w.line("BEGIN");
    w.line(format!("    RETURN {}(", plan.core_function));
    w.line("        auth_tenant_id,");
    w.line("        auth_user_id,");
    w.line(format!(
        "        jsonb_populate_record(NULL::{}, COALESCE(input_payload, '{{}}'::jsonb)),",
        plan.input.name
    ));
    w.line("        COALESCE(input_payload, '{}'::jsonb)");
    w.line("    );");
    w.line("END;");
    w.line("$$;");
    w.line("");
    let d = &plan.descriptor;
    w.line(format!(
        "COMMENT ON FUNCTION {}(UUID, UUID, JSONB) IS {};",
        plan.app_function,
        quote(&format!(
            "@specql:mutation name={},input={},output={}",
            d.name, d.input_type, d.output_type
        ))
    ));
    w.out
}

pub fn render_core_function(plan: &ActionPlan) -> String {
    let mut r = BodyRenderer {
        plan,
        exprs: ExprRenderer::new(&plan.input),
        w: Writer::new(0),
    };
    r.function();
    r.w.out
}

struct BodyRenderer<'p> {
    plan: &'p ActionPlan,
    exprs: ExprRenderer<'p>,
    w: Writer,
}

impl<'p> BodyRenderer<'p> {
    fn e(&self, expr: &CompiledExpr) -> String {
        self.exprs.render(expr)
    }

    fn function(&mut self) {
        let plan = self.plan;
        let pk = &plan.table.pk_column;
        self.w.line(format!("CREATE OR REPLACE FUNCTION {}(", plan.core_function));
        self.w.line("    auth_tenant_id UUID,");
        self.w.line("    auth_user_id UUID,");
        self.w.line(format!("    input_data {},", plan.input.name));
        self.w.line("    input_payload JSONB");
        self.w.line(format!(") RETURNS {}", OUTPUT_TYPE));
        self.w.line("LANGUAGE plpgsql");
        self.w.line("AS $$");
        self.w.line("DECLARE");
        self.w.depth = 1;
        self.w.line(format!("v_result {};", OUTPUT_TYPE));
        self.w.line(format!("v_current {}%ROWTYPE;", plan.table.qualified()));
        self.w.line("v_pk INTEGER;");
        self.w.line("v_payload_before JSONB;");
        self.w.line("v_updated_fields TEXT[] := ARRAY[]::TEXT[];");
        self.w.line("v_changed TEXT[] := ARRAY[]::TEXT[];");
        self.w.line("v_conflict RECORD;");
        self.w.line("v_new_id UUID;");
        if plan.batch.is_some() {
            self.w.line("v_processed_count INTEGER := 0;");
            self.w.line("v_failed_count INTEGER := 0;");
            self.w.line("v_failed_items JSONB := '[]'::jsonb;");
            self.w.line("v_errors_truncated BOOLEAN := FALSE;");
            self.w.line("v_updated_fields_saved TEXT[];");
            self.w.line(format!(
                "v_current_saved {}%ROWTYPE;",
                plan.table.qualified()
            ));
        }
        for local in &plan.locals {
            let ty = match &local.ty {
                LocalType::Scalar(ty) => ty.as_sql().to_string(),
                LocalType::Row(table) => format!("{}%ROWTYPE", table),
                LocalType::MutationResult => OUTPUT_TYPE.to_string(),
            };
            self.w.line(format!("{} {};", local.name, ty));
        }
        self.w.depth = 0;
        self.w.line("BEGIN");
        self.w.depth = 1;
        self.w.line("v_result.metadata := '{}'::jsonb;");
        self.w.line("BEGIN");
        self.nested(&plan.body);
        self.w.line("EXCEPTION");
        self.w.line(format!("    WHEN SQLSTATE '{}' THEN", TERMINATE_SQLSTATE));
        self.w.line("        v_updated_fields := ARRAY[]::TEXT[];");
        self.w.line("        v_current := NULL;");
        self.w.line("    WHEN OTHERS THEN");
        self.w.line(format!(
            "        RAISE WARNING '{} failed: %', SQLERRM;",
            plan.core_function
        ));
        self.w.line("        v_result.mutation_status := 'failed:unexpected_error';");
        self.w.line("        v_result.message := SQLERRM;");
        self.w.line("        v_updated_fields := ARRAY[]::TEXT[];");
        self.w.line("        v_current := NULL;");
        self.w.line("END;");
        self.w.line("");

        self.w.line("IF v_result.mutation_status IS NULL THEN");
        if plan.batch.is_some() {
            self.w.line("    IF v_failed_count > 0 THEN");
            self.w.line("        v_result.mutation_status := 'partial:items_failed';");
            self.w.line("        v_result.message := format('%s of %s items failed', v_failed_count, v_processed_count + v_failed_count);");
            self.w.line("    ELSE");
            self.w.line("        v_result.mutation_status := 'success';");
            self.w.line(format!(
                "        v_result.message := {};",
                quote(&plan.success_message)
            ));
            self.w.line("    END IF;");
        } else {
            self.w.line("    v_result.mutation_status := 'success';");
            self.w.line(format!(
                "    v_result.message := {};",
                quote(&plan.success_message)
            ));
        }
        self.w.line("END IF;");
        self.w.line("v_result.tenant_id := auth_tenant_id;");
        self.w.line("v_result.user_id := auth_user_id;");
        self.w.line(format!("v_result.entity_name := {};", quote(&plan.entity)));
        self.w.line("v_result.entity_id := COALESCE(v_result.entity_id, v_current.id, (v_payload_before->>'id')::uuid);");
        self.w.line(format!(
            "v_result.mutation_type := {};",
            quote(plan.mutation_type())
        ));
        self.w.line("v_result.updated_fields := v_updated_fields;");
        self.w.line("v_result.payload_before := v_payload_before;");
        self.w.line(format!(
            "v_result.payload_after := CASE WHEN v_current.{pk} IS NULL THEN NULL ELSE to_jsonb(v_current) - '{pk}' END;"
        ));
        let meta = serde_json::to_string(&plan.impact.to_meta()).unwrap_or_else(|_| "{}".into());
        self.w.line(format!(
            "v_result.metadata := COALESCE(v_result.metadata, '{{}}'::jsonb) || jsonb_build_object('_meta', {}::jsonb);",
            quote(&meta)
        ));
        if plan.batch.is_some() {
            self.w.line("v_result.metadata := v_result.metadata || jsonb_build_object(");
            self.w.line("    'processed_count', v_processed_count,");
            self.w.line("    'failed_count', v_failed_count,");
            self.w.line("    'failed_items', v_failed_items,");
            self.w.line("    'errors_truncated', v_errors_truncated");
            self.w.line(");");
        }
        self.w.line("");
        self.w.line("INSERT INTO app.tb_mutation_audit (");
        self.w.line("    tenant_id, user_id, entity_name, entity_id, function_name, mutation_type,");
        self.w.line("    mutation_status, updated_fields, message, payload_before, payload_after, metadata");
        self.w.line(") VALUES (");
        self.w.line(format!(
            "    v_result.tenant_id, v_result.user_id, v_result.entity_name, v_result.entity_id, {}, v_result.mutation_type,",
            quote(&plan.core_function)
        ));
        self.w.line("    v_result.mutation_status, v_result.updated_fields, v_result.message,");
        self.w.line("    v_result.payload_before, v_result.payload_after, v_result.metadata");
        self.w.line(");");
        self.w.line("");
        self.w.line("RETURN v_result;");
        self.w.depth = 0;
        self.w.line("END;");
        self.w.line("$$;");
    }

    fn nested(&mut self, ops: &[Op]) {
        self.w.depth += 1;
        for op in ops {
            self.op(op);
        }
        self.w.depth -= 1;
    }

    fn terminate(&mut self, t: &Termination) {
        self.w.line(format!(
            "v_result.mutation_status := {};",
            quote(&t.status.to_string())
        ));
        self.w.line(format!("v_result.message := {};", quote(&t.message)));
        self.w.line(format!(
            "RAISE EXCEPTION USING ERRCODE = '{}';",
            TERMINATE_SQLSTATE
        ));
    }

    fn op(&mut self, op: &Op) {
        match op {
            Op::Guard { condition, on_fail } => {
                self.w
                    .line(format!("IF NOT COALESCE({}, FALSE) THEN", self.e(condition)));
                self.w.depth += 1;
                self.terminate(on_fail);
                self.w.depth -= 1;
                self.w.line("END IF;");
            }
            Op::Resolve {
                dest,
                table,
                value,
                optional,
                require_active,
                on_missing,
            } => {
                let value = self.e(value);
                self.w.line(format!("IF {} IS NULL THEN", value));
                self.w.depth += 1;
                if *optional {
                    self.w.line(format!("{} := NULL;", dest));
                } else {
                    self.terminate(on_missing);
                }
                self.w.depth -= 1;
                self.w.line("ELSE");
                self.w.depth += 1;
                let active = if *require_active { " AND deleted_at IS NULL" } else { "" };
                self.w.line(format!(
                    "SELECT {pk} INTO {dest} FROM {t} WHERE {pk} = {f}(({v})::text, auth_tenant_id){active};",
                    pk = table.pk_column,
                    dest = dest,
                    t = table.qualified(),
                    f = TrinityHelpers::for_table(table).pk,
                    v = value,
                    active = active
                ));
                self.w.line(format!("IF {} IS NULL THEN", dest));
                self.w.depth += 1;
                self.terminate(on_missing);
                self.w.depth -= 1;
                self.w.line("END IF;");
                self.w.depth -= 1;
                self.w.line("END IF;");
            }
            Op::Load {
                table,
                pk,
                record,
                capture_before,
            } => {
                self.w.line(format!(
                    "SELECT * INTO {} FROM {} WHERE {} = {} FOR UPDATE;",
                    record,
                    table.qualified(),
                    table.pk_column,
                    pk
                ));
                if *capture_before {
                    self.w.line(format!(
                        "v_payload_before := to_jsonb({}) - '{}';",
                        record, table.pk_column
                    ));
                }
            }
            Op::Insert(insert) => self.insert(insert),
            Op::Update(update) => self.update(update),
            Op::Delete(delete) => self.delete(delete),
            Op::Branch {
                condition,
                then_ops,
                else_ops,
            } => {
                self.w
                    .line(format!("IF COALESCE({}, FALSE) THEN", self.e(condition)));
                self.nested(then_ops);
                if !else_ops.is_empty() {
                    self.w.line("ELSE");
                    self.nested(else_ops);
                }
                self.w.line("END IF;");
            }
            Op::Loop(l) => self.loop_op(l),
            Op::Invoke(invoke) => self.invoke(invoke),
            Op::Emit(emit) => self.emit(emit),
            Op::Refresh { function, pk } => {
                let arg = pk.as_ref().map(|e| self.e(e)).unwrap_or_else(|| "NULL".into());
                self.w.line(format!("PERFORM {}({});", function, arg));
            }
        }
    }

    fn insert_value(&self, a: &Assignment) -> String {
        let value = self.e(&a.value);
        match &a.default {
            Some(default) => format!("COALESCE({}, {})", value, literal(default)),
            None => value,
        }
    }

    fn matching(&self, table: &TableRef, columns: &[(String, CompiledExpr)]) -> String {
        let mut parts = vec![active_scope(table)];
        parts.extend(
            columns
                .iter()
                .map(|(column, value)| format!("{} = {}", column, self.e(value))),
        );
        parts.join(" AND ")
    }

    fn insert(&mut self, insert: &InsertOp) {
        let table = &insert.table;
        let reuse = insert.reuse.as_ref();
        if let Some(lookup) = reuse {
            self.w.line(format!(
                "SELECT * INTO {} FROM {} WHERE {} ORDER BY {} LIMIT 1;",
                insert.record,
                table.qualified(),
                self.matching(table, lookup),
                table.pk_column
            ));
            self.w.line("IF NOT FOUND THEN");
            self.w.depth += 1;
        }

        for check in &insert.unique {
            self.w.line(format!(
                "SELECT id, identifier INTO v_conflict FROM {} WHERE {} LIMIT 1;",
                table.qualified(),
                self.matching(table, &check.columns)
            ));
            self.w.line("IF FOUND THEN");
            self.w.depth += 1;
            self.w.line("v_result.entity_id := v_conflict.id;");
            self.w.line(format!(
                "v_result.metadata := COALESCE(v_result.metadata, '{{}}'::jsonb) || jsonb_build_object('conflict', jsonb_build_object('constraint', {}, 'id', v_conflict.id, 'identifier', v_conflict.identifier));",
                quote(&check.constraint)
            ));
            self.terminate(&check.on_conflict);
            self.w.depth -= 1;
            self.w.line("END IF;");
        }

        let identifier = match &insert.identifier {
            Some(template) => {
                let parts: Vec<String> = template
                    .parts
                    .iter()
                    .map(|p| format!("app.slugify(({})::text)", self.e(p)))
                    .collect();
                format!(
                    "COALESCE(NULLIF(concat_ws({}, {}), ''), v_new_id::text)",
                    quote(&template.separator),
                    parts.join(", ")
                )
            }
            None => "v_new_id::text".to_string(),
        };

        let mut columns = vec!["id".to_string(), "identifier".to_string()];
        let mut values = vec!["v_new_id".to_string(), identifier];
        if table.tenant_scoped {
            columns.push("tenant_id".into());
            values.push("auth_tenant_id".into());
        }
        columns.push("created_at".into());
        values.push("now()".into());
        columns.push("created_by".into());
        values.push("auth_user_id".into());
        for a in &insert.assignments {
            columns.push(a.column.clone());
            values.push(self.insert_value(a));
        }
        for (column, default) in &insert.defaults {
            columns.push(column.clone());
            values.push(literal(default));
        }

        self.w.line("v_new_id := gen_random_uuid();");
        self.w.line(format!(
            "INSERT INTO {} ({})",
            table.qualified(),
            columns.join(", ")
        ));
        self.w.line(format!("VALUES ({})", values.join(", ")));
        self.w.line(format!("RETURNING * INTO {};", insert.record));
        if insert.primary {
            let fields: Vec<String> = insert.assignments.iter().map(|a| a.field.clone()).collect();
            self.w.line(format!(
                "v_updated_fields := app.merge_fields(v_updated_fields, {});",
                text_array(&fields)
            ));
        }

        if reuse.is_some() {
            self.w.depth -= 1;
            self.w.line("END IF;");
        }
        if insert.primary {
            if insert.record != "v_current" {
                self.w.line(format!("v_current := {};", insert.record));
            }
            self.w.line(format!("v_pk := v_current.{};", table.pk_column));
        }
    }

    fn row_key(target: &RowTarget) -> Option<(&str, &str)> {
        match target {
            RowTarget::Current => Some(("v_pk", "v_current")),
            RowTarget::Pk { local, record } => Some((local.as_str(), record.as_str())),
            RowTarget::Filter(_) => None,
        }
    }

    fn update(&mut self, update: &UpdateOp) {
        let table = &update.table;
        match Self::row_key(&update.target) {
            Some((key, record)) if update.track_changes => {
                self.w.line("v_changed := ARRAY[]::TEXT[];");
                for a in &update.assignments {
                    let differs = format!("{}.{} IS DISTINCT FROM {}", record, a.column, self.e(&a.value));
                    let condition = match a.presence.condition() {
                        Some(present) => format!("{} AND {}", self.e(&present), differs),
                        None => differs,
                    };
                    self.w.line(format!("IF {} THEN", condition));
                    self.w.line(format!(
                        "    v_changed := array_append(v_changed, {});",
                        quote(&a.field)
                    ));
                    self.w.line("END IF;");
                }
                self.w.line("IF cardinality(v_changed) > 0 THEN");
                self.w.depth += 1;
                self.w.line(format!("UPDATE {} SET", table.qualified()));
                for a in &update.assignments {
                    self.w.line(format!(
                        "    {col} = CASE WHEN {f} = ANY(v_changed) THEN {v} ELSE {col} END,",
                        col = a.column,
                        f = quote(&a.field),
                        v = self.e(&a.value)
                    ));
                }
                self.w.line("    updated_at = now(),");
                self.w.line("    updated_by = auth_user_id");
                self.w.line(format!(
                    "WHERE {} = {} RETURNING * INTO {};",
                    table.pk_column, key, record
                ));
                self.w.line("v_updated_fields := app.merge_fields(v_updated_fields, v_changed);");
                self.w.depth -= 1;
                self.w.line("END IF;");
            }
            Some((key, record)) => {
                self.w.line(format!("UPDATE {} SET", table.qualified()));
                self.set_clauses(&update.assignments);
                self.w.line(format!(
                    "WHERE {} = {} RETURNING * INTO {};",
                    table.pk_column, key, record
                ));
            }
            None => {
                let RowTarget::Filter(condition) = &update.target else {
                    return;
                };
                self.w.line(format!("UPDATE {} SET", table.qualified()));
                self.set_clauses(&update.assignments);
                self.w.line(format!(
                    "WHERE {} AND {};",
                    active_scope(table),
                    self.e(condition)
                ));
            }
        }
    }

    fn set_clauses(&mut self, assignments: &[Assignment]) {
        for a in assignments {
            let value = self.e(&a.value);
            let value = match a.presence.condition() {
                Some(present) => format!(
                    "CASE WHEN {} THEN {} ELSE {} END",
                    self.e(&present),
                    value,
                    a.column
                ),
                None => value,
            };
            self.w.line(format!("    {} = {},", a.column, value));
        }
        self.w.line("    updated_at = now(),");
        self.w.line("    updated_by = auth_user_id");
    }

    fn delete(&mut self, delete: &DeleteOp) {
        let table = &delete.table;
        match (Self::row_key(&delete.target), delete.hard) {
            (Some((key, record)), true) => {
                if !delete.dependents.is_empty() {
                    let checks: Vec<String> = delete
                        .dependents
                        .iter()
                        .map(|d| {
                            format!(
                                "EXISTS (SELECT 1 FROM {} WHERE {} = {})",
                                d.table.qualified(),
                                d.column,
                                key
                            )
                        })
                        .collect();
                    self.w.line(format!("IF {} THEN", checks.join(" OR ")));
                    self.w.depth += 1;
                    self.terminate(&delete.on_dependents);
                    self.w.depth -= 1;
                    self.w.line("END IF;");
                }
                self.w.line(format!(
                    "DELETE FROM {} WHERE {} = {};",
                    table.qualified(),
                    table.pk_column,
                    key
                ));
                self.w.line(format!("{} := NULL;", record));
            }
            (Some((key, record)), false) => {
                self.w.line(format!(
                    "UPDATE {} SET deleted_at = now(), deleted_by = auth_user_id",
                    table.qualified()
                ));
                self.w.line(format!(
                    "WHERE {} = {} RETURNING * INTO {};",
                    table.pk_column, key, record
                ));
            }
            (None, _) => {
                let RowTarget::Filter(condition) = &delete.target else {
                    return;
                };
                self.w.line(format!(
                    "UPDATE {} SET deleted_at = now(), deleted_by = auth_user_id",
                    table.qualified()
                ));
                self.w.line(format!(
                    "WHERE {} AND {};",
                    active_scope(table),
                    self.e(condition)
                ));
            }
        }
    }

    fn loop_op(&mut self, l: &LoopOp) {
        let (query, identity) = match &l.source {
            LoopSource::InputArray { key } => (
                format!(
                    "SELECT value FROM jsonb_array_elements(COALESCE(input_data.{}, '[]'::jsonb))",
                    key
                ),
                format!("COALESCE({}->>'id', {}::text)", l.var, l.index),
            ),
            LoopSource::ItemArray { var, key } => (
                format!(
                    "SELECT value FROM jsonb_array_elements(COALESCE({}->{}, '[]'::jsonb))",
                    var,
                    quote(key)
                ),
                format!("COALESCE({}->>'id', {}::text)", l.var, l.index),
            ),
            LoopSource::Rows { table, condition } => {
                let filter = match condition {
                    Some(c) => format!("{} AND {}", active_scope(table), self.e(c)),
                    None => active_scope(table),
                };
                (
                    format!(
                        "SELECT * FROM {} WHERE {} ORDER BY {}",
                        table.qualified(),
                        filter,
                        table.pk_column
                    ),
                    format!("{}.id::text", l.var),
                )
            }
        };

        self.w.line(format!("{} := 0;", l.index));
        self.w.line(format!("FOR {} IN {} LOOP", l.var, query));
        self.w.depth += 1;
        match l.policy {
            Some(policy) if policy.mode == ErrorMode::ContinueOnError => {
                self.w.line("v_updated_fields_saved := v_updated_fields;");
                self.w.line("v_current_saved := v_current;");
                self.w.line("BEGIN");
                self.nested(&l.body);
                self.w.line("    v_processed_count := v_processed_count + 1;");
                self.w.line("EXCEPTION");
                for (sqlstate, status, message) in [
                    (
                        format!("SQLSTATE '{}'", TERMINATE_SQLSTATE),
                        "v_result.mutation_status",
                        "v_result.message",
                    ),
                    ("OTHERS".to_string(), "'failed:unexpected_error'", "SQLERRM"),
                ] {
                    self.w.line(format!("    WHEN {} THEN", sqlstate));
                    self.w.depth += 2;
                    self.w.line("v_updated_fields := v_updated_fields_saved;");
                    self.w.line("v_current := v_current_saved;");
                    self.w.line("v_failed_count := v_failed_count + 1;");
                    self.w.line(format!(
                        "IF jsonb_array_length(v_failed_items) < {} THEN",
                        policy.max_errors
                    ));
                    self.w.line(format!(
                        "    v_failed_items := v_failed_items || jsonb_build_array(jsonb_build_object('index', {}, 'id', {}, 'status', {}, 'message', {}));",
                        l.index, identity, status, message
                    ));
                    self.w.line("ELSE");
                    self.w.line("    v_errors_truncated := TRUE;");
                    self.w.line("END IF;");
                    self.w.line("v_result := NULL;");
                    self.w.depth -= 2;
                }
                self.w.line("END;");
            }
            Some(_) => {
                for op in &l.body {
                    self.op(op);
                }
                self.w.line("v_processed_count := v_processed_count + 1;");
            }
            None => {
                for op in &l.body {
                    self.op(op);
                }
            }
        }
        self.w.line(format!("{i} := {i} + 1;", i = l.index));
        self.w.depth -= 1;
        self.w.line("END LOOP;");
    }

    fn invoke(&mut self, invoke: &InvokeOp) {
        let args = if invoke.args.is_empty() {
            "'{}'::jsonb".to_string()
        } else {
            let pairs: Vec<String> = invoke
                .args
                .iter()
                .map(|(k, v)| format!("{}, {}", quote(k), self.e(v)))
                .collect();
            format!("jsonb_build_object({})", pairs.join(", "))
        };
        let qualified = format!("{}.{}", invoke.entity, invoke.action);
        self.w.line(format!(
            "{} := {}(auth_tenant_id, auth_user_id, jsonb_populate_record(NULL::{}, {}), {});",
            invoke.record, invoke.function, invoke.input_type, args, args
        ));
        self.w.line(format!(
            "IF split_part({}.mutation_status, ':', 1) IN ('validation', 'failed') THEN",
            invoke.record
        ));
        self.w.depth += 1;
        if invoke.non_fatal {
            self.w.line(format!(
                "RAISE NOTICE 'call to % failed: %', {}, {}.mutation_status;",
                quote(&qualified),
                invoke.record
            ));
        } else {
            self.w.line(format!(
                "v_result.metadata := COALESCE(v_result.metadata, '{{}}'::jsonb) || jsonb_build_object('failed_call', jsonb_build_object('action', {q}, 'status', {r}.mutation_status, 'message', {r}.message));",
                q = quote(&qualified),
                r = invoke.record
            ));
            self.w.line(format!(
                "v_result.mutation_status := {}.mutation_status;",
                invoke.record
            ));
            self.w.line(format!("v_result.message := {}.message;", invoke.record));
            self.w.line(format!(
                "RAISE EXCEPTION USING ERRCODE = '{}';",
                TERMINATE_SQLSTATE
            ));
        }
        self.w.depth -= 1;
        self.w.line("END IF;");
    }

    fn emit(&mut self, emit: &EmitOp) {
        let payload = if emit.payload.is_empty() {
            "'{}'::jsonb".to_string()
        } else {
            let mut out = String::from("jsonb_build_object(");
            for (i, (k, v)) in emit.payload.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let _ = write!(out, "{}, {}", quote(k), self.e(v));
            }
            out.push(')');
            out
        };
        self.w.line("BEGIN");
        self.w.line("    INSERT INTO app.tb_event_outbox (tenant_id, event_type, entity_name, entity_id, payload)");
        self.w.line(format!(
            "    VALUES (auth_tenant_id, {}, {}, v_current.id, {});",
            quote(&emit.event),
            quote(&emit.entity),
            payload
        ));
        self.w.line("EXCEPTION WHEN OTHERS THEN");
        self.w.line(format!(
            "    RAISE WARNING 'event % not staged: %', {}, SQLERRM;",
            quote(&emit.event)
        ));
        self.w.line("END;");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composite::CompositeField;
    use specql_model::CompareOp;

    fn input() -> CompositeType {
        CompositeType {
            name: "app.type_x_input".to_string(),
            fields: vec![CompositeField {
                name: "qty".to_string(),
                sql_type: SqlType::Numeric,
            }],
        }
    }

    #[test]
    fn test_literals_are_quoted() {
        assert_eq!(literal(&Value::String("O'Brien".into())), "'O''Brien'");
        assert_eq!(literal(&Value::Null), "NULL");
        assert_eq!(literal(&serde_json::json!([1])), "'[1]'::jsonb");
    }

    #[test]
    fn test_inputs_cast_only_when_types_differ() {
        let ty = input();
        let r = ExprRenderer::new(&ty);
        let numeric = CompiledExpr::Input {
            key: "qty".into(),
            sql_type: Some(SqlType::Numeric),
        };
        assert_eq!(r.render(&numeric), "input_data.qty");
        let integer = CompiledExpr::Input {
            key: "qty".into(),
            sql_type: Some(SqlType::Integer),
        };
        assert_eq!(r.render(&integer), "(input_data.qty)::INTEGER");
    }

    #[test]
    fn test_item_keys_and_presence() {
        let ty = input();
        let r = ExprRenderer::new(&ty);
        let price = CompiledExpr::Item {
            var: "v_line".into(),
            key: Some("price".into()),
            cast: Some(SqlType::Numeric),
        };
        let cmp = CompiledExpr::compare(CompareOp::Gt, price, CompiledExpr::literal(0));
        assert_eq!(r.render(&cmp), "(((v_line->>'price')::NUMERIC) > 0)");
        let present = CompiledExpr::Present(Presence::InputKey("qty".into()));
        assert_eq!(r.render(&present), "(input_payload ? 'qty')");
    }

    #[test]
    fn test_helpers_skip_tenant_for_catalog_entities() {
        let mut table = TableRef {
            entity: "Country".into(),
            schema: "ref".into(),
            table: "tb_country".into(),
            pk_column: "pk_country".into(),
            snake: "country".into(),
            tenant_scoped: false,
        };
        let sql = render_helpers(&table);
        assert!(sql.contains("CREATE OR REPLACE FUNCTION ref.country_pk(p_ref TEXT, p_tenant_id UUID)"));
        assert!(!sql.contains("AND tenant_id = p_tenant_id"));
        assert!(sql.contains("ref.country_identifier(p_pk INTEGER) RETURNS TEXT"));
        table.tenant_scoped = true;
        assert!(render_helpers(&table).contains("AND tenant_id = p_tenant_id"));
    }
}

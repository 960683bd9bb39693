//! Core type definitions for entity and action specs

use crate::expr::Expr;
use crate::utils::to_snake_case;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Top-level document: a list of entities with their actions.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct SpecDocument {
    #[serde(default)]
    pub entities: Vec<EntitySpec>,
}

/// Columns every table carries in addition to its declared fields.
pub const SYSTEM_COLUMNS: &[&str] = &[
    "id",
    "identifier",
    "tenant_id",
    "created_at",
    "created_by",
    "updated_at",
    "updated_by",
    "deleted_at",
    "deleted_by",
];

fn default_schema() -> String {
    "public".to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EntitySpec {
    pub name: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
    #[serde(default)]
    pub constraints: Vec<ConstraintSpec>,
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
    #[serde(default)]
    pub identifier: Option<IdentifierPattern>,
    #[serde(default)]
    pub projections: Vec<ProjectionSpec>,
    /// Shared reference data: rows are not scoped to a tenant.
    #[serde(default)]
    pub catalog: bool,
}

impl EntitySpec {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn action(&self, name: &str) -> Option<&ActionSpec> {
        self.actions.iter().find(|a| a.name == name)
    }

    pub fn snake_name(&self) -> String {
        to_snake_case(&self.name)
    }

    pub fn default_table_name(&self) -> String {
        format!("tb_{}", self.snake_name())
    }

    pub fn pk_column(&self) -> String {
        format!("pk_{}", self.snake_name())
    }

    pub fn tenant_scoped(&self) -> bool {
        !self.catalog
    }

    /// Whether `name` is a declared field or one of the system columns.
    pub fn has_column_named(&self, name: &str) -> bool {
        self.field(name).is_some() || SYSTEM_COLUMNS.contains(&name) || name == self.pk_column()
    }

    pub fn unique_constraints(&self) -> impl Iterator<Item = &ConstraintSpec> {
        self.constraints.iter().filter(|c| !c.unique.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct IdentifierPattern {
    pub fields: Vec<String>,
    #[serde(default = "default_separator")]
    pub separator: String,
}

fn default_separator() -> String {
    "-".to_string()
}

/// A denormalized projection refreshed after every mutation of its entity.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProjectionSpec {
    pub name: String,
}

impl ProjectionSpec {
    pub fn refresh_function(&self) -> String {
        format!("refresh_{}", self.name)
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
}

impl FieldSpec {
    /// Storage column: reference fields are stored as `fk_<name>` holding
    /// the referenced row's internal key.
    pub fn column_name(&self) -> String {
        match self.field_type {
            FieldType::Ref(_) => format!("fk_{}", self.name),
            _ => self.name.clone(),
        }
    }

    pub fn reference(&self) -> Option<&str> {
        match &self.field_type {
            FieldType::Ref(entity) => Some(entity),
            _ => None,
        }
    }

    pub fn is_required(&self) -> bool {
        !self.nullable && self.default.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    Text,
    Integer,
    Decimal,
    Boolean,
    Date,
    Timestamp,
    Uuid,
    Json,
}

impl ScalarType {
    pub fn name(&self) -> &'static str {
        match self {
            ScalarType::Text => "text",
            ScalarType::Integer => "integer",
            ScalarType::Decimal => "decimal",
            ScalarType::Boolean => "boolean",
            ScalarType::Date => "date",
            ScalarType::Timestamp => "timestamp",
            ScalarType::Uuid => "uuid",
            ScalarType::Json => "json",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "text" | "string" => ScalarType::Text,
            "integer" | "int" => ScalarType::Integer,
            "decimal" | "numeric" => ScalarType::Decimal,
            "boolean" | "bool" => ScalarType::Boolean,
            "date" => ScalarType::Date,
            "timestamp" | "datetime" => ScalarType::Timestamp,
            "uuid" => ScalarType::Uuid,
            "json" | "jsonb" => ScalarType::Json,
            _ => return None,
        })
    }
}

/// How a rich scalar is checked before it is written.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RichCheck {
    Pattern(&'static str),
    Range { min: f64, max: f64 },
    Unchecked,
}

/// Scalars carrying format or range validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RichType {
    Email,
    Phone,
    Url,
    Slug,
    Color,
    Money,
    Percentage,
    Latitude,
    Longitude,
    Markdown,
}

impl RichType {
    pub fn name(&self) -> &'static str {
        match self {
            RichType::Email => "email",
            RichType::Phone => "phone",
            RichType::Url => "url",
            RichType::Slug => "slug",
            RichType::Color => "color",
            RichType::Money => "money",
            RichType::Percentage => "percentage",
            RichType::Latitude => "latitude",
            RichType::Longitude => "longitude",
            RichType::Markdown => "markdown",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "email" => RichType::Email,
            "phone" | "phoneNumber" | "phone_number" => RichType::Phone,
            "url" => RichType::Url,
            "slug" => RichType::Slug,
            "color" => RichType::Color,
            "money" => RichType::Money,
            "percentage" => RichType::Percentage,
            "latitude" => RichType::Latitude,
            "longitude" => RichType::Longitude,
            "markdown" => RichType::Markdown,
            _ => return None,
        })
    }

    /// Underlying storage scalar.
    pub fn base(&self) -> ScalarType {
        match self {
            RichType::Money | RichType::Percentage | RichType::Latitude | RichType::Longitude => {
                ScalarType::Decimal
            }
            _ => ScalarType::Text,
        }
    }

    pub fn check(&self) -> RichCheck {
        match self {
            RichType::Email => {
                RichCheck::Pattern(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$")
            }
            RichType::Phone => RichCheck::Pattern(r"^\+[1-9][0-9]{1,14}$"),
            RichType::Url => RichCheck::Pattern(r"^https?://[^\s/$.?#].[^\s]*$"),
            RichType::Slug => RichCheck::Pattern(r"^[a-z0-9]+(-[a-z0-9]+)*$"),
            RichType::Color => RichCheck::Pattern(r"^#[0-9A-Fa-f]{6}$"),
            RichType::Percentage => RichCheck::Range {
                min: 0.0,
                max: 100.0,
            },
            RichType::Latitude => RichCheck::Range {
                min: -90.0,
                max: 90.0,
            },
            RichType::Longitude => RichCheck::Range {
                min: -180.0,
                max: 180.0,
            },
            RichType::Money | RichType::Markdown => RichCheck::Unchecked,
        }
    }
}

/// Field type, written in documents as `text`, `email`, `enum(a, b)` or
/// `ref(Company)`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum FieldType {
    Scalar(ScalarType),
    Rich(RichType),
    Enum(Vec<String>),
    Ref(String),
}

impl FieldType {
    pub fn base_scalar(&self) -> ScalarType {
        match self {
            FieldType::Scalar(s) => *s,
            FieldType::Rich(r) => r.base(),
            FieldType::Enum(_) => ScalarType::Text,
            FieldType::Ref(_) => ScalarType::Integer,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Scalar(s) => f.write_str(s.name()),
            FieldType::Rich(r) => f.write_str(r.name()),
            FieldType::Enum(values) => write!(f, "enum({})", values.join(", ")),
            FieldType::Ref(entity) => write!(f, "ref({})", entity),
        }
    }
}

impl TryFrom<String> for FieldType {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        fn wrapped<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
            s.strip_prefix(prefix)
                .and_then(|rest| rest.strip_suffix(')'))
                .map(str::trim)
        }

        let s = s.trim();
        if let Some(inner) = wrapped(s, "ref(") {
            if inner.is_empty() {
                return Err("ref() needs an entity name".to_string());
            }
            return Ok(FieldType::Ref(inner.to_string()));
        }
        if let Some(inner) = wrapped(s, "enum(") {
            let values: Vec<String> = inner
                .split(',')
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect();
            if values.is_empty() {
                return Err("enum() needs at least one value".to_string());
            }
            return Ok(FieldType::Enum(values));
        }
        if let Some(scalar) = ScalarType::from_name(s) {
            return Ok(FieldType::Scalar(scalar));
        }
        if let Some(rich) = RichType::from_name(s) {
            return Ok(FieldType::Rich(rich));
        }
        Err(format!("unknown field type '{}'", s))
    }
}

impl From<FieldType> for String {
    fn from(t: FieldType) -> Self {
        t.to_string()
    }
}

/// When a constraint is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckOn {
    Create,
    Update,
    #[default]
    Both,
}

impl CheckOn {
    pub fn on_create(&self) -> bool {
        matches!(self, CheckOn::Create | CheckOn::Both)
    }

    pub fn on_update(&self) -> bool {
        matches!(self, CheckOn::Update | CheckOn::Both)
    }
}

/// Either a uniqueness rule over `unique` or a row condition in `check`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ConstraintSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unique: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<Expr>,
    #[serde(default)]
    pub on: CheckOn,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionPattern {
    Create,
    Update,
    Delete,
    Custom,
}

impl ActionPattern {
    pub fn infer(action_name: &str) -> Self {
        let name = action_name.to_lowercase();
        if name.starts_with("create") {
            ActionPattern::Create
        } else if name.starts_with("update") {
            ActionPattern::Update
        } else if name.starts_with("delete") {
            ActionPattern::Delete
        } else {
            ActionPattern::Custom
        }
    }

    pub fn mutation_type(&self) -> &'static str {
        match self {
            ActionPattern::Create => "CREATE",
            ActionPattern::Update => "UPDATE",
            ActionPattern::Delete => "DELETE",
            ActionPattern::Custom => "CUSTOM",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ActionSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub pattern: Option<ActionPattern>,
    #[serde(default)]
    pub template: Option<PatternTemplate>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub impact: Option<ImpactSpec>,
    #[serde(default)]
    pub error_policy: Option<ErrorPolicy>,
    /// Permission condition checked before any step runs.
    #[serde(default)]
    pub requires: Option<Expr>,
    #[serde(default)]
    pub allow_hard_delete: bool,
    /// Declared output type; only `mutation_result` is accepted.
    #[serde(default)]
    pub returns: Option<String>,
}

impl ActionSpec {
    pub fn effective_pattern(&self) -> ActionPattern {
        self.pattern.unwrap_or_else(|| ActionPattern::infer(&self.name))
    }

    /// SHA-256 over the canonical JSON form, hex encoded.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        format!("{:x}", Sha256::digest(canonical.as_bytes()))
    }
}

/// One primitive unit of action behavior.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    Validate(ValidateStep),
    Insert(InsertStep),
    Update(UpdateStep),
    Delete(DeleteStep),
    If(IfStep),
    #[serde(rename = "foreach", alias = "for_each")]
    ForEach(ForEachStep),
    Call(CallStep),
    Notify(NotifyStep),
}

impl Step {
    pub fn kind(&self) -> &'static str {
        match self {
            Step::Validate(_) => "validate",
            Step::Insert(_) => "insert",
            Step::Update(_) => "update",
            Step::Delete(_) => "delete",
            Step::If(_) => "if",
            Step::ForEach(_) => "foreach",
            Step::Call(_) => "call",
            Step::Notify(_) => "notify",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ValidateStep {
    pub condition: Expr,
    /// Detail part of the `validation:<error>` status.
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct InsertStep {
    pub entity: String,
    #[serde(default)]
    pub values: BTreeMap<String, Expr>,
    #[serde(default)]
    pub store_as: Option<String>,
    /// Get-or-create: when a row matching these fields exists, bind it
    /// instead of inserting.
    #[serde(default)]
    pub reuse_existing: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct UpdateStep {
    /// Defaults to the action's own entity.
    #[serde(default)]
    pub entity: Option<String>,
    pub set: BTreeMap<String, Expr>,
    /// Defaults to the row the action was invoked on.
    #[serde(default, rename = "where")]
    pub filter: Option<Expr>,
    #[serde(default)]
    pub store_as: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DeleteStep {
    #[serde(default)]
    pub entity: Option<String>,
    #[serde(default, rename = "where")]
    pub filter: Option<Expr>,
    #[serde(default)]
    pub hard: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct IfStep {
    pub condition: Expr,
    #[serde(rename = "then", default)]
    pub then_steps: Vec<Step>,
    #[serde(rename = "else", default)]
    pub else_steps: Vec<Step>,
}

fn default_item() -> String {
    "item".to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ForEachStep {
    /// `$input.<array field>` or `ROWS(Entity WHERE ...)`.
    pub collection: Expr,
    #[serde(rename = "as", default = "default_item")]
    pub item: String,
    pub body: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CallStep {
    /// `action` or `Entity.action`.
    pub action: String,
    #[serde(default)]
    pub args: BTreeMap<String, Expr>,
    #[serde(default)]
    pub non_fatal: bool,
    #[serde(default)]
    pub store_as: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NotifyStep {
    pub event: String,
    #[serde(default)]
    pub payload: BTreeMap<String, Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ImpactEntry {
    pub entity: String,
    pub operation: Operation,
    #[serde(default)]
    pub fields: Vec<String>,
}

fn default_strategy() -> String {
    "invalidate".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CacheInvalidation {
    pub query: String,
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ImpactSpec {
    pub primary: ImpactEntry,
    #[serde(default)]
    pub side_effects: Vec<ImpactEntry>,
    #[serde(default)]
    pub cache_invalidations: Vec<CacheInvalidation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorMode {
    #[default]
    StopOnError,
    ContinueOnError,
}

fn default_max_errors() -> usize {
    100
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct ErrorPolicy {
    #[serde(default)]
    pub mode: ErrorMode,
    /// Upper bound on recorded per-item failures; failures past it are
    /// still counted.
    #[serde(default = "default_max_errors")]
    pub max_errors: usize,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self {
            mode: ErrorMode::StopOnError,
            max_errors: default_max_errors(),
        }
    }
}

/// Higher-level templates expanded into primitive steps before compilation.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PatternTemplate {
    StateMachine(StateMachineTemplate),
    MultiEntity(MultiEntityTemplate),
    Batch(BatchTemplate),
}

impl PatternTemplate {
    pub fn kind(&self) -> &'static str {
        match self {
            PatternTemplate::StateMachine(_) => "state_machine",
            PatternTemplate::MultiEntity(_) => "multi_entity",
            PatternTemplate::Batch(_) => "batch",
        }
    }
}

fn default_state_field() -> String {
    "status".to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StateMachineTemplate {
    #[serde(default = "default_state_field")]
    pub state_field: String,
    pub from_states: Vec<String>,
    pub to_state: String,
    #[serde(default)]
    pub validations: Vec<ValidateStep>,
    /// Input fields copied onto the row alongside the state change.
    #[serde(default)]
    pub input_fields: Vec<String>,
    /// Additional `update`/`insert` steps run after the transition.
    #[serde(default)]
    pub side_effects: Vec<Step>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityOpKind {
    GetOrCreate,
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EntityOperation {
    pub op: EntityOpKind,
    pub entity: String,
    #[serde(default)]
    pub values: BTreeMap<String, Expr>,
    #[serde(default)]
    pub set: BTreeMap<String, Expr>,
    #[serde(default, rename = "where")]
    pub filter: Option<Expr>,
    /// Lookup fields for `get_or_create`.
    #[serde(default, rename = "match")]
    pub match_on: Vec<String>,
    #[serde(default)]
    pub store_as: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MultiEntityTemplate {
    pub operations: Vec<EntityOperation>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BatchTemplate {
    /// Input field holding the JSON array of items.
    pub items: String,
    #[serde(default = "default_item")]
    pub item: String,
    pub operation: Box<Step>,
    #[serde(default)]
    pub error_policy: Option<ErrorPolicy>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_type_syntax() {
        let parse = |s: &str| FieldType::try_from(s.to_string());
        assert_eq!(parse("text"), Ok(FieldType::Scalar(ScalarType::Text)));
        assert_eq!(parse("email"), Ok(FieldType::Rich(RichType::Email)));
        assert_eq!(parse("phoneNumber"), Ok(FieldType::Rich(RichType::Phone)));
        assert_eq!(parse("ref(Company)"), Ok(FieldType::Ref("Company".to_string())));
        assert_eq!(
            parse("enum(lead, qualified)"),
            Ok(FieldType::Enum(vec!["lead".to_string(), "qualified".to_string()]))
        );
        assert!(parse("ref()").is_err());
        assert!(parse("blob").is_err());
        assert_eq!(
            FieldType::Enum(vec!["a".into(), "b".into()]).to_string(),
            "enum(a, b)"
        );
    }

    #[test]
    fn test_reference_column_name() {
        let field: FieldSpec =
            serde_json::from_value(json!({"name": "company", "type": "ref(Company)"})).unwrap();
        assert_eq!(field.column_name(), "fk_company");
        assert_eq!(field.reference(), Some("Company"));
        assert!(field.nullable);
    }

    #[test]
    fn test_pattern_inference() {
        assert_eq!(ActionPattern::infer("create_contact"), ActionPattern::Create);
        assert_eq!(ActionPattern::infer("update_price"), ActionPattern::Update);
        assert_eq!(ActionPattern::infer("delete_contact"), ActionPattern::Delete);
        assert_eq!(ActionPattern::infer("qualify_lead"), ActionPattern::Custom);
    }

    #[test]
    fn test_step_tags() {
        let steps: Vec<Step> = serde_json::from_value(json!([
            {"type": "validate", "condition": "status = 'lead'", "error": "not_lead"},
            {"type": "foreach", "collection": "$input.items", "as": "line", "body": [
                {"type": "notify", "event": "line_seen", "payload": {"id": "line.id"}}
            ]},
            {"type": "if", "condition": "$input.vip = TRUE", "then": [
                {"type": "update", "set": {"tier": "'gold'"}}
            ]}
        ]))
        .unwrap();
        assert_eq!(steps.len(), 3);
        match &steps[1] {
            Step::ForEach(fe) => {
                assert_eq!(fe.item, "line");
                assert_eq!(fe.body.len(), 1);
            }
            other => panic!("expected foreach, got {:?}", other),
        }
        match &steps[2] {
            Step::If(step) => assert!(step.else_steps.is_empty()),
            other => panic!("expected if, got {:?}", other),
        }
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let action: ActionSpec = serde_json::from_value(json!({
            "name": "qualify_lead",
            "steps": [{"type": "update", "set": {"status": "'qualified'"}}]
        }))
        .unwrap();
        let again = action.clone();
        assert_eq!(action.fingerprint(), again.fingerprint());
        assert_eq!(action.fingerprint().len(), 64);
    }
}

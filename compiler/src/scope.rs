//! Compilation context for one action and the name scope threaded through
//! its steps.

use crate::error::{CompileError, ErrorKind, StepPath};
use crate::ir::{LocalDecl, LocalType, SqlType, TableRef};
use specql_model::{
    suggestion_names, ActionPattern, ActionSpec, EntityCatalog, EntitySpec, ErrorPolicy,
};
use std::collections::{BTreeMap, HashSet};

/// What a name introduced by a step refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    /// A JSON loop item.
    Item { var: String },
    /// A full row of `entity`: a stored alias or a row loop variable.
    Row { entity: String, record: String },
    /// The result of a nested action call.
    Call { record: String },
}

/// Lexical scope: one frame per branch or loop body.
#[derive(Debug, Clone)]
pub struct Scope {
    frames: Vec<BTreeMap<String, Binding>>,
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl Scope {
    pub fn new() -> Self {
        Self {
            frames: vec![BTreeMap::new()],
        }
    }

    pub fn push(&mut self) {
        self.frames.push(BTreeMap::new());
    }

    pub fn pop(&mut self) {
        if self.frames.len() > 1 {
            self.frames.pop();
        }
    }

    /// Bind `name` in the innermost frame. Shadowing an outer name is rejected.
    pub fn bind(&mut self, name: &str, binding: Binding) -> Result<(), ErrorKind> {
        if self.lookup(name).is_some() {
            return Err(ErrorKind::DuplicateBinding {
                name: name.to_string(),
            });
        }
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(name.to_string(), binding);
        }
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<&Binding> {
        self.frames.iter().rev().find_map(|frame| frame.get(name))
    }

    pub fn names(&self) -> Vec<&str> {
        self.frames
            .iter()
            .flat_map(|frame| frame.keys().map(String::as_str))
            .collect()
    }

    pub fn unknown(&self, name: &str) -> ErrorKind {
        ErrorKind::UnknownBinding {
            name: name.to_string(),
            suggestions: suggestion_names(name, &self.names()),
        }
    }
}

/// Per-action compile state: the catalog, where in the step tree we are,
/// and the PL/pgSQL locals the compiled ops need.
pub struct ActionContext<'a> {
    pub catalog: &'a EntityCatalog,
    pub entity: &'a EntitySpec,
    pub action: &'a ActionSpec,
    pub pattern: ActionPattern,
    pub table: TableRef,
    pub error_policy: ErrorPolicy,
    path: Vec<String>,
    locals: Vec<LocalDecl>,
    taken: HashSet<String>,
    has_current: bool,
    primary_written: bool,
    loop_depth: usize,
    branch_depth: usize,
    batch_policy: Option<ErrorPolicy>,
}

/// Locals every generated function declares itself.
pub const RESERVED_LOCALS: &[&str] = &[
    "v_result",
    "v_current",
    "v_pk",
    "v_payload_before",
    "v_updated_fields",
    "v_changed",
    "v_conflict",
    "v_new_id",
    "v_processed_count",
    "v_failed_count",
    "v_failed_items",
    "v_errors_truncated",
];

impl<'a> ActionContext<'a> {
    pub fn new(
        catalog: &'a EntityCatalog,
        entity: &'a EntitySpec,
        action: &'a ActionSpec,
        error_policy: ErrorPolicy,
        has_current: bool,
    ) -> Self {
        Self {
            catalog,
            entity,
            action,
            pattern: action.effective_pattern(),
            table: TableRef::new(catalog, entity),
            error_policy,
            path: Vec::new(),
            locals: Vec::new(),
            taken: RESERVED_LOCALS.iter().map(|s| s.to_string()).collect(),
            has_current,
            primary_written: false,
            loop_depth: 0,
            branch_depth: 0,
            batch_policy: None,
        }
    }

    pub fn error(&self, kind: ErrorKind) -> CompileError {
        CompileError {
            path: StepPath {
                entity: self.entity.name.clone(),
                action: self.action.name.clone(),
                segments: self.path.clone(),
            },
            kind,
        }
    }

    /// Run `f` with `segment` appended to the step path.
    pub fn at<T>(&mut self, segment: impl Into<String>, f: impl FnOnce(&mut Self) -> T) -> T {
        self.path.push(segment.into());
        let out = f(self);
        self.path.pop();
        out
    }

    /// Declare a fresh local named after `base`, suffixed on collision.
    pub fn declare(&mut self, base: &str, ty: LocalType) -> String {
        let mut name = base.to_string();
        let mut n = 2;
        while self.taken.contains(&name) {
            name = format!("{}_{}", base, n);
            n += 1;
        }
        self.taken.insert(name.clone());
        self.locals.push(LocalDecl {
            name: name.clone(),
            ty,
        });
        name
    }

    pub fn declare_scalar(&mut self, base: &str, ty: SqlType) -> String {
        self.declare(base, LocalType::Scalar(ty))
    }

    pub fn locals(&self) -> &[LocalDecl] {
        &self.locals
    }

    pub fn into_locals(self) -> Vec<LocalDecl> {
        self.locals
    }

    /// Entity and table for `name`, with suggestions when unknown.
    pub fn target(&self, name: &str) -> Result<(&'a EntitySpec, TableRef), ErrorKind> {
        let entity = self.catalog.entity(name).map_err(ErrorKind::from)?;
        Ok((entity, TableRef::new(self.catalog, entity)))
    }

    /// Whether the action loads the row it was invoked on.
    pub fn has_current(&self) -> bool {
        self.has_current
    }

    pub fn is_top_level(&self) -> bool {
        self.loop_depth == 0 && self.branch_depth == 0
    }

    pub fn loop_depth(&self) -> usize {
        self.loop_depth
    }

    pub fn enter_loop(&mut self) {
        self.loop_depth += 1;
    }

    pub fn leave_loop(&mut self) {
        self.loop_depth = self.loop_depth.saturating_sub(1);
    }

    pub fn enter_branch(&mut self) {
        self.branch_depth += 1;
    }

    pub fn leave_branch(&mut self) {
        self.branch_depth = self.branch_depth.saturating_sub(1);
    }

    /// Claim the primary insert: the first top-level insert into the
    /// action's own entity, when no row was loaded up front.
    pub fn claim_primary(&mut self, entity: &str) -> bool {
        if self.primary_written || self.has_current || !self.is_top_level() {
            return false;
        }
        if entity != self.entity.name {
            return false;
        }
        self.primary_written = true;
        true
    }

    pub fn set_batch_policy(&mut self, policy: ErrorPolicy) {
        if self.batch_policy.is_none() {
            self.batch_policy = Some(policy);
        }
    }

    pub fn batch_policy(&self) -> Option<ErrorPolicy> {
        self.batch_policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_frames() {
        let mut scope = Scope::new();
        scope
            .bind(
                "company",
                Binding::Row {
                    entity: "Company".into(),
                    record: "v_company".into(),
                },
            )
            .unwrap();
        scope.push();
        scope
            .bind("line", Binding::Item { var: "v_line".into() })
            .unwrap();
        assert!(scope.lookup("company").is_some());
        assert!(matches!(
            scope.bind("line", Binding::Item { var: "x".into() }),
            Err(ErrorKind::DuplicateBinding { .. })
        ));
        scope.pop();
        assert!(scope.lookup("line").is_none());
        match scope.unknown("compnay") {
            ErrorKind::UnknownBinding { suggestions, .. } => {
                assert_eq!(suggestions, vec!["company".to_string()])
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}

//! Read-only entity catalog and registry snapshot used during compilation

use crate::error::{LookupError, LookupSection, SpecError};
use crate::search::{suggest_similar, suggestion_names, DEFAULT_MAX_DISTANCE};
use crate::types::{ActionSpec, EntitySpec, FieldSpec, SpecDocument, SYSTEM_COLUMNS};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Where an entity's rows live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableLocation {
    pub schema: String,
    pub table: String,
}

impl TableLocation {
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct TableOverride {
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
}

/// Storage locations already assigned by the naming registry, keyed by
/// entity name. Entities without an entry use `<schema>.tb_<snake_name>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct RegistrySnapshot {
    tables: BTreeMap<String, TableOverride>,
}

impl RegistrySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(
        mut self,
        entity: impl Into<String>,
        schema: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        self.tables.insert(
            entity.into(),
            TableOverride {
                schema: Some(schema.into()),
                table: Some(table.into()),
            },
        );
        self
    }

    pub fn location(&self, entity: &EntitySpec) -> TableLocation {
        let over = self.tables.get(&entity.name);
        TableLocation {
            schema: over
                .and_then(|o| o.schema.clone())
                .unwrap_or_else(|| entity.schema.clone()),
            table: over
                .and_then(|o| o.table.clone())
                .unwrap_or_else(|| entity.default_table_name()),
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &TableOverride)> {
        self.tables.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// All entities of a compilation run, validated and indexed by name.
#[derive(Debug, Clone)]
pub struct EntityCatalog {
    entities: Vec<EntitySpec>,
    index: HashMap<String, usize>,
    registry: RegistrySnapshot,
}

impl EntityCatalog {
    pub fn new(doc: SpecDocument) -> Result<Self, SpecError> {
        Self::with_registry(doc, RegistrySnapshot::default())
    }

    pub fn with_registry(doc: SpecDocument, registry: RegistrySnapshot) -> Result<Self, SpecError> {
        let mut index = HashMap::new();
        for (i, entity) in doc.entities.iter().enumerate() {
            if index.insert(entity.name.clone(), i).is_some() {
                return Err(invalid(&entity.name, "entity declared more than once"));
            }
        }
        for entity in &doc.entities {
            validate_entity(entity, &index)?;
        }
        for name in registry.tables.keys() {
            if !index.contains_key(name) {
                tracing::warn!(entity = %name, "registry entry for unknown entity");
            }
        }
        Ok(Self {
            entities: doc.entities,
            index,
            registry,
        })
    }

    /// Entities in declaration order.
    pub fn entities(&self) -> &[EntitySpec] {
        &self.entities
    }

    pub fn entity(&self, name: &str) -> Result<&EntitySpec, LookupError> {
        match self.index.get(name) {
            Some(&i) => Ok(&self.entities[i]),
            None => {
                let names = self.entity_names();
                Err(LookupError::NotFound {
                    input: name.to_string(),
                    section: LookupSection::Entity,
                    suggestions: suggest_similar(name, &names, DEFAULT_MAX_DISTANCE),
                    available: names.iter().map(|s| s.to_string()).collect(),
                })
            }
        }
    }

    pub fn entity_names(&self) -> Vec<&str> {
        self.entities.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn location(&self, entity: &EntitySpec) -> TableLocation {
        self.registry.location(entity)
    }

    pub fn registry(&self) -> &RegistrySnapshot {
        &self.registry
    }

    /// Every (entity, field) pair holding a reference to `target`.
    pub fn referencing(&self, target: &str) -> Vec<(&EntitySpec, &FieldSpec)> {
        self.entities
            .iter()
            .flat_map(|e| {
                e.fields
                    .iter()
                    .filter(move |f| f.reference() == Some(target))
                    .map(move |f| (e, f))
            })
            .collect()
    }

    /// Resolve `action` or `Entity.action`. Unqualified names are looked up on
    /// `caller` first, then across the catalog; more than one match elsewhere
    /// is ambiguous.
    pub fn find_action(
        &self,
        reference: &str,
        caller: &EntitySpec,
    ) -> Result<(&EntitySpec, &ActionSpec), LookupError> {
        if let Some((entity_name, action_name)) = reference.split_once('.') {
            let entity = self.entity(entity_name)?;
            return entity
                .action(action_name)
                .map(|a| (entity, a))
                .ok_or_else(|| self.action_not_found(reference));
        }

        if let Ok(entity) = self.entity(&caller.name) {
            if let Some(action) = entity.action(reference) {
                return Ok((entity, action));
            }
        }

        let matches: Vec<(&EntitySpec, &ActionSpec)> = self
            .entities
            .iter()
            .filter_map(|e| e.action(reference).map(|a| (e, a)))
            .collect();
        match matches.len() {
            0 => Err(self.action_not_found(reference)),
            1 => Ok(matches[0]),
            _ => Err(LookupError::Ambiguous {
                input: reference.to_string(),
                section: LookupSection::Action,
                candidates: matches
                    .iter()
                    .map(|(e, a)| format!("{}.{}", e.name, a.name))
                    .collect(),
            }),
        }
    }

    fn action_not_found(&self, reference: &str) -> LookupError {
        let qualified: Vec<String> = self
            .entities
            .iter()
            .flat_map(|e| e.actions.iter().map(move |a| format!("{}.{}", e.name, a.name)))
            .collect();
        let mut candidates: Vec<&str> = qualified.iter().map(String::as_str).collect();
        let bare = reference.rsplit('.').next().unwrap_or(reference);
        let action_names: Vec<&str> = self
            .entities
            .iter()
            .flat_map(|e| e.actions.iter().map(|a| a.name.as_str()))
            .collect();
        candidates.extend(action_names);
        LookupError::NotFound {
            input: reference.to_string(),
            section: LookupSection::Action,
            suggestions: suggest_similar(bare, &candidates, DEFAULT_MAX_DISTANCE),
            available: qualified,
        }
    }
}

fn invalid(entity: &str, reason: impl Into<String>) -> SpecError {
    SpecError::Invalid {
        entity: entity.to_string(),
        reason: reason.into(),
    }
}

fn validate_entity(entity: &EntitySpec, index: &HashMap<String, usize>) -> Result<(), SpecError> {
    let mut seen = HashSet::new();
    let pk = entity.pk_column();
    for field in &entity.fields {
        if !seen.insert(field.name.as_str()) {
            return Err(invalid(
                &entity.name,
                format!("field '{}' declared more than once", field.name),
            ));
        }
        if SYSTEM_COLUMNS.contains(&field.name.as_str()) || field.name == pk {
            return Err(invalid(
                &entity.name,
                format!("field '{}' collides with a system column", field.name),
            ));
        }
        if let Some(target) = field.reference() {
            if !index.contains_key(target) {
                let names: Vec<&str> = index.keys().map(String::as_str).collect();
                let mut hint = String::new();
                if let Some(first) = suggestion_names(target, &names).first() {
                    hint = format!(" (did you mean {}?)", first);
                }
                return Err(invalid(
                    &entity.name,
                    format!(
                        "field '{}' references unknown entity '{}'{}",
                        field.name, target, hint
                    ),
                ));
            }
        }
    }

    let known = |name: &str| entity.field(name).is_some();
    if let Some(pattern) = &entity.identifier {
        if pattern.fields.is_empty() {
            return Err(invalid(&entity.name, "identifier pattern has no fields"));
        }
        if let Some(missing) = pattern.fields.iter().find(|f| !known(f)) {
            return Err(invalid(
                &entity.name,
                format!("identifier pattern uses unknown field '{}'", missing),
            ));
        }
    }

    for constraint in &entity.constraints {
        match (constraint.unique.is_empty(), &constraint.check) {
            (true, None) | (false, Some(_)) => {
                return Err(invalid(
                    &entity.name,
                    format!(
                        "constraint '{}' must declare exactly one of 'unique' or 'check'",
                        constraint.name
                    ),
                ))
            }
            _ => {}
        }
        if let Some(missing) = constraint.unique.iter().find(|f| !known(f)) {
            return Err(invalid(
                &entity.name,
                format!(
                    "constraint '{}' uses unknown field '{}'",
                    constraint.name, missing
                ),
            ));
        }
    }

    let mut actions = HashSet::new();
    for action in &entity.actions {
        if !actions.insert(action.name.as_str()) {
            return Err(invalid(
                &entity.name,
                format!("action '{}' declared more than once", action.name),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_spec_content;

    fn catalog(json: &str) -> Result<EntityCatalog, SpecError> {
        EntityCatalog::new(parse_spec_content(json).expect("json should parse"))
    }

    const CRM: &str = r#"{"entities": [
        {"name": "Company", "schema": "crm", "fields": [{"name": "name", "type": "text"}],
         "actions": [{"name": "archive"}]},
        {"name": "Contact", "schema": "crm",
         "fields": [{"name": "email", "type": "email"}, {"name": "company", "type": "ref(Company)"}],
         "actions": [{"name": "create_contact"}, {"name": "archive"}]}
    ]}"#;

    #[test]
    fn test_entity_lookup_suggests() {
        let cat = catalog(CRM).unwrap();
        let err = cat.entity("Contcat").unwrap_err();
        assert_eq!(err.suggestion_names()[0], "Contact");
    }

    #[test]
    fn test_registry_overrides_location() {
        let doc = parse_spec_content(CRM).unwrap();
        let registry = RegistrySnapshot::new().with_table("Contact", "crm", "tb_person");
        let cat = EntityCatalog::with_registry(doc, registry).unwrap();
        let contact = cat.entity("Contact").unwrap();
        assert_eq!(cat.location(contact).qualified(), "crm.tb_person");
        let company = cat.entity("Company").unwrap();
        assert_eq!(cat.location(company).qualified(), "crm.tb_company");
    }

    #[test]
    fn test_find_action_prefers_caller_then_detects_ambiguity() {
        let cat = catalog(CRM).unwrap();
        let contact = cat.entity("Contact").unwrap();
        let company = cat.entity("Company").unwrap();

        let (owner, _) = cat.find_action("archive", contact).unwrap();
        assert_eq!(owner.name, "Contact");

        let (owner, action) = cat.find_action("create_contact", company).unwrap();
        assert_eq!((owner.name.as_str(), action.name.as_str()), ("Contact", "create_contact"));

        let (owner, _) = cat.find_action("Company.archive", contact).unwrap();
        assert_eq!(owner.name, "Company");

        let doc = parse_spec_content(
            r#"{"entities": [{"name": "A", "actions": [{"name": "go"}]},
                             {"name": "B", "actions": [{"name": "go"}]},
                             {"name": "C"}]}"#,
        )
        .unwrap();
        let cat = EntityCatalog::new(doc).unwrap();
        let c = cat.entity("C").unwrap();
        assert!(matches!(
            cat.find_action("go", c),
            Err(LookupError::Ambiguous { .. })
        ));
        assert!(matches!(
            cat.find_action("og", c),
            Err(LookupError::NotFound { .. })
        ));
    }

    #[test]
    fn test_referencing_lists_dependents() {
        let cat = catalog(CRM).unwrap();
        let deps = cat.referencing("Company");
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].0.name, "Contact");
        assert_eq!(deps[0].1.column_name(), "fk_company");
    }

    #[test]
    fn test_validation_rejects_bad_specs() {
        assert!(catalog(r#"{"entities": [{"name": "A"}, {"name": "A"}]}"#).is_err());
        assert!(catalog(
            r#"{"entities": [{"name": "A", "fields": [{"name": "x", "type": "text"}, {"name": "x", "type": "text"}]}]}"#
        )
        .is_err());
        assert!(catalog(r#"{"entities": [{"name": "A", "fields": [{"name": "id", "type": "uuid"}]}]}"#).is_err());
        let err = catalog(
            r#"{"entities": [{"name": "Lead", "fields": [{"name": "b", "type": "ref(Compnay)"}]}, {"name": "Company"}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("did you mean Company"), "{}", err);
        assert!(catalog(
            r#"{"entities": [{"name": "A", "constraints": [{"name": "c"}]}]}"#
        )
        .is_err());
        assert!(catalog(
            r#"{"entities": [{"name": "A", "identifier": {"fields": ["nope"]}}]}"#
        )
        .is_err());
    }
}

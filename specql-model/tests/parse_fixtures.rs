use specql_model::parse::parse_spec_file;
use specql_model::{ActionPattern, EntityCatalog, PatternTemplate, Step};
use std::path::PathBuf;

fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

#[test]
fn test_parse_crm() {
    let doc = parse_spec_file(fixture_path("crm.json")).expect("should parse crm.json");
    assert_eq!(doc.entities.len(), 2, "crm should have 2 entities");

    let contact = &doc.entities[0];
    assert_eq!(contact.schema, "crm");
    assert_eq!(contact.fields.len(), 6);
    assert_eq!(contact.actions.len(), 7, "Contact should have 7 actions");
    assert_eq!(contact.pk_column(), "pk_contact");
    assert!(contact.tenant_scoped());
}

#[test]
fn test_crm_templates_and_patterns() {
    let doc = parse_spec_file(fixture_path("crm.json")).expect("should parse crm.json");
    let contact = &doc.entities[0];

    let qualify = contact.action("qualify_lead").unwrap();
    assert!(matches!(qualify.template, Some(PatternTemplate::StateMachine(_))));
    assert_eq!(qualify.effective_pattern(), ActionPattern::Custom);

    let bulk = contact.action("bulk_score").unwrap();
    match &bulk.template {
        Some(PatternTemplate::Batch(batch)) => {
            assert_eq!(batch.items, "scores");
            assert_eq!(batch.item, "entry");
            assert_eq!(batch.error_policy.map(|p| p.max_errors), Some(10));
        }
        other => panic!("expected a batch template, got {:?}", other),
    }

    let purge = contact.action("delete_contact_permanently").unwrap();
    assert_eq!(purge.effective_pattern(), ActionPattern::Delete);
    assert!(purge.allow_hard_delete);
    assert!(matches!(&purge.steps[..], [Step::Delete(d)] if d.hard));
}

#[test]
fn test_crm_catalog_references() {
    let doc = parse_spec_file(fixture_path("crm.json")).expect("should parse crm.json");
    let catalog = EntityCatalog::new(doc).expect("catalog should build");
    let referencing = catalog.referencing("Contact");
    assert_eq!(referencing.len(), 1);
    assert_eq!(referencing[0].0.name, "Note");
    assert_eq!(referencing[0].1.column_name(), "fk_contact");

    let contact = catalog.entity("Contact").unwrap();
    let (owner, action) = catalog.find_action("add_note", contact).unwrap();
    assert_eq!(owner.name, "Note");
    assert_eq!(action.name, "add_note");
}

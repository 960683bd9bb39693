use serde_json::{json, Value};
use specql_compiler::ir::TableRef;
use specql_compiler::{CallContext, FunctionGenerator, MemoryStore, MutationStatus, PlanSet, Vm};
use specql_model::parse::parse_spec_file;
use specql_model::EntityCatalog;
use std::path::PathBuf;
use uuid::Uuid;

const CONTACTS: &str = "crm.tb_contact";
const NOTES: &str = "crm.tb_note";

fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

struct Harness {
    catalog: EntityCatalog,
    plans: PlanSet,
    store: MemoryStore,
    ctx: CallContext,
}

impl Harness {
    fn new() -> Self {
        let doc = parse_spec_file(fixture_path("crm.json")).expect("should parse crm.json");
        let catalog = EntityCatalog::new(doc).expect("catalog should build");
        let plans = FunctionGenerator::new(&catalog)
            .generate()
            .expect("crm actions should compile")
            .plan_set();
        let store = MemoryStore::from_catalog(&catalog);
        Self {
            catalog,
            plans,
            store,
            ctx: CallContext::new(Uuid::new_v4(), Uuid::new_v4()),
        }
    }

    fn call(&mut self, function: &str, payload: Value) -> specql_compiler::MutationResult {
        Vm::new(&self.plans)
            .execute(&mut self.store, function, self.ctx, payload)
            .expect("execution should not error")
    }

    fn table(&self, entity: &str) -> TableRef {
        let spec = self.catalog.entity(entity).unwrap();
        TableRef::new(&self.catalog, spec)
    }

    fn create_ada(&mut self) -> Uuid {
        let result = self.call(
            "app.create_contact",
            json!({"email": "ada@example.com", "first_name": "Ada", "last_name": "Lovelace"}),
        );
        assert_eq!(result.mutation_status, MutationStatus::Success, "{:?}", result.message);
        result.entity_id.expect("created contact has an id")
    }
}

#[test]
fn test_create_then_duplicate_is_noop() {
    let mut h = Harness::new();
    let id = h.create_ada();

    let row = h.store.rows(CONTACTS)[0].clone();
    assert_eq!(row["identifier"], json!("ada-lovelace"));
    assert_eq!(row["status"], json!("lead"));
    assert_eq!(row["tenant_id"], json!(h.ctx.tenant_id.to_string()));

    let again = h.call(
        "app.create_contact",
        json!({"email": "ada@example.com", "first_name": "Augusta", "last_name": "King"}),
    );
    assert_eq!(again.mutation_status, MutationStatus::noop("already_exists"));
    assert_eq!(again.entity_id, Some(id));
    assert!(again.updated_fields.is_empty());
    assert!(again.payload_after.is_none());
    let conflict = again.metadata_field("conflict").expect("conflict metadata");
    assert_eq!(conflict["constraint"], json!("uq_contact_email"));
    assert_eq!(conflict["identifier"], json!("ada-lovelace"));

    assert_eq!(h.store.rows(CONTACTS).len(), 1);
    assert_eq!(h.store.outbox().len(), 1);
    assert_eq!(h.store.audit().len(), 2);
}

#[test]
fn test_create_reports_fields_and_side_effects() {
    let mut h = Harness::new();
    let result = h.call(
        "app.create_contact",
        json!({"email": "grace@example.com", "first_name": "Grace", "last_name": "Hopper"}),
    );
    assert_eq!(result.mutation_status, MutationStatus::Success);
    assert_eq!(result.mutation_type, "CREATE");
    assert_eq!(result.entity_name, "Contact");
    assert_eq!(result.message.as_deref(), Some("Contact created"));
    assert!(result.updated_fields.contains(&"email".to_string()));
    assert!(result.payload_before.is_none());

    let after = result.payload_after.as_ref().expect("payload after insert");
    assert_eq!(after["email"], json!("grace@example.com"));
    assert!(after.get("pk_contact").is_none());
    assert!(result.metadata_field("_meta").is_some());

    let id = result.entity_id.unwrap().to_string();
    let event = &h.store.outbox()[0];
    assert_eq!(event.event, "contact.created");
    assert_eq!(event.entity_id, json!(id));
    assert_eq!(event.tenant_id, h.ctx.tenant_id);
    assert_eq!(event.payload, json!({"email": "grace@example.com"}));

    let refresh = &h.store.refreshes()[0];
    assert_eq!(refresh.function, "crm.refresh_contact_summary");
    assert_eq!(refresh.pk, json!(1));
}

#[test]
fn test_rich_type_validation_rolls_back() {
    let mut h = Harness::new();
    let result = h.call(
        "app.create_contact",
        json!({"email": "not-an-email", "first_name": "Ada"}),
    );
    assert_eq!(result.mutation_status, MutationStatus::validation("invalid_email"));
    assert!(h.store.rows(CONTACTS).is_empty());
    assert!(h.store.outbox().is_empty());

    let missing = h.call("app.create_contact", json!({"first_name": "Ada"}));
    assert!(missing.mutation_status.is_failure());
    assert!(h.store.rows(CONTACTS).is_empty());
}

#[test]
fn test_state_machine_rejects_invalid_transition() {
    let mut h = Harness::new();
    let id = h.create_ada();

    let first = h.call("app.qualify_lead", json!({"id": id.to_string()}));
    assert_eq!(first.mutation_status, MutationStatus::Success);
    assert_eq!(first.updated_fields, vec!["status".to_string()]);
    assert_eq!(first.payload_before.as_ref().unwrap()["status"], json!("lead"));
    assert_eq!(first.payload_after.as_ref().unwrap()["status"], json!("qualified"));

    let before = h.store.rows(CONTACTS)[0].clone();
    let second = h.call("app.qualify_lead", json!({"id": id.to_string()}));
    assert_eq!(
        second.mutation_status,
        MutationStatus::validation("invalid_state_transition")
    );
    assert!(second.updated_fields.is_empty());
    assert_eq!(h.store.rows(CONTACTS)[0], &before);
}

#[test]
fn test_partial_update_reports_changed_fields_only() {
    let mut h = Harness::new();
    let id = h.create_ada();

    let result = h.call(
        "app.update_contact",
        json!({"id": id.to_string(), "first_name": "Augusta", "last_name": "Lovelace"}),
    );
    assert_eq!(result.mutation_status, MutationStatus::Success);
    assert_eq!(result.mutation_type, "UPDATE");
    assert_eq!(result.updated_fields, vec!["first_name".to_string()]);

    let row = h.store.rows(CONTACTS)[0].clone();
    assert_eq!(row["first_name"], json!("Augusta"));
    assert_eq!(row["last_name"], json!("Lovelace"));
    assert_eq!(row["email"], json!("ada@example.com"));
    assert!(row["phone"].is_null());

    let unchanged = h.call("app.update_contact", json!({"id": id.to_string()}));
    assert_eq!(unchanged.mutation_status, MutationStatus::Success);
    assert!(unchanged.updated_fields.is_empty());
}

#[test]
fn test_update_resolves_identifier() {
    let mut h = Harness::new();
    let id = h.create_ada();

    let result = h.call(
        "app.update_contact",
        json!({"id": "ada-lovelace", "score": 42}),
    );
    assert_eq!(result.mutation_status, MutationStatus::Success);
    assert_eq!(result.entity_id, Some(id));
    assert_eq!(h.store.rows(CONTACTS)[0]["score"], json!(42));

    let missing = h.call("app.update_contact", json!({"id": "nobody", "score": 1}));
    assert_eq!(missing.mutation_status, MutationStatus::validation("not_found"));
}

#[test]
fn test_soft_delete_keeps_row_resolvable() {
    let mut h = Harness::new();
    let id = h.create_ada();
    let table = h.table("Contact");

    let result = h.call("app.delete_contact", json!({"id": id.to_string()}));
    assert_eq!(result.mutation_status, MutationStatus::Success);
    assert_eq!(result.mutation_type, "DELETE");

    let row = h.store.rows(CONTACTS)[0].clone();
    assert!(!row["deleted_at"].is_null());
    assert_eq!(
        h.store.resolve_pk(&table, &id.to_string(), &h.ctx.tenant_id),
        Some(1)
    );
    assert!(h.store.active_rows(&table, &h.ctx.tenant_id).is_empty());

    let again = h.call("app.delete_contact", json!({"id": id.to_string()}));
    assert_eq!(again.mutation_status, MutationStatus::noop("already_deleted"));

    let qualify = h.call("app.qualify_lead", json!({"id": id.to_string()}));
    assert_eq!(qualify.mutation_status, MutationStatus::validation("not_found"));
}

#[test]
fn test_hard_delete_refused_with_dependents() {
    let mut h = Harness::new();
    let id = h.create_ada();
    let note = h.call(
        "app.add_note",
        json!({"contact": id.to_string(), "body": "Met at the conference"}),
    );
    assert_eq!(note.mutation_status, MutationStatus::Success);
    assert_eq!(h.store.rows(NOTES)[0]["fk_contact"], json!(1));

    let refused = h.call("app.delete_contact_permanently", json!({"id": id.to_string()}));
    assert_eq!(
        refused.mutation_status,
        MutationStatus::validation("has_dependencies")
    );
    assert_eq!(h.store.rows(CONTACTS).len(), 1);
}

#[test]
fn test_hard_delete_removes_row() {
    let mut h = Harness::new();
    let id = h.create_ada();

    let result = h.call("app.delete_contact_permanently", json!({"id": id.to_string()}));
    assert_eq!(result.mutation_status, MutationStatus::Success);
    assert_eq!(result.entity_id, Some(id));
    assert!(result.payload_after.is_none());
    assert_eq!(result.payload_before.as_ref().unwrap()["email"], json!("ada@example.com"));
    assert!(h.store.rows(CONTACTS).is_empty());
}

#[test]
fn test_unknown_reference_fails_validation() {
    let mut h = Harness::new();
    let result = h.call(
        "app.add_note",
        json!({"contact": "ghost-contact", "body": "hello"}),
    );
    assert_eq!(
        result.mutation_status,
        MutationStatus::validation("reference_not_found")
    );
    assert!(h.store.rows(NOTES).is_empty());
}

#[test]
fn test_trinity_round_trip() {
    let mut h = Harness::new();
    let id = h.create_ada();
    let table = h.table("Contact");
    let tenant = h.ctx.tenant_id;

    let by_id = h.store.resolve_pk(&table, &id.to_string(), &tenant);
    let by_identifier = h.store.resolve_pk(&table, "ada-lovelace", &tenant);
    assert_eq!(by_id, Some(1));
    assert_eq!(by_identifier, by_id);
    assert_eq!(h.store.id_of(&table, 1), json!(id.to_string()));
    assert_eq!(h.store.identifier_of(&table, 1), json!("ada-lovelace"));
    assert_eq!(h.store.resolve_pk(&table, "ada-lovelace", &Uuid::new_v4()), None);
}

#[test]
fn test_batch_continues_past_failed_items() {
    let mut h = Harness::new();
    let ada = h.create_ada();
    let grace = h
        .call(
            "app.create_contact",
            json!({"email": "grace@example.com", "first_name": "Grace", "last_name": "Hopper"}),
        )
        .entity_id
        .unwrap();

    let result = h.call(
        "app.bulk_score",
        json!({"scores": [
            {"contact": ada.to_string(), "score": 10},
            {"contact": "missing-contact", "score": 5},
            {"contact": grace.to_string(), "score": 7}
        ]}),
    );
    assert_eq!(result.mutation_status, MutationStatus::Partial("items_failed".into()));
    assert_eq!(result.message.as_deref(), Some("1 of 3 items failed"));
    assert_eq!(result.processed_count(), Some(2));
    assert_eq!(result.failed_count(), Some(1));

    let failed = result.metadata_field("failed_items").unwrap().as_array().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["index"], json!(1));
    assert_eq!(failed[0]["status"], json!("validation:not_found"));

    let scores: Vec<Value> = h
        .store
        .rows(CONTACTS)
        .iter()
        .map(|row| row["score"].clone())
        .collect();
    assert_eq!(scores, vec![json!(10), json!(7)]);
}

#[test]
fn test_batch_counts_cover_every_item() {
    let mut h = Harness::new();
    let ada = h.create_ada();

    let items: Vec<Value> = (0..15)
        .map(|i| {
            let contact = if i % 3 == 0 {
                ada.to_string()
            } else {
                format!("missing-{}", i)
            };
            json!({"contact": contact, "score": i})
        })
        .collect();
    let total = items.len() as u64;
    let result = h.call("app.bulk_score", json!({ "scores": items }));

    let processed = result.processed_count().unwrap();
    let failed = result.failed_count().unwrap();
    assert_eq!(processed + failed, total);
    assert_eq!(processed, 5);
    let recorded = result.metadata_field("failed_items").unwrap().as_array().unwrap();
    assert_eq!(recorded.len(), 10);
    assert_eq!(result.metadata_field("errors_truncated"), Some(&json!(false)));
    assert_eq!(h.store.rows(CONTACTS)[0]["score"], json!(12));
}

#[test]
fn test_failed_batch_item_leaves_no_updated_fields() {
    let mut h = Harness::new();
    let ada = h.create_ada();

    let result = h.call(
        "app.bulk_score",
        json!({"scores": [{"contact": ada.to_string(), "score": -5}]}),
    );
    assert_eq!(result.mutation_status, MutationStatus::Partial("items_failed".into()));
    assert_eq!(result.failed_count(), Some(1));
    assert!(result.updated_fields.is_empty(), "{:?}", result.updated_fields);
    let failed = result.metadata_field("failed_items").unwrap().as_array().unwrap();
    assert_eq!(failed[0]["status"], json!("validation:ck_contact_score"));
    assert!(h.store.rows(CONTACTS)[0]["score"].is_null());

    let mixed = h.call(
        "app.bulk_score",
        json!({"scores": [
            {"contact": ada.to_string(), "score": -1},
            {"contact": ada.to_string(), "score": 4}
        ]}),
    );
    assert_eq!(mixed.processed_count(), Some(1));
    assert_eq!(mixed.updated_fields, vec!["score".to_string()]);
    assert_eq!(h.store.rows(CONTACTS)[0]["score"], json!(4));
}

#[test]
fn test_batch_reassign_isolates_unresolvable_references() {
    let mut h = Harness::new();
    let ada = h.create_ada();
    let grace = h
        .call(
            "app.create_contact",
            json!({"email": "grace@example.com", "first_name": "Grace", "last_name": "Hopper"}),
        )
        .entity_id
        .unwrap();

    let notes: Vec<String> = (0..10)
        .map(|i| {
            let note = h.call(
                "app.add_note",
                json!({"contact": ada.to_string(), "body": format!("note {}", i)}),
            );
            assert_eq!(note.mutation_status, MutationStatus::Success);
            note.entity_id.unwrap().to_string()
        })
        .collect();

    let bad = [2, 5, 8];
    let moves: Vec<Value> = notes
        .iter()
        .enumerate()
        .map(|(i, note)| {
            let contact = if bad.contains(&i) {
                format!("ghost-{}", i)
            } else {
                grace.to_string()
            };
            json!({"id": note, "contact": contact})
        })
        .collect();
    let result = h.call("app.reassign_notes", json!({ "moves": moves }));

    assert_eq!(result.mutation_status, MutationStatus::Partial("items_failed".into()));
    assert_eq!(result.message.as_deref(), Some("3 of 10 items failed"));
    assert_eq!(result.processed_count(), Some(7));
    assert_eq!(result.failed_count(), Some(3));

    let failed = result.metadata_field("failed_items").unwrap().as_array().unwrap();
    let failed_ids: Vec<&str> = failed.iter().filter_map(|f| f["id"].as_str()).collect();
    let expected: Vec<&str> = bad.iter().map(|&i| notes[i].as_str()).collect();
    assert_eq!(failed_ids, expected);
    assert!(failed
        .iter()
        .all(|f| f["status"] == json!("validation:reference_not_found")));

    let owners: Vec<Value> = h
        .store
        .rows(NOTES)
        .iter()
        .map(|row| row["fk_contact"].clone())
        .collect();
    let expected_owners: Vec<Value> = (0..10)
        .map(|i| if bad.contains(&i) { json!(1) } else { json!(2) })
        .collect();
    assert_eq!(owners, expected_owners);
}

#[test]
fn test_empty_batch_succeeds() {
    let mut h = Harness::new();
    let result = h.call("app.bulk_score", json!({"scores": []}));
    assert_eq!(result.mutation_status, MutationStatus::Success);
    assert_eq!(result.processed_count(), Some(0));
    assert_eq!(result.failed_count(), Some(0));
}

#[test]
fn test_call_chains_actions() {
    let mut h = Harness::new();
    let result = h.call(
        "app.onboard_contact",
        json!({
            "email": "ada@example.com",
            "first_name": "Ada",
            "last_name": "Lovelace",
            "note": "Signed up"
        }),
    );
    assert_eq!(result.mutation_status, MutationStatus::Success, "{:?}", result.message);
    assert_eq!(h.store.rows(CONTACTS).len(), 1);
    assert_eq!(h.store.rows(NOTES).len(), 1);
    assert_eq!(h.store.rows(NOTES)[0]["body"], json!("Signed up"));
    assert_eq!(h.store.audit().len(), 3);
}

#[test]
fn test_failed_call_aborts_caller() {
    let mut h = Harness::new();
    let result = h.call(
        "app.onboard_contact",
        json!({"email": "nope", "first_name": "Ada", "note": "Signed up"}),
    );
    assert_eq!(result.mutation_status, MutationStatus::validation("invalid_email"));
    let failed_call = result.metadata_field("failed_call").unwrap();
    assert_eq!(failed_call["action"], json!("Contact.create_contact"));
    assert!(h.store.rows(CONTACTS).is_empty());
    assert!(h.store.rows(NOTES).is_empty());
    assert_eq!(h.store.audit().len(), 1);
}

#[test]
fn test_unknown_function_is_an_error() {
    let mut h = Harness::new();
    let err = Vm::new(&h.plans)
        .execute(&mut h.store, "app.missing", h.ctx, json!({}))
        .unwrap_err();
    assert!(err.to_string().contains("app.missing"));
}

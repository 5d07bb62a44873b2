mod common;

use common::{entity, manager_with, sequence_registry, started_manager};
use rustormdb::core::{OrmError, Value};

#[test]
fn test_save_writes_one_insert_per_level_ancestors_first() {
    let (mut manager, handle) = started_manager();
    let employee = entity(
        "Employee",
        &[
            ("object_id", Value::Integer(1)),
            ("status", Value::Integer(1)),
            ("name", Value::Text("X".into())),
            ("salary", Value::Float(10.0)),
        ],
    );
    manager.save(&employee).unwrap();

    let inserts: Vec<String> = handle
        .sql_log()
        .into_iter()
        .filter(|sql| sql.starts_with("INSERT INTO"))
        .collect();
    assert_eq!(inserts.len(), 3);
    assert!(inserts[0].starts_with("INSERT INTO root_entity("));
    assert!(inserts[1].starts_with("INSERT INTO person("));
    assert!(inserts[2].starts_with("INSERT INTO employee("));
    // discriminator carries the concrete class, at the root level only
    assert!(inserts[0].contains("'Employee'"));
    assert!(!inserts[1].contains("_class"));
    assert!(employee.borrow().is_attached());
}

#[test]
fn test_round_trip_save_then_get() {
    let (mut manager, handle) = started_manager();
    let person = entity(
        "Person",
        &[
            ("object_id", Value::Integer(1)),
            ("name", Value::Text("A".into())),
        ],
    );
    manager.save(&person).unwrap();
    assert!(handle.executed("INSERT INTO person"));

    // row shaped like the compiled projection: name, object_id, status,
    // _class, _mtime
    handle.respond(
        "WHERE root_entity.object_id = 1",
        vec![vec![
            Value::Text("A".into()),
            Value::Integer(1),
            Value::Null,
            Value::Text("Person".into()),
            Value::Float(60.0),
        ]],
    );
    let loaded = manager.get("Person", Value::Integer(1)).unwrap().unwrap();
    assert_eq!(loaded.borrow().get("name"), Some(&Value::Text("A".into())));
}

#[test]
fn test_sequence_generator_increments_under_lock() {
    let (mut manager, handle) = manager_with(sequence_registry());
    manager.start().unwrap();
    handle.clear_log();

    let first = entity("Ticket", &[("subject", Value::Text("a".into()))]);
    let second = entity("Ticket", &[("subject", Value::Text("b".into()))]);
    manager.save(&first).unwrap();
    manager.save(&second).unwrap();

    assert_eq!(first.borrow().get("object_id"), Some(&Value::Integer(1)));
    assert_eq!(second.borrow().get("object_id"), Some(&Value::Integer(2)));
    assert!(handle.executed("LOCK TABLE id_sequence"));
}

#[test]
fn test_mandatory_field_missing_rejected() {
    let (mut manager, handle) = manager_with(sequence_registry());
    manager.start().unwrap();
    handle.clear_log();

    let ticket = entity("Ticket", &[]);
    let result = manager.save(&ticket);
    assert!(matches!(result, Err(OrmError::Validation(_))));
    assert!(!handle.executed("INSERT INTO ticket"));
}

#[test]
fn test_update_touches_only_changed_levels() {
    let (mut manager, handle) = started_manager();
    let employee = entity(
        "Employee",
        &[
            ("object_id", Value::Integer(1)),
            ("salary", Value::Float(20.0)),
        ],
    );
    manager.update(&employee).unwrap();

    let updates: Vec<String> = handle
        .sql_log()
        .into_iter()
        .filter(|sql| sql.starts_with("UPDATE"))
        .collect();
    assert_eq!(updates.len(), 1);
    assert!(updates[0].starts_with("UPDATE employee SET salary = 20.0"));
    assert!(updates[0].contains("_mtime = "));
}

#[test]
fn test_remove_deletes_leaf_first() {
    let (mut manager, handle) = started_manager();
    let employee = entity("Employee", &[("object_id", Value::Integer(1))]);
    employee.borrow_mut().attach();
    manager.remove(&employee).unwrap();

    let deletes: Vec<String> = handle
        .sql_log()
        .into_iter()
        .filter(|sql| sql.starts_with("DELETE FROM") && !sql.contains("car_person"))
        .collect();
    assert_eq!(
        deletes,
        vec![
            "DELETE FROM employee WHERE object_id = 1",
            "DELETE FROM person WHERE object_id = 1",
            "DELETE FROM root_entity WHERE object_id = 1",
        ]
    );
    // relation rows cleared as part of the removal
    assert!(handle.executed("DELETE FROM car_person WHERE person_id = 1"));
    assert!(handle.executed("UPDATE dog SET owner_id = NULL WHERE owner_id = 1"));
    assert!(!employee.borrow().is_attached());
}

#[test]
fn test_save_or_update_picks_update_when_row_exists() {
    let (mut manager, handle) = started_manager();
    handle.respond("root_entity.object_id = 5", vec![vec![Value::Integer(1)]]);

    let person = entity(
        "Person",
        &[
            ("object_id", Value::Integer(5)),
            ("name", Value::Text("B".into())),
        ],
    );
    manager.save_or_update(&person).unwrap();

    assert!(handle.executed("UPDATE person SET name = 'B'"));
    assert!(!handle.executed("INSERT INTO person"));
}

#[test]
fn test_save_or_update_inserts_missing_row() {
    let (mut manager, handle) = started_manager();
    let person = entity(
        "Person",
        &[
            ("object_id", Value::Integer(6)),
            ("name", Value::Text("C".into())),
        ],
    );
    manager.save_or_update(&person).unwrap();
    assert!(handle.executed("INSERT INTO person"));
}

mod common;

use std::rc::Rc;

use common::started_manager;
use rustormdb::core::{Row, Value};
use rustormdb::entity::RelationValue;
use rustormdb::query::Options;

/// Row shaped like the eager-cars projection: name, object_id, status,
/// _class, _mtime, cars.model, cars.object_id, cars._class, cars._mtime.
fn person_car_row(person_id: i64, name: &str, car_id: i64, model: &str) -> Row {
    vec![
        Value::Text(name.to_string()),
        Value::Integer(person_id),
        Value::Null,
        Value::Text("Person".to_string()),
        Value::Float(60.0),
        Value::Text(model.to_string()),
        Value::Integer(car_id),
        Value::Text("Car".to_string()),
        Value::Float(60.0),
    ]
}

#[test]
fn test_fanned_out_rows_collapse_to_one_instance() {
    let (mut manager, handle) = started_manager();
    handle.respond(
        "cars_car_person",
        vec![
            person_car_row(1, "Ada", 3, "sedan"),
            person_car_row(1, "Ada", 2, "coupe"),
        ],
    );

    let entities = manager
        .find("Person", Options::new().eager("cars", Options::new()))
        .unwrap()
        .entities();
    assert_eq!(entities.len(), 1);

    let person = entities[0].borrow();
    let Some(RelationValue::Many(cars)) = person.relation("cars") else {
        panic!("expected a loaded to-many slot");
    };
    assert_eq!(cars.len(), 2);
    // ascending target-id order regardless of physical row order
    assert_eq!(cars[0].borrow().get("object_id"), Some(&Value::Integer(2)));
    assert_eq!(cars[1].borrow().get("object_id"), Some(&Value::Integer(3)));
}

#[test]
fn test_repeated_gets_share_one_instance() {
    let (mut manager, handle) = started_manager();
    handle.respond(
        "WHERE root_entity.object_id = 1",
        vec![vec![
            Value::Text("Ada".to_string()),
            Value::Integer(1),
            Value::Null,
            Value::Text("Person".to_string()),
            Value::Float(60.0),
        ]],
    );

    let first = manager.get("Person", Value::Integer(1)).unwrap().unwrap();
    let second = manager.get("Person", Value::Integer(1)).unwrap().unwrap();
    assert!(Rc::ptr_eq(&first, &second));
}

#[test]
fn test_polymorphic_get_then_load_full() {
    let (mut manager, handle) = started_manager();
    // ancestor-level projection: object_id, status, _class, _mtime
    handle.respond(
        "FROM root_entity WHERE",
        vec![vec![
            Value::Integer(1),
            Value::Integer(1),
            Value::Text("Employee".to_string()),
            Value::Float(60.0),
        ]],
    );
    // concrete-class projection: name, object_id, salary, status, _class, _mtime
    handle.respond(
        "FROM employee",
        vec![vec![
            Value::Text("X".to_string()),
            Value::Integer(1),
            Value::Float(10.0),
            Value::Integer(1),
            Value::Text("Employee".to_string()),
            Value::Float(60.0),
        ]],
    );

    let entity = manager
        .get("RootEntity", Value::Integer(1))
        .unwrap()
        .unwrap();
    // discriminator picks the concrete class; subclass fields not yet loaded
    assert_eq!(entity.borrow().class_name(), "Employee");
    assert_eq!(entity.borrow().get("salary"), None);

    manager.load_full(&entity).unwrap();
    assert_eq!(entity.borrow().get("salary"), Some(&Value::Float(10.0)));
    assert_eq!(entity.borrow().get("name"), Some(&Value::Text("X".into())));
}

#[test]
fn test_scope_cleared_on_close() {
    let (mut manager, handle) = started_manager();
    handle.respond(
        "WHERE root_entity.object_id = 1",
        vec![vec![
            Value::Text("Ada".to_string()),
            Value::Integer(1),
            Value::Null,
            Value::Text("Person".to_string()),
            Value::Float(60.0),
        ]],
    );
    let first = manager.get("Person", Value::Integer(1)).unwrap().unwrap();

    manager.close().unwrap();
    manager.open().unwrap();
    let second = manager.get("Person", Value::Integer(1)).unwrap().unwrap();
    assert!(!Rc::ptr_eq(&first, &second));
}

#[test]
fn test_private_scope_request_skips_sharing() {
    let (mut manager, handle) = started_manager();
    handle.respond(
        "WHERE root_entity.object_id = 1",
        vec![vec![
            Value::Text("Ada".to_string()),
            Value::Integer(1),
            Value::Null,
            Value::Text("Person".to_string()),
            Value::Float(60.0),
        ]],
    );

    let query = serde_json::json!({"filters": [{"object_id": 1}], "scope": false});
    let first = manager
        .find_json("Person", &query)
        .unwrap()
        .entities()
        .into_iter()
        .next()
        .unwrap();
    let second = manager
        .find_json("Person", &query)
        .unwrap()
        .entities()
        .into_iter()
        .next()
        .unwrap();
    // each call got a scope of its own, so the instances stay distinct
    assert!(!Rc::ptr_eq(&first, &second));
}

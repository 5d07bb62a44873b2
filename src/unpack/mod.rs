//! Reconstructs entity graphs (or plain map trees) from flat result rows.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::core::{DataType, OrmError, Result, Row, Value, ValueKey};
use crate::entity::{EntityInstance, EntityRef, RelationValue, SharedScope};
use crate::query::Options;
use crate::schema::{
    Cardinality, DISCRIMINATOR_COLUMN, MODIFIED_TIME_COLUMN, SchemaRegistry,
};

/// Result of one unpack call, shaped by the options' result mode.
#[derive(Debug)]
pub enum Unpacked {
    Entities(Vec<EntityRef>),
    Maps(Vec<serde_json::Value>),
    Count(i64),
}

impl Unpacked {
    pub fn entities(self) -> Vec<EntityRef> {
        match self {
            Self::Entities(entities) => entities,
            _ => Vec::new(),
        }
    }

    pub fn maps(self) -> Vec<serde_json::Value> {
        match self {
            Self::Maps(maps) => maps,
            _ => Vec::new(),
        }
    }

    pub fn count(&self) -> i64 {
        match self {
            Self::Count(count) => *count,
            Self::Entities(entities) => entities.len() as i64,
            Self::Maps(maps) => maps.len() as i64,
        }
    }
}

/// One projection level: the root class or one eager relation path.
struct Level {
    parent: Option<usize>,
    relation: Option<(String, Cardinality)>,
    class: String,
    id_field: String,
    /// (row index, field name) pairs projected at this level.
    columns: Vec<(usize, String)>,
    id_column: Option<usize>,
    class_column: Option<usize>,
}

/// Zips rows with the compiled column order and rebuilds the graph the
/// projection flattened.
///
/// Identity interning happens per (concrete class, identifier) at every
/// path level, so two relation paths reaching the same row converge on one
/// instance.
pub struct Unpacker<'a> {
    registry: &'a SchemaRegistry,
}

impl<'a> Unpacker<'a> {
    pub fn new(registry: &'a SchemaRegistry) -> Self {
        Self { registry }
    }

    pub fn unpack(
        &self,
        class: &str,
        column_order: &[String],
        options: &Options,
        rows: &[Row],
        scope: &SharedScope,
    ) -> Result<Unpacked> {
        if options.count {
            let count = rows
                .first()
                .and_then(|row| row.first())
                .and_then(Value::as_i64)
                .unwrap_or(0);
            return Ok(Unpacked::Count(count));
        }

        let levels = self.parse_levels(class, column_order)?;
        if options.map_mode {
            self.unpack_maps(&levels, rows)
        } else {
            self.unpack_entities(&levels, rows, scope)
        }
    }

    /// Group the logical column paths into levels, parents before children.
    ///
    /// The compiler emits columns depth-first, so a child path's parent
    /// level is always registered by the time the child appears.
    fn parse_levels(&self, class: &str, column_order: &[String]) -> Result<Vec<Level>> {
        let mut levels = vec![Level {
            parent: None,
            relation: None,
            class: class.to_string(),
            id_field: self.registry.get_id(class)?.to_string(),
            columns: Vec::new(),
            id_column: None,
            class_column: None,
        }];
        let mut by_path: HashMap<String, usize> = HashMap::new();
        by_path.insert(String::new(), 0);

        for (idx, logical) in column_order.iter().enumerate() {
            let (path, field) = match logical.rsplit_once('.') {
                Some((path, field)) => (path.to_string(), field.to_string()),
                None => (String::new(), logical.clone()),
            };
            let level_idx = match by_path.get(&path) {
                Some(existing) => *existing,
                None => {
                    let (parent_path, rel_name) = match path.rsplit_once('.') {
                        Some((parent, rel)) => (parent.to_string(), rel.to_string()),
                        None => (String::new(), path.clone()),
                    };
                    let parent_idx = *by_path.get(&parent_path).ok_or_else(|| {
                        OrmError::Validation(format!(
                            "Column path '{logical}' references an unprojected level"
                        ))
                    })?;
                    let parent_class = levels[parent_idx].class.clone();
                    let relation = self.registry.get_relation(&parent_class, &rel_name)?;
                    let cardinality = relation.cardinality;
                    let target = self.registry.get_target(&parent_class, &rel_name)?;
                    levels.push(Level {
                        parent: Some(parent_idx),
                        relation: Some((rel_name, cardinality)),
                        class: target.name().to_string(),
                        id_field: self.registry.get_id(target.name())?.to_string(),
                        columns: Vec::new(),
                        id_column: None,
                        class_column: None,
                    });
                    let new_idx = levels.len() - 1;
                    by_path.insert(path.clone(), new_idx);
                    new_idx
                }
            };

            let level = &mut levels[level_idx];
            if field == level.id_field {
                level.id_column = Some(idx);
            }
            if field == DISCRIMINATOR_COLUMN {
                level.class_column = Some(idx);
            }
            level.columns.push((idx, field));
        }
        Ok(levels)
    }

    // ------------------------------------------------------------------
    // Entity mode
    // ------------------------------------------------------------------

    fn unpack_entities(
        &self,
        levels: &[Level],
        rows: &[Row],
        scope: &SharedScope,
    ) -> Result<Unpacked> {
        let mut roots: Vec<EntityRef> = Vec::new();
        let mut seen_roots: HashSet<usize> = HashSet::new();
        let mut scope = scope.borrow_mut();

        for row in rows {
            let mut row_refs: Vec<Option<EntityRef>> = vec![None; levels.len()];

            for (level_idx, level) in levels.iter().enumerate() {
                let id_value = level
                    .id_column
                    .and_then(|idx| row.get(idx))
                    .cloned()
                    .unwrap_or(Value::Null);

                if id_value.is_null() {
                    // left-join miss: the relation is loaded but empty
                    if let Some((rel_name, cardinality)) = &level.relation
                        && let Some(parent) =
                            level.parent.and_then(|p| row_refs[p].clone())
                    {
                        let mut parent = parent.borrow_mut();
                        if parent.relation(rel_name).is_none_or(RelationValue::is_lazy) {
                            let empty = match cardinality {
                                Cardinality::ToOne => RelationValue::One(None),
                                Cardinality::ToMany => RelationValue::Many(Vec::new()),
                            };
                            parent.set_relation(rel_name.clone(), empty);
                        }
                    }
                    continue;
                }

                let concrete = self.concrete_class(level, row);
                let concrete_meta = self.registry.get(&concrete)?;
                let entity = scope.intern(&concrete, &id_value, || {
                    EntityInstance::from_meta(concrete_meta)
                });

                {
                    let mut instance = entity.borrow_mut();
                    for (idx, field) in &level.columns {
                        let Some(raw) = row.get(*idx) else {
                            continue;
                        };
                        if field == DISCRIMINATOR_COLUMN {
                            continue;
                        }
                        let coerced = if field == MODIFIED_TIME_COLUMN {
                            raw.clone().coerce(DataType::Date)?
                        } else {
                            let data_type = concrete_meta
                                .all_fields()
                                .get(field)
                                .map(|f| f.data_type)
                                .ok_or_else(|| {
                                    OrmError::FieldNotFound(field.clone(), concrete.clone())
                                })?;
                            raw.clone().coerce(data_type)?
                        };
                        instance.set(field.clone(), coerced);
                    }
                    instance.attach();
                }

                if let Some((rel_name, cardinality)) = &level.relation {
                    if let Some(parent) = level.parent.and_then(|p| row_refs[p].clone()) {
                        let mut parent = parent.borrow_mut();
                        match cardinality {
                            Cardinality::ToOne => {
                                parent.set_relation(
                                    rel_name.clone(),
                                    RelationValue::One(Some(entity.clone())),
                                );
                            }
                            Cardinality::ToMany => {
                                let slot = parent
                                    .relation_mut(rel_name)
                                    .filter(|slot| !slot.is_lazy());
                                match slot {
                                    Some(slot) => slot.push_unique(entity.clone()),
                                    None => parent.set_relation(
                                        rel_name.clone(),
                                        RelationValue::Many(vec![entity.clone()]),
                                    ),
                                }
                            }
                        }
                    }
                } else if seen_roots.insert(Rc::as_ptr(&entity) as usize) {
                    roots.push(entity.clone());
                }

                row_refs[level_idx] = Some(entity);
            }
        }
        drop(scope);

        // deterministic ordering independent of physical row order
        let mut visited = HashSet::new();
        for root in &roots {
            self.sort_collections(root, &mut visited);
        }
        Ok(Unpacked::Entities(roots))
    }

    fn concrete_class(&self, level: &Level, row: &Row) -> String {
        if let Some(idx) = level.class_column
            && let Some(Value::Text(name)) = row.get(idx)
            && self.registry.contains(name)
            && self.registry.is_subclass(name, &level.class)
        {
            return name.clone();
        }
        level.class.clone()
    }

    /// Recursively sort every to-many collection ascending by target id.
    fn sort_collections(&self, entity: &EntityRef, visited: &mut HashSet<usize>) {
        if !visited.insert(Rc::as_ptr(entity) as usize) {
            return;
        }
        let rel_names: Vec<String> = entity.borrow().relations().keys().cloned().collect();
        for name in rel_names {
            let children: Vec<EntityRef> = match entity.borrow().relation(&name) {
                Some(RelationValue::Many(items)) => items.clone(),
                Some(RelationValue::One(Some(child))) => {
                    vec![child.clone()]
                }
                _ => Vec::new(),
            };
            for child in &children {
                self.sort_collections(child, visited);
            }
            let is_many =
                matches!(entity.borrow().relation(&name), Some(RelationValue::Many(_)));
            if is_many {
                let mut sorted = children;
                sorted.sort_by(|a, b| {
                    let key_a = self.id_of(a);
                    let key_b = self.id_of(b);
                    key_a
                        .compare(&key_b)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                entity
                    .borrow_mut()
                    .set_relation(name, RelationValue::Many(sorted));
            }
        }
    }

    fn id_of(&self, entity: &EntityRef) -> Value {
        let instance = entity.borrow();
        self.registry
            .get_id(instance.class_name())
            .ok()
            .and_then(|id_field| instance.get(id_field).cloned())
            .unwrap_or(Value::Null)
    }

    // ------------------------------------------------------------------
    // Map mode
    // ------------------------------------------------------------------

    fn unpack_maps(&self, levels: &[Level], rows: &[Row]) -> Result<Unpacked> {
        struct MapNode {
            id: Value,
            fields: serde_json::Map<String, serde_json::Value>,
            to_one: Vec<(String, Option<usize>)>,
            to_many: Vec<(String, Vec<usize>)>,
        }

        let mut arena: Vec<MapNode> = Vec::new();
        let mut index: HashMap<(usize, ValueKey), usize> = HashMap::new();
        let mut roots: Vec<usize> = Vec::new();

        for row in rows {
            let mut row_nodes: Vec<Option<usize>> = vec![None; levels.len()];

            for (level_idx, level) in levels.iter().enumerate() {
                let id_value = level
                    .id_column
                    .and_then(|idx| row.get(idx))
                    .cloned()
                    .unwrap_or(Value::Null);
                if id_value.is_null() {
                    if let Some((rel_name, cardinality)) = &level.relation
                        && let Some(parent_idx) =
                            level.parent.and_then(|p| row_nodes[p])
                    {
                        let parent = &mut arena[parent_idx];
                        match cardinality {
                            Cardinality::ToOne => {
                                if !parent.to_one.iter().any(|(n, _)| n == rel_name) {
                                    parent.to_one.push((rel_name.clone(), None));
                                }
                            }
                            Cardinality::ToMany => {
                                if !parent.to_many.iter().any(|(n, _)| n == rel_name) {
                                    parent.to_many.push((rel_name.clone(), Vec::new()));
                                }
                            }
                        }
                    }
                    continue;
                }

                let concrete = self.concrete_class(level, row);
                let concrete_meta = self.registry.get(&concrete)?;
                let key = (level_idx, ValueKey(id_value.clone()));
                let node_idx = match index.get(&key) {
                    Some(existing) => *existing,
                    None => {
                        let mut fields = serde_json::Map::new();
                        for (idx, field) in &level.columns {
                            let Some(raw) = row.get(*idx) else {
                                continue;
                            };
                            let coerced = if field == DISCRIMINATOR_COLUMN {
                                raw.clone()
                            } else if field == MODIFIED_TIME_COLUMN {
                                raw.clone().coerce(DataType::Date)?
                            } else {
                                let data_type = concrete_meta
                                    .all_fields()
                                    .get(field)
                                    .map(|f| f.data_type)
                                    .ok_or_else(|| {
                                        OrmError::FieldNotFound(field.clone(), concrete.clone())
                                    })?;
                                raw.clone().coerce(data_type)?
                            };
                            fields.insert(field.clone(), coerced.to_json());
                        }
                        arena.push(MapNode {
                            id: id_value.clone(),
                            fields,
                            to_one: Vec::new(),
                            to_many: Vec::new(),
                        });
                        let new_idx = arena.len() - 1;
                        index.insert(key, new_idx);
                        new_idx
                    }
                };

                if let Some((rel_name, cardinality)) = &level.relation {
                    if let Some(parent_idx) = level.parent.and_then(|p| row_nodes[p]) {
                        let parent = &mut arena[parent_idx];
                        match cardinality {
                            Cardinality::ToOne => {
                                match parent.to_one.iter_mut().find(|(n, _)| n == rel_name) {
                                    Some(slot) => slot.1 = Some(node_idx),
                                    None => {
                                        parent.to_one.push((rel_name.clone(), Some(node_idx)));
                                    }
                                }
                            }
                            Cardinality::ToMany => {
                                match parent.to_many.iter_mut().find(|(n, _)| n == rel_name) {
                                    Some((_, items)) => {
                                        if !items.contains(&node_idx) {
                                            items.push(node_idx);
                                        }
                                    }
                                    None => {
                                        parent
                                            .to_many
                                            .push((rel_name.clone(), vec![node_idx]));
                                    }
                                }
                            }
                        }
                    }
                } else if !roots.contains(&node_idx) {
                    roots.push(node_idx);
                }

                row_nodes[level_idx] = Some(node_idx);
            }
        }

        fn render(arena: &[MapNode], idx: usize) -> serde_json::Value {
            let node = &arena[idx];
            let mut map = node.fields.clone();
            for (name, child) in &node.to_one {
                let rendered = match child {
                    Some(child_idx) => render(arena, *child_idx),
                    None => serde_json::Value::Null,
                };
                map.insert(name.clone(), rendered);
            }
            for (name, children) in &node.to_many {
                let mut ordered = children.clone();
                ordered.sort_by(|a, b| {
                    arena[*a]
                        .id
                        .compare(&arena[*b].id)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                map.insert(
                    name.clone(),
                    serde_json::Value::Array(
                        ordered.iter().map(|child| render(arena, *child)).collect(),
                    ),
                );
            }
            serde_json::Value::Object(map)
        }

        Ok(Unpacked::Maps(
            roots.iter().map(|idx| render(&arena, *idx)).collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DataType;
    use crate::entity::IdentityScope;
    use crate::schema::{EntityClass, FieldDef, RelationDef};

    fn registry() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        registry
            .register(
                EntityClass::builder("RootEntity")
                    .id(FieldDef::new("object_id", DataType::Integer))
                    .field(FieldDef::new("status", DataType::Integer))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
            .register(
                EntityClass::builder("Person")
                    .parent("RootEntity")
                    .field(FieldDef::new("name", DataType::Text))
                    .relation(RelationDef::to_many("cars", "Car").reverse("owners"))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
            .register(
                EntityClass::builder("Employee")
                    .parent("Person")
                    .field(FieldDef::new("salary", DataType::Float))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
            .register(
                EntityClass::builder("Car")
                    .id(FieldDef::new("object_id", DataType::Integer))
                    .field(FieldDef::new("model", DataType::Text))
                    .relation(RelationDef::to_many("owners", "Person").reverse("cars"))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
    }

    fn person_with_cars_columns() -> Vec<String> {
        [
            "name",
            "object_id",
            "status",
            "_class",
            "_mtime",
            "cars.model",
            "cars.object_id",
            "cars._class",
            "cars._mtime",
        ]
        .iter()
        .map(ToString::to_string)
        .collect()
    }

    fn person_row(person_id: i64, name: &str, car_id: Option<i64>, model: &str) -> Row {
        vec![
            Value::Text(name.to_string()),
            Value::Integer(person_id),
            Value::Integer(1),
            Value::Text("Person".to_string()),
            Value::Float(10.0),
            car_id
                .map(|_| Value::Text(model.to_string()))
                .unwrap_or(Value::Null),
            car_id.map(Value::Integer).unwrap_or(Value::Null),
            car_id
                .map(|_| Value::Text("Car".to_string()))
                .unwrap_or(Value::Null),
            car_id.map(|_| Value::Float(10.0)).unwrap_or(Value::Null),
        ]
    }

    #[test]
    fn test_fan_out_collapses_to_one_root() {
        let registry = registry();
        let unpacker = Unpacker::new(&registry);
        let scope = IdentityScope::shared();
        let rows = vec![
            person_row(1, "A", Some(20), "sedan"),
            person_row(1, "A", Some(10), "coupe"),
        ];
        let unpacked = unpacker
            .unpack(
                "Person",
                &person_with_cars_columns(),
                &Options::new(),
                &rows,
                &scope,
            )
            .unwrap();
        let entities = unpacked.entities();
        assert_eq!(entities.len(), 1);
        let person = entities[0].borrow();
        let Some(RelationValue::Many(cars)) = person.relation("cars") else {
            panic!("expected a loaded to-many slot");
        };
        assert_eq!(cars.len(), 2);
        // sorted ascending by id, not physical row order
        assert_eq!(cars[0].borrow().get("object_id"), Some(&Value::Integer(10)));
        assert_eq!(cars[1].borrow().get("object_id"), Some(&Value::Integer(20)));
    }

    #[test]
    fn test_left_join_miss_loads_empty_collection() {
        let registry = registry();
        let unpacker = Unpacker::new(&registry);
        let scope = IdentityScope::shared();
        let rows = vec![person_row(1, "A", None, "")];
        let entities = unpacker
            .unpack(
                "Person",
                &person_with_cars_columns(),
                &Options::new(),
                &rows,
                &scope,
            )
            .unwrap()
            .entities();
        let person = entities[0].borrow();
        let Some(RelationValue::Many(cars)) = person.relation("cars") else {
            panic!("expected a loaded to-many slot");
        };
        assert!(cars.is_empty());
    }

    #[test]
    fn test_discriminator_resolves_concrete_class() {
        let registry = registry();
        let unpacker = Unpacker::new(&registry);
        let scope = IdentityScope::shared();
        let columns: Vec<String> = ["object_id", "status", "_class", "_mtime"]
            .iter()
            .map(ToString::to_string)
            .collect();
        let rows = vec![vec![
            Value::Integer(1),
            Value::Integer(1),
            Value::Text("Employee".to_string()),
            Value::Float(10.0),
        ]];
        let entities = unpacker
            .unpack("RootEntity", &columns, &Options::new(), &rows, &scope)
            .unwrap()
            .entities();
        assert_eq!(entities[0].borrow().class_name(), "Employee");
        // interned under the concrete class, shared with later loads
        assert!(scope.borrow().get("Employee", &Value::Integer(1)).is_some());
    }

    #[test]
    fn test_shared_scope_converges_across_calls() {
        let registry = registry();
        let unpacker = Unpacker::new(&registry);
        let scope = IdentityScope::shared();
        let columns: Vec<String> = ["name", "object_id", "status", "_class", "_mtime"]
            .iter()
            .map(ToString::to_string)
            .collect();
        let row = vec![
            Value::Text("A".to_string()),
            Value::Integer(1),
            Value::Integer(1),
            Value::Text("Person".to_string()),
            Value::Float(10.0),
        ];
        let first = unpacker
            .unpack("Person", &columns, &Options::new(), &[row.clone()], &scope)
            .unwrap()
            .entities();
        let second = unpacker
            .unpack("Person", &columns, &Options::new(), &[row], &scope)
            .unwrap()
            .entities();
        assert!(Rc::ptr_eq(&first[0], &second[0]));
    }

    #[test]
    fn test_map_mode_builds_nested_maps() {
        let registry = registry();
        let unpacker = Unpacker::new(&registry);
        let scope = IdentityScope::shared();
        let rows = vec![
            person_row(1, "A", Some(20), "sedan"),
            person_row(1, "A", Some(10), "coupe"),
        ];
        let options = Options::new().map_mode();
        let maps = unpacker
            .unpack("Person", &person_with_cars_columns(), &options, &rows, &scope)
            .unwrap()
            .maps();
        assert_eq!(maps.len(), 1);
        assert_eq!(maps[0]["name"], serde_json::json!("A"));
        let cars = maps[0]["cars"].as_array().unwrap();
        assert_eq!(cars.len(), 2);
        assert_eq!(cars[0]["object_id"], serde_json::json!(10));
    }

    #[test]
    fn test_count_mode_reads_scalar() {
        let registry = registry();
        let unpacker = Unpacker::new(&registry);
        let scope = IdentityScope::shared();
        let options = Options::new().count();
        let unpacked = unpacker
            .unpack("Person", &[], &options, &[vec![Value::Integer(7)]], &scope)
            .unwrap();
        assert_eq!(unpacked.count(), 7);
    }

    #[test]
    fn test_unloaded_relations_stay_lazy() {
        let registry = registry();
        let unpacker = Unpacker::new(&registry);
        let scope = IdentityScope::shared();
        let columns: Vec<String> = ["name", "object_id", "status", "_class", "_mtime"]
            .iter()
            .map(ToString::to_string)
            .collect();
        let rows = vec![vec![
            Value::Text("A".to_string()),
            Value::Integer(1),
            Value::Integer(1),
            Value::Text("Person".to_string()),
            Value::Float(10.0),
        ]];
        let entities = unpacker
            .unpack("Person", &columns, &Options::new(), &rows, &scope)
            .unwrap()
            .entities();
        assert!(entities[0]
            .borrow()
            .relation("cars")
            .is_some_and(RelationValue::is_lazy));
    }
}

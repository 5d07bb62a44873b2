use std::collections::BTreeMap;

use crate::core::{OrmError, Result, Value};
use crate::schema::SchemaRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub fn sql(self) -> &'static str {
        match self {
            Self::Ascending => "ASC",
            Self::Descending => "DESC",
        }
    }
}

/// Predicate kind, an explicit tagged union over the supported SQL
/// fragments.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterKind {
    Equals,
    NotEquals,
    In,
    NotIn,
    Like,
    Greater,
    GreaterEqual,
    Lesser,
    LesserEqual,
    IsNull,
    IsNotNull,
    /// Child filters compile recursively and join with OR.
    Or(Vec<Filter>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterField {
    pub name: String,
    pub values: Vec<Value>,
}

impl FilterField {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            values: vec![value],
        }
    }

    pub fn with_values(name: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }
}

/// One predicate; fields within the field list combine with OR, separate
/// filters combine with AND.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub kind: FilterKind,
    pub fields: Vec<FilterField>,
}

impl Filter {
    pub fn equals(field: impl Into<String>, value: Value) -> Self {
        Self {
            kind: FilterKind::Equals,
            fields: vec![FilterField::new(field, value)],
        }
    }

    pub fn in_values(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            kind: FilterKind::In,
            fields: vec![FilterField::with_values(field, values)],
        }
    }

    pub fn like(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: FilterKind::Like,
            fields: vec![FilterField::new(field, Value::Text(value.into()))],
        }
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Self {
            kind: FilterKind::IsNull,
            fields: vec![FilterField::with_values(field, Vec::new())],
        }
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Self {
            kind: FilterKind::Or(filters),
            fields: Vec::new(),
        }
    }
}

/// Unlimited record count sentinel.
pub const UNLIMITED: i64 = -1;

/// Normalized query option tree.
///
/// Instances built through the struct API are normalized on first use; JSON
/// shorthand forms go through [`Options::from_json`]. Normalization is
/// idempotent and tracked with the `normalized` marker.
#[derive(Debug, Clone, PartialEq)]
pub struct Options {
    pub filters: Vec<Filter>,
    /// Relation name -> nested options, compiled as eager left joins.
    pub eager: BTreeMap<String, Options>,
    pub order_by: Vec<(String, Direction)>,
    pub start_record: u64,
    pub number_records: i64,
    pub count: bool,
    pub map_mode: bool,
    /// Projection subset; the identifier is always retained.
    pub fields: Option<Vec<String>>,
    pub minimal: bool,
    /// Collapse results to unique instances. Identity interning already
    /// guarantees uniqueness, so the flag is accepted and recorded.
    pub set: bool,
    /// Intern loaded instances into the manager's shared identity scope;
    /// `false` gives the call a scope of its own.
    pub scope: bool,
    normalized: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            eager: BTreeMap::new(),
            order_by: Vec::new(),
            start_record: 0,
            number_records: UNLIMITED,
            count: false,
            map_mode: false,
            fields: None,
            minimal: false,
            set: false,
            scope: true,
            normalized: false,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn eager(mut self, relation: impl Into<String>, options: Options) -> Self {
        self.eager.insert(relation.into(), options);
        self
    }

    pub fn order_by(mut self, path: impl Into<String>, direction: Direction) -> Self {
        self.order_by.push((path.into(), direction));
        self
    }

    pub fn range(mut self, start_record: u64, number_records: i64) -> Self {
        self.start_record = start_record;
        self.number_records = number_records;
        self
    }

    pub fn count(mut self) -> Self {
        self.count = true;
        self
    }

    pub fn map_mode(mut self) -> Self {
        self.map_mode = true;
        self
    }

    pub fn fields(mut self, fields: Vec<String>) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn minimal(mut self) -> Self {
        self.minimal = true;
        self
    }

    pub fn is_normalized(&self) -> bool {
        self.normalized
    }

    /// Idempotent normalization pass.
    ///
    /// Guarantees the projection subset retains the identifier and that
    /// every nested eager tree is itself normalized. A tree whose marker is
    /// already set passes through untouched.
    pub fn normalize(mut self, registry: &SchemaRegistry, class: &str) -> Result<Options> {
        if self.normalized {
            return Ok(self);
        }

        if let Some(fields) = &mut self.fields {
            let id_field = registry.get_id(class)?.to_string();
            if !fields.contains(&id_field) {
                fields.insert(0, id_field);
            }
        }

        let mut eager = BTreeMap::new();
        for (relation, nested) in std::mem::take(&mut self.eager) {
            let target = registry.get_target(class, &relation)?.name().to_string();
            eager.insert(relation, nested.normalize(registry, &target)?);
        }
        self.eager = eager;

        for filter in &self.filters {
            validate_filter_shape(filter)?;
        }

        self.normalized = true;
        Ok(self)
    }

    /// Build options from a JSON tree, accepting the shorthand forms.
    ///
    /// A bare object with no recognized option key is an equals-filter map;
    /// a bare array is an in-filter on the identifier.
    pub fn from_json(
        registry: &SchemaRegistry,
        class: &str,
        value: &serde_json::Value,
    ) -> Result<Options> {
        let options = match value {
            serde_json::Value::Null => Options::new(),
            serde_json::Value::Array(ids) => {
                let id_field = registry.get_id(class)?;
                let values = ids.iter().map(Value::from_json).collect::<Result<_>>()?;
                Options::new().filter(Filter {
                    kind: FilterKind::In,
                    fields: vec![FilterField::with_values(id_field, values)],
                })
            }
            serde_json::Value::Object(map) => {
                if map.keys().any(|k| is_option_key(k)) {
                    parse_option_map(registry, class, map)?
                } else {
                    // equals-filter shorthand
                    let mut options = Options::new();
                    for (field, json) in map {
                        options = options.filter(Filter::equals(field, Value::from_json(json)?));
                    }
                    options
                }
            }
            other => {
                return Err(OrmError::Validation(format!(
                    "Options must be an object, array or null, got {other}"
                )));
            }
        };
        options.normalize(registry, class)
    }
}

fn is_option_key(key: &str) -> bool {
    matches!(
        key,
        "filters"
            | "names"
            | "eager"
            | "start_record"
            | "number_records"
            | "range"
            | "order_by"
            | "sort"
            | "count"
            | "fields"
            | "minimal"
            | "map"
            | "entities"
            | "set"
            | "scope"
    )
}

fn parse_option_map(
    registry: &SchemaRegistry,
    class: &str,
    map: &serde_json::Map<String, serde_json::Value>,
) -> Result<Options> {
    let mut options = Options::new();

    for (key, value) in map {
        match key.as_str() {
            "filters" => {
                let list = value.as_array().ok_or_else(|| {
                    OrmError::Validation("'filters' must be an array".to_string())
                })?;
                for filter in list {
                    options.filters.push(parse_filter(filter)?);
                }
            }
            "eager" => match value {
                serde_json::Value::Array(names) => {
                    for name in names {
                        let relation = name.as_str().ok_or_else(|| {
                            OrmError::Validation("'eager' names must be strings".to_string())
                        })?;
                        let target = registry.get_target(class, relation)?.name().to_string();
                        options.eager.insert(
                            relation.to_string(),
                            Options::new().normalize(registry, &target)?,
                        );
                    }
                }
                serde_json::Value::Object(relations) => {
                    for (relation, nested) in relations {
                        let target = registry.get_target(class, relation)?.name().to_string();
                        options
                            .eager
                            .insert(relation.clone(), Options::from_json(registry, &target, nested)?);
                    }
                }
                other => {
                    return Err(OrmError::Validation(format!(
                        "'eager' must be an array or object, got {other}"
                    )));
                }
            },
            "start_record" => {
                options.start_record = value.as_u64().ok_or_else(|| {
                    OrmError::Validation("'start_record' must be a non-negative integer".to_string())
                })?;
            }
            "number_records" => {
                options.number_records = value.as_i64().ok_or_else(|| {
                    OrmError::Validation("'number_records' must be an integer".to_string())
                })?;
            }
            "range" => {
                let pair = value.as_array().filter(|a| a.len() == 2).ok_or_else(|| {
                    OrmError::Validation("'range' must be a two-element array".to_string())
                })?;
                options.start_record = pair[0].as_u64().ok_or_else(|| {
                    OrmError::Validation("'range' start must be a non-negative integer".to_string())
                })?;
                options.number_records = pair[1].as_i64().ok_or_else(|| {
                    OrmError::Validation("'range' count must be an integer".to_string())
                })?;
            }
            "order_by" | "sort" => {
                let list = value.as_array().ok_or_else(|| {
                    OrmError::Validation(format!("'{key}' must be an array"))
                })?;
                for entry in list {
                    options.order_by.push(parse_order_entry(entry)?);
                }
            }
            "count" => options.count = value.as_bool().unwrap_or(false),
            "map" => options.map_mode = value.as_bool().unwrap_or(false),
            // `entities` is the inverse of `map`
            "entities" => options.map_mode = !value.as_bool().unwrap_or(true),
            "set" => options.set = value.as_bool().unwrap_or(false),
            "scope" => options.scope = value.as_bool().unwrap_or(true),
            "minimal" => options.minimal = value.as_bool().unwrap_or(false),
            "fields" | "names" => {
                let list = value.as_array().ok_or_else(|| {
                    OrmError::Validation(format!("'{key}' must be an array"))
                })?;
                let mut fields = Vec::new();
                for name in list {
                    fields.push(
                        name.as_str()
                            .ok_or_else(|| {
                                OrmError::Validation(format!("'{key}' entries must be strings"))
                            })?
                            .to_string(),
                    );
                }
                options.fields = Some(fields);
            }
            unknown => {
                return Err(OrmError::Validation(format!(
                    "Unrecognized option key '{unknown}'"
                )));
            }
        }
    }

    Ok(options)
}

fn parse_order_entry(entry: &serde_json::Value) -> Result<(String, Direction)> {
    match entry {
        serde_json::Value::String(path) => Ok((path.clone(), Direction::Ascending)),
        serde_json::Value::Array(pair) if pair.len() == 2 => {
            let path = pair[0]
                .as_str()
                .ok_or_else(|| OrmError::Validation("order path must be a string".to_string()))?;
            let direction = match pair[1].as_str() {
                Some("asc" | "ascending") => Direction::Ascending,
                Some("desc" | "descending") => Direction::Descending,
                _ => {
                    return Err(OrmError::Validation(format!(
                        "Unknown order direction {}",
                        pair[1]
                    )));
                }
            };
            Ok((path.to_string(), direction))
        }
        other => Err(OrmError::Validation(format!(
            "Malformed order entry {other}"
        ))),
    }
}

fn parse_filter(value: &serde_json::Value) -> Result<Filter> {
    let map = match value {
        serde_json::Value::Object(map) => map,
        other => {
            return Err(OrmError::Validation(format!(
                "Malformed filter {other}"
            )));
        }
    };

    // shorthand: plain field -> value map means equals
    if !map.contains_key("type") {
        let mut fields = Vec::new();
        for (field, json) in map {
            fields.push(FilterField::new(field, Value::from_json(json)?));
        }
        if fields.is_empty() {
            return Err(OrmError::Validation("Empty filter".to_string()));
        }
        return Ok(Filter {
            kind: FilterKind::Equals,
            fields,
        });
    }

    let kind_name = map["type"]
        .as_str()
        .ok_or_else(|| OrmError::Validation("Filter 'type' must be a string".to_string()))?;

    if kind_name == "or" {
        let children = map
            .get("filters")
            .and_then(|f| f.as_array())
            .ok_or_else(|| {
                OrmError::Validation("'or' filter is missing its 'filters' list".to_string())
            })?;
        let parsed = children.iter().map(parse_filter).collect::<Result<_>>()?;
        return Ok(Filter::or(parsed));
    }

    let kind = match kind_name {
        "equals" => FilterKind::Equals,
        "not_equals" => FilterKind::NotEquals,
        "in" => FilterKind::In,
        "not_in" => FilterKind::NotIn,
        "like" => FilterKind::Like,
        "greater" => FilterKind::Greater,
        "greater_equal" => FilterKind::GreaterEqual,
        "lesser" => FilterKind::Lesser,
        "lesser_equal" => FilterKind::LesserEqual,
        "is_null" => FilterKind::IsNull,
        "is_not_null" => FilterKind::IsNotNull,
        unknown => {
            return Err(OrmError::Validation(format!(
                "Unknown filter type '{unknown}'"
            )));
        }
    };

    let fields_json = map.get("fields").ok_or_else(|| {
        OrmError::Validation(format!("Filter '{kind_name}' is missing its 'fields' key"))
    })?;

    let mut fields = Vec::new();
    match fields_json {
        serde_json::Value::Object(field_map) => {
            for (name, json) in field_map {
                fields.push(parse_filter_field(name, json)?);
            }
        }
        serde_json::Value::Array(list) => {
            for entry in list {
                match entry {
                    serde_json::Value::String(name) => {
                        fields.push(FilterField::with_values(name, Vec::new()));
                    }
                    serde_json::Value::Object(field_map) => {
                        for (name, json) in field_map {
                            fields.push(parse_filter_field(name, json)?);
                        }
                    }
                    other => {
                        return Err(OrmError::Validation(format!(
                            "Malformed filter field {other}"
                        )));
                    }
                }
            }
        }
        other => {
            return Err(OrmError::Validation(format!(
                "Filter 'fields' must be an object or array, got {other}"
            )));
        }
    }

    let filter = Filter { kind, fields };
    validate_filter_shape(&filter)?;
    Ok(filter)
}

fn parse_filter_field(name: &str, json: &serde_json::Value) -> Result<FilterField> {
    match json {
        serde_json::Value::Array(values) => {
            let values = values.iter().map(Value::from_json).collect::<Result<_>>()?;
            Ok(FilterField::with_values(name, values))
        }
        scalar => Ok(FilterField::new(name, Value::from_json(scalar)?)),
    }
}

fn validate_filter_shape(filter: &Filter) -> Result<()> {
    match &filter.kind {
        FilterKind::Or(children) => {
            for child in children {
                validate_filter_shape(child)?;
            }
            Ok(())
        }
        FilterKind::IsNull | FilterKind::IsNotNull => {
            if filter.fields.is_empty() {
                return Err(OrmError::Validation(
                    "Null-check filter names no fields".to_string(),
                ));
            }
            Ok(())
        }
        FilterKind::In | FilterKind::NotIn => {
            if filter.fields.iter().any(|f| f.values.is_empty()) {
                return Err(OrmError::Validation(
                    "In filter field carries no values".to_string(),
                ));
            }
            Ok(())
        }
        _ => {
            if filter.fields.is_empty() {
                return Err(OrmError::Validation(
                    "Filter names no fields".to_string(),
                ));
            }
            if filter.fields.iter().any(|f| f.values.len() != 1) {
                return Err(OrmError::Validation(
                    "Scalar filter field must carry exactly one value".to_string(),
                ));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DataType;
    use crate::schema::{EntityClass, FieldDef};

    fn registry() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        registry
            .register(
                EntityClass::builder("Person")
                    .id(FieldDef::new("object_id", DataType::Integer))
                    .field(FieldDef::new("name", DataType::Text))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let registry = registry();
        let options = Options::new()
            .filter(Filter::equals("name", Value::Text("A".into())))
            .fields(vec!["name".to_string()]);
        let once = options.normalize(&registry, "Person").unwrap();
        let twice = once.clone().normalize(&registry, "Person").unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_fields_subset_retains_id() {
        let registry = registry();
        let options = Options::new()
            .fields(vec!["name".to_string()])
            .normalize(&registry, "Person")
            .unwrap();
        assert_eq!(
            options.fields.as_deref().unwrap(),
            ["object_id".to_string(), "name".to_string()]
        );
    }

    #[test]
    fn test_bare_map_shorthand() {
        let registry = registry();
        let options =
            Options::from_json(&registry, "Person", &serde_json::json!({"name": "A"})).unwrap();
        assert_eq!(
            options.filters,
            vec![Filter::equals("name", Value::Text("A".into()))]
        );
    }

    #[test]
    fn test_bare_list_shorthand() {
        let registry = registry();
        let options =
            Options::from_json(&registry, "Person", &serde_json::json!([1, 2, 3])).unwrap();
        assert_eq!(options.filters.len(), 1);
        assert_eq!(options.filters[0].kind, FilterKind::In);
        assert_eq!(options.filters[0].fields[0].name, "object_id");
        assert_eq!(options.filters[0].fields[0].values.len(), 3);
    }

    #[test]
    fn test_range_expansion() {
        let registry = registry();
        let options =
            Options::from_json(&registry, "Person", &serde_json::json!({"range": [10, 5]}))
                .unwrap();
        assert_eq!(options.start_record, 10);
        assert_eq!(options.number_records, 5);
    }

    #[test]
    fn test_entities_key_is_inverse_of_map() {
        let registry = registry();
        let options =
            Options::from_json(&registry, "Person", &serde_json::json!({"map": true})).unwrap();
        assert!(options.map_mode);
        let options =
            Options::from_json(&registry, "Person", &serde_json::json!({"entities": true}))
                .unwrap();
        assert!(!options.map_mode);
        let options =
            Options::from_json(&registry, "Person", &serde_json::json!({"entities": false}))
                .unwrap();
        assert!(options.map_mode);
    }

    #[test]
    fn test_set_and_scope_keys_recognized() {
        let registry = registry();
        let options = Options::from_json(
            &registry,
            "Person",
            &serde_json::json!({"set": true, "scope": false}),
        )
        .unwrap();
        assert!(options.set);
        assert!(!options.scope);

        let defaults = Options::from_json(&registry, "Person", &serde_json::json!({})).unwrap();
        assert!(!defaults.set);
        assert!(defaults.scope);
    }

    #[test]
    fn test_missing_fields_key_rejected() {
        let registry = registry();
        let result = Options::from_json(
            &registry,
            "Person",
            &serde_json::json!({"filters": [{"type": "equals"}]}),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_filter_type_rejected() {
        let registry = registry();
        let result = Options::from_json(
            &registry,
            "Person",
            &serde_json::json!({"filters": [{"type": "between", "fields": {"name": "A"}}]}),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_or_group_parsing() {
        let registry = registry();
        let options = Options::from_json(
            &registry,
            "Person",
            &serde_json::json!({"filters": [{
                "type": "or",
                "filters": [{"name": "A"}, {"name": "B"}]
            }]}),
        )
        .unwrap();
        assert!(matches!(options.filters[0].kind, FilterKind::Or(ref c) if c.len() == 2));
    }

    #[test]
    fn test_unknown_eager_relation_rejected() {
        let registry = registry();
        let result = Options::from_json(
            &registry,
            "Person",
            &serde_json::json!({"eager": ["ghost"]}),
        );
        assert!(result.is_err());
    }
}

use serde_json::{json, Map as JsonMap, Number, Value as JsonValue};

use crate::error::{VmError, VmResult};
use crate::value::{ClassMeta, Value};

/// Serialise a runtime value to JSON. Objects take their member names from
/// class metadata in the constant pool, falling back to `field0`, `field1`,
/// ... when the class carries no named fields.
pub fn value_to_json(value: &Value, constants: &[Value]) -> JsonValue {
    match value {
        Value::Null => JsonValue::Null,
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::Int(i) => json!(i),
        Value::Float(f) => Number::from_f64(*f as f64)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        Value::Double(d) => Number::from_f64(*d)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        Value::Char(c) => JsonValue::String((*c as char).to_string()),
        Value::String(s) => JsonValue::String(s.clone()),
        Value::Object(object) => {
            let data = object.lock();
            let field_names = class_field_names(data.class_idx, constants);
            let mut members = JsonMap::new();
            for (i, field) in data.fields.iter().enumerate() {
                let name = field_names
                    .as_ref()
                    .and_then(|names| names.get(i).cloned())
                    .unwrap_or_else(|| format!("field{i}"));
                members.insert(name, value_to_json(field, constants));
            }
            JsonValue::Object(members)
        }
        Value::Array(array) => JsonValue::Array(
            array
                .lock()
                .iter()
                .map(|v| value_to_json(v, constants))
                .collect(),
        ),
        Value::Map(map) => {
            let mut members = JsonMap::new();
            for (key, val) in map.lock().iter() {
                members.insert(key.clone(), value_to_json(val, constants));
            }
            JsonValue::Object(members)
        }
        Value::IntMap(map) => {
            let mut members = JsonMap::new();
            for (key, val) in map.lock().iter() {
                members.insert(key.to_string(), value_to_json(val, constants));
            }
            JsonValue::Object(members)
        }
        Value::Set(set) => JsonValue::Array(
            set.lock()
                .iter()
                .map(|v| value_to_json(v, constants))
                .collect(),
        ),
        Value::IntSet(set) => {
            JsonValue::Array(set.lock().iter().map(|i| json!(i)).collect())
        }
        other => JsonValue::String(format!("[{}]", other.value_type())),
    }
}

fn class_field_names(class_idx: i32, constants: &[Value]) -> Option<Vec<String>> {
    if class_idx < 0 {
        return None;
    }
    let meta = ClassMeta::from_value(constants.get(class_idx as usize)?).ok()?;
    if meta.field_names.is_empty() {
        None
    } else {
        Some(meta.field_names)
    }
}

/// Parse a JSON document into an Object of the given class. The root must be
/// a JSON object; fields named by the class metadata are filled in, the rest
/// stay Null.
pub fn object_from_json(text: &str, class_idx: usize, constants: &[Value]) -> VmResult<Value> {
    let root: JsonValue = serde_json::from_str(text)
        .map_err(|err| VmError::runtime(format!("CLASS_FROM_JSON: invalid JSON: {err}")))?;
    let JsonValue::Object(members) = root else {
        return Err(VmError::runtime("CLASS_FROM_JSON: root must be an object"));
    };
    let class_value = constants
        .get(class_idx)
        .ok_or(VmError::ConstantOutOfBounds(class_idx))?;
    let meta = ClassMeta::from_value(class_value)?;

    let object = Value::new_object(class_idx as i32, meta.field_count);
    {
        let handle = object.as_object()?;
        let mut data = handle.lock();
        for (i, name) in meta.field_names.iter().enumerate() {
            if i >= data.fields.len() {
                break;
            }
            if let Some(member) = members.get(name) {
                data.fields[i] = json_to_value(member);
            }
        }
    }
    Ok(object)
}

/// JSON scalar/composite to runtime value: integral numbers in i32 range
/// become Int, other numbers Double, arrays become Arrays, objects become
/// string-keyed Maps.
pub fn json_to_value(json: &JsonValue) -> Value {
    match json {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(b) => Value::Bool(*b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                if i >= i32::MIN as i64 && i <= i32::MAX as i64 {
                    return Value::Int(i as i32);
                }
            }
            Value::Double(n.as_f64().unwrap_or(0.0))
        }
        JsonValue::String(s) => Value::String(s.clone()),
        JsonValue::Array(items) => {
            Value::array_from(items.iter().map(json_to_value).collect())
        }
        JsonValue::Object(members) => {
            let map = Value::new_map();
            {
                let handle = map.as_map().expect("fresh map");
                let mut inner = handle.lock();
                for (key, val) in members {
                    inner.insert(key.clone(), json_to_value(val));
                }
            }
            map
        }
    }
}

/// Text form used by ADD_STRING and the string builder: strings stay raw,
/// numeric and boolean primitives print plainly, objects serialise to JSON,
/// everything else collapses to a placeholder.
pub fn coerce_to_string(value: &Value, constants: &[Value]) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Double(d) => d.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        Value::Object(_) => value_to_json(value, constants).to_string(),
        _ => "[object]".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ClassMeta;

    fn point_pool() -> Vec<Value> {
        vec![ClassMeta {
            name: "Point".into(),
            field_count: 2,
            method_count: 0,
            field_names: vec!["x".into(), "y".into()],
        }
        .into_value()]
    }

    #[test]
    fn object_serialises_with_field_names() {
        let constants = point_pool();
        let point = Value::new_object(0, 2);
        {
            let handle = point.as_object().unwrap();
            let mut data = handle.lock();
            data.fields[0] = Value::Int(3);
            data.fields[1] = Value::Int(4);
        }
        let text = value_to_json(&point, &constants).to_string();
        assert_eq!(text, r#"{"x":3,"y":4}"#);
    }

    #[test]
    fn object_without_metadata_uses_positional_names() {
        let object = Value::new_object(-2, 2);
        {
            let handle = object.as_object().unwrap();
            let mut data = handle.lock();
            data.fields[0] = Value::string("a");
            data.fields[1] = Value::Bool(true);
        }
        let json = value_to_json(&object, &[]);
        assert_eq!(json["field0"], "a");
        assert_eq!(json["field1"], true);
    }

    #[test]
    fn string_escaping_is_json_standard() {
        let text =
            value_to_json(&Value::string("a\"b\\c\nd"), &[]).to_string();
        assert_eq!(text, r#""a\"b\\c\nd""#);
    }

    #[test]
    fn round_trip_reconstructs_fields() {
        let constants = point_pool();
        let point = Value::new_object(0, 2);
        {
            let handle = point.as_object().unwrap();
            let mut data = handle.lock();
            data.fields[0] = Value::Int(3);
            data.fields[1] = Value::Int(4);
        }
        let text = value_to_json(&point, &constants).to_string();
        let back = object_from_json(&text, 0, &constants).expect("round trip");
        let handle = back.as_object().unwrap();
        let data = handle.lock();
        assert_eq!(data.class_idx, 0);
        assert_eq!(data.fields, vec![Value::Int(3), Value::Int(4)]);
    }

    #[test]
    fn missing_json_members_stay_null() {
        let constants = point_pool();
        let back = object_from_json(r#"{"y": 9}"#, 0, &constants).expect("partial object");
        let handle = back.as_object().unwrap();
        let data = handle.lock();
        assert_eq!(data.fields, vec![Value::Null, Value::Int(9)]);
    }

    #[test]
    fn from_json_rejects_non_object_root() {
        let constants = point_pool();
        assert!(object_from_json("[1,2]", 0, &constants).is_err());
        assert!(object_from_json("not json", 0, &constants).is_err());
    }

    #[test]
    fn numbers_become_int_or_double() {
        assert_eq!(json_to_value(&serde_json::json!(7)), Value::Int(7));
        assert_eq!(
            json_to_value(&serde_json::json!(4_000_000_000i64)),
            Value::Double(4_000_000_000.0)
        );
        assert_eq!(json_to_value(&serde_json::json!(1.5)), Value::Double(1.5));
    }

    #[test]
    fn coercion_matches_concatenation_rules() {
        assert_eq!(coerce_to_string(&Value::Int(5), &[]), "5");
        assert_eq!(coerce_to_string(&Value::Bool(true), &[]), "true");
        assert_eq!(coerce_to_string(&Value::Null, &[]), "null");
        assert_eq!(coerce_to_string(&Value::string("x"), &[]), "x");
        assert_eq!(coerce_to_string(&Value::new_array(0), &[]), "[object]");
    }
}

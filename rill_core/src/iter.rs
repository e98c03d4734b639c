use crate::error::{VmError, VmResult};
use crate::value::{ArrayRef, Value};

/// Single-pass cursor over a container. Arrays are walked live by index;
/// hash-backed collections snapshot their contents when the iterator is
/// created, which preserves the each-element-exactly-once guarantee without
/// holding a borrow into the container between instructions.
#[derive(Debug)]
pub enum IterState {
    Array { array: ArrayRef, index: usize },
    Set { items: Vec<Value>, index: usize },
    Map { entries: Vec<(String, Value)>, index: usize },
    IntSet { items: Vec<i32>, index: usize },
    IntMap { entries: Vec<(i32, Value)>, index: usize },
}

impl IterState {
    pub fn over(collection: &Value) -> VmResult<IterState> {
        match collection {
            Value::Array(array) => Ok(IterState::Array {
                array: array.clone(),
                index: 0,
            }),
            Value::Set(set) => Ok(IterState::Set {
                items: set.lock().iter().cloned().collect(),
                index: 0,
            }),
            Value::Map(map) => Ok(IterState::Map {
                entries: map
                    .lock()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                index: 0,
            }),
            Value::IntSet(set) => Ok(IterState::IntSet {
                items: set.lock().iter().copied().collect(),
                index: 0,
            }),
            Value::IntMap(map) => Ok(IterState::IntMap {
                entries: map.lock().iter().map(|(k, v)| (*k, v.clone())).collect(),
                index: 0,
            }),
            other => Err(VmError::runtime(format!(
                "ITER_INIT: unsupported collection type {} for iteration",
                other.value_type()
            ))),
        }
    }

    pub fn is_map(&self) -> bool {
        matches!(self, IterState::Map { .. } | IterState::IntMap { .. })
    }

    pub fn has_next(&self) -> bool {
        match self {
            IterState::Array { array, index } => *index < array.lock().len(),
            IterState::Set { items, index } => *index < items.len(),
            IterState::Map { entries, index } => *index < entries.len(),
            IterState::IntSet { items, index } => *index < items.len(),
            IterState::IntMap { entries, index } => *index < entries.len(),
        }
    }

    pub fn value(&self) -> VmResult<Value> {
        match self {
            IterState::Array { array, index } => array
                .lock()
                .get(*index)
                .cloned()
                .ok_or_else(Self::exhausted),
            IterState::Set { items, index } => {
                items.get(*index).cloned().ok_or_else(Self::exhausted)
            }
            IterState::Map { entries, index } => entries
                .get(*index)
                .map(|(_, v)| v.clone())
                .ok_or_else(Self::exhausted),
            IterState::IntSet { items, index } => items
                .get(*index)
                .map(|i| Value::Int(*i))
                .ok_or_else(Self::exhausted),
            IterState::IntMap { entries, index } => entries
                .get(*index)
                .map(|(_, v)| v.clone())
                .ok_or_else(Self::exhausted),
        }
    }

    pub fn key(&self) -> VmResult<Value> {
        match self {
            IterState::Map { entries, index } => entries
                .get(*index)
                .map(|(k, _)| Value::String(k.clone()))
                .ok_or_else(Self::exhausted),
            IterState::IntMap { entries, index } => entries
                .get(*index)
                .map(|(k, _)| Value::Int(*k))
                .ok_or_else(Self::exhausted),
            _ => Err(VmError::runtime(
                "ITER_KEY: operation only valid for map iterators",
            )),
        }
    }

    pub fn advance(&mut self) -> VmResult<()> {
        let (index, len) = match self {
            IterState::Array { array, index } => (index, array.lock().len()),
            IterState::Set { items, index } => (index, items.len()),
            IterState::Map { entries, index } => (index, entries.len()),
            IterState::IntSet { items, index } => (index, items.len()),
            IterState::IntMap { entries, index } => (index, entries.len()),
        };
        if *index >= len {
            return Err(Self::exhausted());
        }
        *index += 1;
        Ok(())
    }

    fn exhausted() -> VmError {
        VmError::runtime("iterator advanced past end")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_iterator_walks_in_order() {
        let array = Value::array_from(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        let mut iter = IterState::over(&array).expect("iterate array");
        let mut seen = Vec::new();
        while iter.has_next() {
            seen.push(iter.value().expect("value"));
            iter.advance().expect("advance");
        }
        assert_eq!(seen, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert!(iter.advance().is_err());
    }

    #[test]
    fn map_iterator_yields_keys_and_values() {
        let map = Value::new_map();
        {
            let handle = map.as_map().unwrap();
            let mut inner = handle.lock();
            inner.insert("a".into(), Value::Int(1));
            inner.insert("b".into(), Value::Int(2));
        }
        let mut iter = IterState::over(&map).expect("iterate map");
        assert!(iter.is_map());
        assert_eq!(iter.key().unwrap(), Value::string("a"));
        assert_eq!(iter.value().unwrap(), Value::Int(1));
        iter.advance().unwrap();
        assert_eq!(iter.key().unwrap(), Value::string("b"));
        iter.advance().unwrap();
        assert!(!iter.has_next());
    }

    #[test]
    fn set_iterator_covers_each_element_once() {
        let set = Value::new_set();
        {
            let handle = set.as_set().unwrap();
            let mut inner = handle.lock();
            inner.insert(Value::Int(10));
            inner.insert(Value::string("ten"));
        }
        let mut iter = IterState::over(&set).expect("iterate set");
        let mut seen = Vec::new();
        while iter.has_next() {
            seen.push(iter.value().unwrap());
            iter.advance().unwrap();
        }
        assert_eq!(seen.len(), 2);
        assert!(seen.contains(&Value::Int(10)));
        assert!(seen.contains(&Value::string("ten")));
    }

    #[test]
    fn key_on_array_iterator_is_an_error() {
        let array = Value::new_array(1);
        let iter = IterState::over(&array).unwrap();
        assert!(iter.key().is_err());
    }

    #[test]
    fn iterating_a_primitive_is_an_error() {
        assert!(IterState::over(&Value::Int(5)).is_err());
    }
}

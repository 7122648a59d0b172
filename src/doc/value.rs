use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A document value. Objects keep field insertion order, matching how the
/// wire format presents them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataValue {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    Text(String),
    Bytes(Vec<u8>),
    Array(Vec<DataValue>),
    Object(Vec<(String, DataValue)>),
}

impl DataValue {
    pub fn text(s: &str) -> Self {
        DataValue::Text(s.to_string())
    }

    pub fn object(fields: Vec<(&str, DataValue)>) -> Self {
        DataValue::Object(
            fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    pub fn field(&self, name: &str) -> Option<&DataValue> {
        match self {
            DataValue::Object(fields) => fields.iter().find(|(k, _)| k == name).map(|(_, v)| v),
            _ => None,
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            DataValue::Null => 0,
            DataValue::Int(_) | DataValue::Double(_) => 1,
            DataValue::Text(_) => 2,
            DataValue::Bytes(_) => 3,
            DataValue::Bool(_) => 4,
            DataValue::Array(_) => 5,
            DataValue::Object(_) => 6,
        }
    }

    /// Cross-type ordering used by sort and by range predicates. Numbers of
    /// both widths compare numerically; otherwise values compare within
    /// their type rank.
    pub fn cmp_order(&self, other: &DataValue) -> Ordering {
        use DataValue::*;
        match (self, other) {
            (Int(a), Int(b)) => a.cmp(b),
            (Double(a), Double(b)) => a.total_cmp(b),
            (Int(a), Double(b)) => (*a as f64).total_cmp(b),
            (Double(a), Int(b)) => a.total_cmp(&(*b as f64)),
            (Text(a), Text(b)) => a.cmp(b),
            (Bytes(a), Bytes(b)) => a.cmp(b),
            (Bool(a), Bool(b)) => a.cmp(b),
            (Null, Null) => Ordering::Equal,
            (Array(a), Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.cmp_order(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Object(a), Object(b)) => {
                for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                    let ord = ka.cmp(kb).then_with(|| va.cmp_order(vb));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl From<serde_json::Value> for DataValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => DataValue::Null,
            serde_json::Value::Bool(b) => DataValue::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    DataValue::Int(i)
                } else {
                    DataValue::Double(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => DataValue::Text(s),
            serde_json::Value::Array(items) => {
                DataValue::Array(items.into_iter().map(DataValue::from).collect())
            }
            serde_json::Value::Object(fields) => {
                DataValue::Object(fields.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

/// Evaluates a dot-separated path against a value, expanding a trailing
/// array into its elements. A missing field yields a single Null, so that
/// documents without the field still land in an index.
pub fn eval_path(value: &DataValue, path: &str) -> Vec<DataValue> {
    let segments: Vec<&str> = path.split('.').collect();
    walk(value, &segments)
}

fn walk(value: &DataValue, segments: &[&str]) -> Vec<DataValue> {
    match segments.split_first() {
        None => match value {
            DataValue::Array(items) => items.clone(),
            other => vec![other.clone()],
        },
        Some((segment, rest)) => match value {
            DataValue::Object(_) => match value.field(segment) {
                Some(inner) => walk(inner, rest),
                None => vec![DataValue::Null],
            },
            DataValue::Array(items) => items.iter().flat_map(|item| walk(item, segments)).collect(),
            _ => vec![DataValue::Null],
        },
    }
}

/// The single value at a dot-separated path, navigating objects only.
pub fn value_at_path<'a>(value: &'a DataValue, path: &str) -> Option<&'a DataValue> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.field(segment)?;
    }
    Some(current)
}

/// Sets the value at a dot-separated path, creating intermediate objects.
pub fn set_path(root: &mut DataValue, path: &str, value: DataValue) {
    let mut current = root;
    let segments: Vec<&str> = path.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        if !matches!(current, DataValue::Object(_)) {
            *current = DataValue::Object(Vec::new());
        }
        let DataValue::Object(fields) = current else {
            unreachable!()
        };
        let position = fields.iter().position(|(k, _)| k == segment);
        let idx = match position {
            Some(idx) => idx,
            None => {
                fields.push((segment.to_string(), DataValue::Null));
                fields.len() - 1
            }
        };
        if i == segments.len() - 1 {
            fields[idx].1 = value;
            return;
        }
        current = &mut fields[idx].1;
    }
}

/// Removes the value at a dot-separated path, if present.
pub fn clear_path(root: &mut DataValue, path: &str) {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = root;
    for (i, segment) in segments.iter().enumerate() {
        let DataValue::Object(fields) = current else {
            return;
        };
        let Some(idx) = fields.iter().position(|(k, _)| k == segment) else {
            return;
        };
        if i == segments.len() - 1 {
            fields.remove(idx);
            return;
        }
        current = &mut fields[idx].1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_expands_trailing_arrays() {
        let doc: DataValue = serde_json::json!({"tags": ["x", "y", "z"]}).into();
        assert_eq!(
            eval_path(&doc, "tags"),
            vec![
                DataValue::text("x"),
                DataValue::text("y"),
                DataValue::text("z")
            ]
        );
    }

    #[test]
    fn missing_path_imputes_null() {
        let doc: DataValue = serde_json::json!({"a": 1}).into();
        assert_eq!(eval_path(&doc, "b"), vec![DataValue::Null]);
        assert_eq!(eval_path(&doc, "a.b"), vec![DataValue::Null]);
    }

    #[test]
    fn nested_path_navigates_objects() {
        let doc: DataValue = serde_json::json!({"address": {"city": "kyoto"}}).into();
        assert_eq!(
            eval_path(&doc, "address.city"),
            vec![DataValue::text("kyoto")]
        );
    }

    #[test]
    fn set_and_clear_round_trip() {
        let mut doc: DataValue = serde_json::json!({"a": 1}).into();
        set_path(&mut doc, "b.c", DataValue::Int(2));
        assert_eq!(eval_path(&doc, "b.c"), vec![DataValue::Int(2)]);
        clear_path(&mut doc, "b.c");
        assert_eq!(eval_path(&doc, "b.c"), vec![DataValue::Null]);
    }

    #[test]
    fn cross_width_numbers_compare_numerically() {
        assert_eq!(
            DataValue::Int(2).cmp_order(&DataValue::Double(2.5)),
            Ordering::Less
        );
        assert_eq!(
            DataValue::Double(3.0).cmp_order(&DataValue::Int(3)),
            Ordering::Equal
        );
    }
}

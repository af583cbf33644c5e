//! Key extraction and result assembly
//!
//! Key values are compared through their JSON text; object keys serialize
//! in sorted order, so equal keys always compare equal.

use meridian_schema::{Cardinality, ExecutionPlan, KeyBinding};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::client::Record;

/// Identity of a record under `key`: the bare value for one-field keys,
/// an object of the key fields otherwise
pub(crate) fn key_of(record: &Record, key: &[String]) -> Option<Value> {
    match key {
        [single] => record.get(single).filter(|v| !v.is_null()).cloned(),
        _ => {
            let mut projected = serde_json::Map::new();
            for field in key {
                projected.insert(field.clone(), record.get(field)?.clone());
            }
            Some(Value::Object(projected))
        }
    }
}

/// Key values carried by a reference field: a bare key, a record holding
/// the key fields, or an array of either
pub(crate) fn reference_keys(value: &Value, key: &[String]) -> Vec<Value> {
    match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items.iter().flat_map(|item| reference_keys(item, key)).collect(),
        Value::Object(record) => key_of(record, key).into_iter().collect(),
        scalar if key.len() == 1 => vec![scalar.clone()],
        _ => Vec::new(),
    }
}

/// Distinct values, first occurrence kept
pub(crate) fn dedup(values: impl IntoIterator<Item = Value>) -> Vec<Value> {
    let mut seen = BTreeSet::new();
    values
        .into_iter()
        .filter(|v| seen.insert(v.to_string()))
        .collect()
}

fn index<'r>(records: &'r [Record], key: &[String]) -> HashMap<String, &'r Record> {
    let mut index = HashMap::new();
    for record in records {
        if let Some(k) = key_of(record, key) {
            index.entry(k.to_string()).or_insert(record);
        }
    }
    index
}

/// Replace each parent's reference field with the matching child records
pub(crate) fn embed(
    parents: &mut [Record],
    children: &[Record],
    key: &[String],
    via_field: &str,
    cardinality: Cardinality,
) {
    let index = index(children, key);
    for parent in parents.iter_mut() {
        let Some(reference) = parent.get(via_field) else {
            continue;
        };
        let mut matched = reference_keys(reference, key)
            .into_iter()
            .filter_map(|k| index.get(&k.to_string()))
            .map(|record| Value::Object((*record).clone()));
        let embedded = match cardinality {
            Cardinality::One => matched.next().unwrap_or(Value::Null),
            Cardinality::Many => Value::Array(matched.collect()),
        };
        parent.insert(via_field.to_string(), embedded);
    }
}

/// Copy partition fields into parents with an equal key. With `inner`,
/// parents without a partner record are dropped.
pub(crate) fn merge_partition(parents: &mut Vec<Record>, partition: &[Record], key: &[String], inner: bool) {
    let index = index(partition, key);
    parents.retain_mut(|parent| {
        let partner = key_of(parent, key).and_then(|k| index.get(&k.to_string()).copied());
        match partner {
            Some(extra) => {
                for (field, value) in extra {
                    parent.entry(field.clone()).or_insert_with(|| value.clone());
                }
                true
            }
            None => !inner,
        }
    });
}

/// Fold every step's records into its upstream steps, deepest first, and
/// return the root step's records
pub(crate) fn assemble(plan: &ExecutionPlan, mut results: BTreeMap<usize, Vec<Record>>) -> Vec<Record> {
    for step in plan.steps.iter().rev() {
        let Some(records) = results.get(&step.id).cloned() else {
            continue;
        };
        for binding in &step.bindings {
            match binding {
                KeyBinding::Root => {}
                KeyBinding::Reference {
                    step: upstream,
                    via_field,
                    cardinality,
                } => {
                    if let Some(parents) = results.get_mut(upstream) {
                        embed(parents, &records, &step.key, via_field, *cardinality);
                    }
                }
                KeyBinding::Partition { step: upstream } => {
                    if let Some(parents) = results.get_mut(upstream) {
                        merge_partition(parents, &records, &step.key, !step.filters.is_empty());
                    }
                }
            }
        }
    }

    plan.steps
        .iter()
        .find(|s| s.bindings.contains(&KeyBinding::Root))
        .and_then(|root| results.remove(&root.id))
        .unwrap_or_default()
}

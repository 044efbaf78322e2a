// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Conversion of free-form JSON argument maps into AMQP field tables.

use lapin::types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString};
use serde_json::Value;
use std::collections::BTreeMap;

/// Arguments as they appear in configuration files.
pub type Arguments = BTreeMap<String, Value>;

pub(crate) fn field_table(args: &Arguments) -> FieldTable {
    FieldTable::from(btree(args))
}

pub(crate) fn btree(args: &Arguments) -> BTreeMap<ShortString, AMQPValue> {
    args.iter()
        .map(|(key, value)| (ShortString::from(key.clone()), amqp_value(value)))
        .collect()
}

fn amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                AMQPValue::LongLongInt(i)
            } else if let Some(f) = n.as_f64() {
                AMQPValue::Double(f)
            } else {
                // u64 above i64::MAX
                AMQPValue::LongString(LongString::from(n.to_string()))
            }
        }
        Value::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
        Value::Array(items) => {
            AMQPValue::FieldArray(FieldArray::from(items.iter().map(amqp_value).collect::<Vec<_>>()))
        }
        Value::Object(map) => AMQPValue::FieldTable(FieldTable::from(
            map.iter()
                .map(|(key, value)| (ShortString::from(key.clone()), amqp_value(value)))
                .collect::<BTreeMap<_, _>>(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalar_arguments() {
        let args: Arguments = serde_json::from_value(json!({
            "x-message-ttl": 60000,
            "x-queue-mode": "lazy",
            "x-single-active-consumer": true,
            "x-ratio": 0.5,
            "x-none": null,
        }))
        .unwrap();

        let table = btree(&args);

        assert_eq!(
            table.get(&ShortString::from("x-message-ttl")),
            Some(&AMQPValue::LongLongInt(60000))
        );
        assert_eq!(
            table.get(&ShortString::from("x-queue-mode")),
            Some(&AMQPValue::LongString(LongString::from("lazy")))
        );
        assert_eq!(
            table.get(&ShortString::from("x-single-active-consumer")),
            Some(&AMQPValue::Boolean(true))
        );
        assert_eq!(
            table.get(&ShortString::from("x-ratio")),
            Some(&AMQPValue::Double(0.5))
        );
        assert_eq!(table.get(&ShortString::from("x-none")), Some(&AMQPValue::Void));
    }

    #[test]
    fn test_nested_arguments() {
        let args: Arguments =
            serde_json::from_value(json!({ "x-list": [1, "a"], "x-table": { "k": 1 } })).unwrap();

        let table = field_table(&args);
        let inner = table.inner();

        assert_eq!(
            inner.get(&ShortString::from("x-list")),
            Some(&AMQPValue::FieldArray(FieldArray::from(vec![
                AMQPValue::LongLongInt(1),
                AMQPValue::LongString(LongString::from("a")),
            ])))
        );

        let mut nested = BTreeMap::new();
        nested.insert(ShortString::from("k"), AMQPValue::LongLongInt(1));
        assert_eq!(
            inner.get(&ShortString::from("x-table")),
            Some(&AMQPValue::FieldTable(FieldTable::from(nested)))
        );
    }
}

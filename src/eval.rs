//! The single evaluator dispatching tagged operations.
//!
//! Every backend, local or worker-side, funnels task execution through
//! [`eval_op`]: one place that knows how `Call`, `GetAttr`, `GetItem` and
//! `BinOp` behave against resolved argument values.

use anyhow::{anyhow, bail};

use crate::expr::Op;
use crate::value::Value;

pub(crate) fn eval_op(op: &Op, args: &[Value]) -> anyhow::Result<Value> {
    match op {
        Op::Call { func, kwargs } => func.invoke(args, kwargs),
        Op::GetAttr { name } => {
            let [target] = args else {
                bail!("getattr expects exactly one argument, got {}", args.len());
            };
            match target {
                Value::Record(map) => map
                    .get(name)
                    .cloned()
                    .ok_or_else(|| anyhow!("record has no attribute '{name}'")),
                other => bail!("cannot read attribute '{name}' of {}", other.type_name()),
            }
        }
        Op::GetItem => {
            let [target, key] = args else {
                bail!("getitem expects a container and a key, got {} arguments", args.len());
            };
            get_item(target, key)
        }
        Op::BinOp { op } => {
            let [lhs, rhs] = args else {
                bail!(
                    "operator '{}' expects two operands, got {}",
                    op.symbol(),
                    args.len()
                );
            };
            op.apply(lhs, rhs)
        }
    }
}

fn get_item(target: &Value, key: &Value) -> anyhow::Result<Value> {
    match (target, key) {
        (Value::List(items), Value::Int(index)) => {
            // Negative indices count from the end.
            let len = items.len() as i64;
            let effective = if *index < 0 { index + len } else { *index };
            if effective < 0 || effective >= len {
                bail!("index {index} out of bounds for list of length {len}");
            }
            Ok(items[effective as usize].clone())
        }
        (Value::Record(map), Value::Str(key)) => map
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("record has no key '{key}'")),
        (target, key) => bail!(
            "cannot index {} with {}",
            target.type_name(),
            key.type_name()
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::func::Func;
    use crate::value::BinOp;

    #[test]
    fn getitem_supports_negative_indices() {
        let list = Value::from(vec![1.0, 2.0, 3.0]);
        assert_eq!(get_item(&list, &Value::Int(-1)).unwrap(), Value::Float(3.0));
        assert!(get_item(&list, &Value::Int(3)).is_err());
        assert!(get_item(&list, &Value::Int(-4)).is_err());
    }

    #[test]
    fn getattr_reads_record_fields() {
        let mut map = BTreeMap::new();
        map.insert("mean".to_owned(), Value::Float(4.5));
        let record = Value::Record(map);

        let op = Op::GetAttr { name: "mean".into() };
        assert_eq!(
            eval_op(&op, std::slice::from_ref(&record)).unwrap(),
            Value::Float(4.5)
        );

        let missing = Op::GetAttr { name: "median".into() };
        let err = eval_op(&missing, &[record]).unwrap_err();
        assert!(err.to_string().contains("median"));
    }

    #[test]
    fn arity_mismatches_fail_cleanly() {
        let op = Op::BinOp { op: BinOp::Add };
        assert!(eval_op(&op, &[Value::Int(1)]).is_err());

        let call = Op::Call {
            func: Func::new("first", |args, _| Ok(args[0].clone())),
            kwargs: Default::default(),
        };
        assert_eq!(
            eval_op(&call, &[Value::Int(7), Value::Int(8)]).unwrap(),
            Value::Int(7)
        );
    }
}

//! CEL (Common Expression Language) evaluation for the `JSONExpr` check
//! (spec §4.3).
//!
//! `cel-interpreter` compiles a `Program` once (at `Check::prepare`
//! time, via `compile_bool_expr`) and evaluates it per response with
//! the parsed JSON body bound into scope as `body`, plus every
//! top-level object key re-bound directly so simple expressions like
//! `status == "ok"` read naturally alongside `body.status == "ok"`.

use crate::error::{Error, Result};
use cel_interpreter::objects::{Key, Map as CelMap};
use cel_interpreter::{Context, Program, Value as CelValue};
use std::collections::HashMap;
use std::sync::Arc;

/// Validate that `expr` parses as a CEL program. Run once at prepare time.
pub fn compile_bool_expr(expr: &str) -> Result<()> {
    Program::compile(expr).map_err(|e| Error::Cel(format!("{}: {:?}", expr, e)))?;
    Ok(())
}

/// Evaluate `expr` against a parsed JSON document, returning its boolean result.
pub fn eval_bool_expr(expr: &str, root: &serde_json::Value) -> Result<bool> {
    let program = Program::compile(expr).map_err(|e| Error::Cel(format!("{}: {:?}", expr, e)))?;

    let mut context = Context::default();
    let body = json_to_cel(root);
    context.add_variable_from_value("body", body.clone());
    if let CelValue::Map(map) = &body {
        for (k, v) in map.map.iter() {
            if let Key::String(name) = k {
                context.add_variable_from_value(name.as_str(), v.clone());
            }
        }
    }

    match program
        .execute(&context)
        .map_err(|e| Error::Cel(format!("{}: {:?}", expr, e)))?
    {
        CelValue::Bool(b) => Ok(b),
        other => Err(Error::Cel(format!(
            "expression did not evaluate to bool: {:?}",
            other
        ))),
    }
}

/// Recursively convert a parsed JSON document into a CEL value.
fn json_to_cel(v: &serde_json::Value) -> CelValue {
    match v {
        serde_json::Value::Null => CelValue::Null,
        serde_json::Value::Bool(b) => CelValue::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                CelValue::Int(i)
            } else if let Some(u) = n.as_u64() {
                CelValue::UInt(u)
            } else {
                CelValue::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => CelValue::String(Arc::new(s.clone())),
        serde_json::Value::Array(items) => {
            CelValue::List(Arc::new(items.iter().map(json_to_cel).collect()))
        }
        serde_json::Value::Object(obj) => {
            let mut map = HashMap::new();
            for (k, v) in obj {
                map.insert(Key::String(Arc::new(k.clone())), json_to_cel(v));
            }
            CelValue::Map(CelMap { map: Arc::new(map) })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_field_comparison() {
        let root: serde_json::Value = serde_json::from_str(r#"{"status":"ok","count":3}"#).unwrap();
        compile_bool_expr("status == \"ok\" && count > 1").unwrap();
        assert!(eval_bool_expr("status == \"ok\" && count > 1", &root).unwrap());
        assert!(!eval_bool_expr("count > 10", &root).unwrap());
    }

    #[test]
    fn nested_body_access() {
        let root: serde_json::Value = serde_json::from_str(r#"{"user":{"age":30}}"#).unwrap();
        assert!(eval_bool_expr("body.user.age >= 18", &root).unwrap());
    }

    #[test]
    fn non_bool_result_is_an_error() {
        let root: serde_json::Value = serde_json::from_str(r#"{"count":3}"#).unwrap();
        assert!(eval_bool_expr("count", &root).is_err());
    }
}

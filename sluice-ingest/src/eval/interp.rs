use std::sync::Arc;

use hashbrown::HashMap;

use sluice_model::Value;

use super::EvalError;
use super::parser::{BinOp, CmpOp, Expr};

/// Extension hook letting the transformer layer expose its base
/// transformers (`lower(x)`, `round2(x)`, ...) as callables. Returning
/// `None` means the name is not handled and resolution continues.
pub type FnHook = Arc<dyn Fn(&str, &[Value]) -> Option<Result<Value, EvalError>> + Send + Sync>;

/// The fixed identifier namespace an expression evaluates against:
/// bound variables, math constants, and an optional function hook.
#[derive(Default, Clone)]
pub struct Namespace {
    vars: HashMap<String, Value>,
    fn_hook: Option<FnHook>,
}

impl Namespace {
    pub fn new() -> Namespace {
        Namespace::default()
    }

    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    pub fn with_fn_hook(mut self, hook: FnHook) -> Namespace {
        self.fn_hook = Some(hook);
        self
    }

    fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.vars.get(name) {
            return Some(v.clone());
        }
        match name {
            "pi" => Some(Value::Float(std::f64::consts::PI)),
            "e" => Some(Value::Float(std::f64::consts::E)),
            _ => None,
        }
    }
}

fn numeric(value: &Value) -> Result<f64, EvalError> {
    value
        .as_f64()
        .ok_or_else(|| EvalError::Type(format!("expected a number, got {}", value.type_name())))
}

fn both_ints(a: &Value, b: &Value) -> Option<(i64, i64)> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some((*x, *y)),
        (Value::Bool(x), Value::Int(y)) => Some((i64::from(*x), *y)),
        (Value::Int(x), Value::Bool(y)) => Some((*x, i64::from(*y))),
        _ => None,
    }
}

pub fn evaluate(expr: &Expr, ns: &Namespace) -> Result<Value, EvalError> {
    match expr {
        Expr::Int(n) => Ok(Value::Int(*n)),
        Expr::Float(n) => Ok(Value::Float(*n)),
        Expr::Str(s) => Ok(Value::String(s.clone())),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::None => Ok(Value::Null),
        Expr::Ident(name) => ns
            .lookup(name)
            .ok_or_else(|| EvalError::UnknownIdentifier(name.clone())),
        Expr::Neg(inner) => match evaluate(inner, ns)? {
            Value::Int(v) => Ok(Value::Int(-v)),
            other => Ok(Value::Float(-numeric(&other)?)),
        },
        Expr::Not(inner) => Ok(Value::Bool(!evaluate(inner, ns)?.is_truthy())),
        Expr::Binary(op, lhs, rhs) => {
            let a = evaluate(lhs, ns)?;
            let b = evaluate(rhs, ns)?;
            binary(*op, a, b)
        }
        Expr::Compare(first, chain) => {
            let mut left = evaluate(first, ns)?;
            for (op, rhs) in chain {
                let right = evaluate(rhs, ns)?;
                if !compare(*op, &left, &right)? {
                    return Ok(Value::Bool(false));
                }
                left = right;
            }
            Ok(Value::Bool(true))
        }
        Expr::And(lhs, rhs) => {
            let a = evaluate(lhs, ns)?;
            if a.is_truthy() {
                evaluate(rhs, ns)
            } else {
                Ok(a)
            }
        }
        Expr::Or(lhs, rhs) => {
            let a = evaluate(lhs, ns)?;
            if a.is_truthy() { Ok(a) } else { evaluate(rhs, ns) }
        }
        Expr::Conditional {
            then,
            cond,
            otherwise,
        } => {
            if evaluate(cond, ns)?.is_truthy() {
                evaluate(then, ns)
            } else {
                evaluate(otherwise, ns)
            }
        }
        Expr::List(items) => {
            let values: Result<Vec<Value>, EvalError> =
                items.iter().map(|e| evaluate(e, ns)).collect();
            Ok(Value::List(values?))
        }
        Expr::Subscript(target, index) => {
            let target = evaluate(target, ns)?;
            let index = evaluate(index, ns)?;
            subscript(&target, &index)
        }
        Expr::Call(name, args) => {
            let values: Result<Vec<Value>, EvalError> =
                args.iter().map(|e| evaluate(e, ns)).collect();
            call(name, &values?, ns)
        }
    }
}

fn binary(op: BinOp, a: Value, b: Value) -> Result<Value, EvalError> {
    match op {
        BinOp::Add => {
            if let (Value::String(x), Value::String(y)) = (&a, &b) {
                return Ok(Value::String(format!("{x}{y}")));
            }
            if let (Value::List(x), Value::List(y)) = (&a, &b) {
                let mut out = x.clone();
                out.extend(y.clone());
                return Ok(Value::List(out));
            }
            if let Some((x, y)) = both_ints(&a, &b) {
                if let Some(v) = x.checked_add(y) {
                    return Ok(Value::Int(v));
                }
            }
            Ok(Value::Float(numeric(&a)? + numeric(&b)?))
        }
        BinOp::Sub => {
            if let Some((x, y)) = both_ints(&a, &b) {
                if let Some(v) = x.checked_sub(y) {
                    return Ok(Value::Int(v));
                }
            }
            Ok(Value::Float(numeric(&a)? - numeric(&b)?))
        }
        BinOp::Mul => {
            if let Some((x, y)) = both_ints(&a, &b) {
                if let Some(v) = x.checked_mul(y) {
                    return Ok(Value::Int(v));
                }
            }
            Ok(Value::Float(numeric(&a)? * numeric(&b)?))
        }
        BinOp::Div => {
            let d = numeric(&b)?;
            if d == 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            Ok(Value::Float(numeric(&a)? / d))
        }
        BinOp::FloorDiv => {
            let d = numeric(&b)?;
            if d == 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            let q = (numeric(&a)? / d).floor();
            if both_ints(&a, &b).is_some() {
                Ok(Value::Int(q as i64))
            } else {
                Ok(Value::Float(q))
            }
        }
        BinOp::Mod => {
            let d = numeric(&b)?;
            if d == 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            let n = numeric(&a)?;
            // Sign follows the divisor.
            let r = n - d * (n / d).floor();
            if both_ints(&a, &b).is_some() {
                Ok(Value::Int(r as i64))
            } else {
                Ok(Value::Float(r))
            }
        }
        BinOp::Pow => {
            if let Some((x, y)) = both_ints(&a, &b) {
                if (0..=u32::MAX as i64).contains(&y) {
                    if let Some(v) = x.checked_pow(y as u32) {
                        return Ok(Value::Int(v));
                    }
                }
            }
            Ok(Value::Float(numeric(&a)?.powf(numeric(&b)?)))
        }
    }
}

fn compare(op: CmpOp, a: &Value, b: &Value) -> Result<bool, EvalError> {
    // Equality works across any pair; ordering needs numbers, strings or
    // timestamps.
    let ordering = match (a, b) {
        (Value::String(x), Value::String(y)) => x.partial_cmp(y),
        (Value::Timestamp(x), Value::Timestamp(y)) => x.partial_cmp(y),
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
    };
    Ok(match op {
        CmpOp::Eq => match ordering {
            Some(ord) => ord == std::cmp::Ordering::Equal,
            None => a == b,
        },
        CmpOp::Ne => match ordering {
            Some(ord) => ord != std::cmp::Ordering::Equal,
            None => a != b,
        },
        CmpOp::Lt => matches!(ordering, Some(std::cmp::Ordering::Less)),
        CmpOp::Le => matches!(
            ordering,
            Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
        ),
        CmpOp::Gt => matches!(ordering, Some(std::cmp::Ordering::Greater)),
        CmpOp::Ge => matches!(
            ordering,
            Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
        ),
    })
}

fn subscript(target: &Value, index: &Value) -> Result<Value, EvalError> {
    match target {
        Value::List(items) => {
            let raw = index
                .as_i64()
                .ok_or_else(|| EvalError::Type("list index must be an integer".into()))?;
            let len = items.len() as i64;
            let idx = if raw < 0 { raw + len } else { raw };
            if idx < 0 || idx >= len {
                return Err(EvalError::IndexOutOfRange(raw));
            }
            Ok(items[idx as usize].clone())
        }
        Value::String(s) => {
            let raw = index
                .as_i64()
                .ok_or_else(|| EvalError::Type("string index must be an integer".into()))?;
            let chars: Vec<char> = s.chars().collect();
            let len = chars.len() as i64;
            let idx = if raw < 0 { raw + len } else { raw };
            if idx < 0 || idx >= len {
                return Err(EvalError::IndexOutOfRange(raw));
            }
            Ok(Value::String(chars[idx as usize].to_string()))
        }
        Value::Map(map) => {
            let key = index
                .as_str()
                .ok_or_else(|| EvalError::Type("map key must be a string".into()))?;
            map.get(key)
                .cloned()
                .ok_or_else(|| EvalError::Type(format!("missing key: {key}")))
        }
        other => Err(EvalError::Type(format!(
            "{} is not subscriptable",
            other.type_name()
        ))),
    }
}

fn call(name: &str, args: &[Value], ns: &Namespace) -> Result<Value, EvalError> {
    let arity = |expected: bool| -> Result<(), EvalError> {
        if expected {
            Ok(())
        } else {
            Err(EvalError::BadArity(name.to_string(), args.len()))
        }
    };

    // Variadic min/max also accept a single list argument.
    let spread = |args: &[Value]| -> Vec<Value> {
        match args {
            [Value::List(items)] => items.clone(),
            other => other.to_vec(),
        }
    };

    match name {
        "abs" => {
            arity(args.len() == 1)?;
            match &args[0] {
                Value::Int(v) => Ok(Value::Int(v.abs())),
                other => Ok(Value::Float(numeric(other)?.abs())),
            }
        }
        "min" | "max" => {
            let items = spread(args);
            arity(!items.is_empty())?;
            let mut best: Option<Value> = None;
            for item in items {
                best = Some(match best {
                    None => item,
                    Some(current) => {
                        let take_new = if name == "min" {
                            compare(CmpOp::Lt, &item, &current)?
                        } else {
                            compare(CmpOp::Gt, &item, &current)?
                        };
                        if take_new { item } else { current }
                    }
                });
            }
            Ok(best.expect("non-empty checked above"))
        }
        "round" => {
            arity(args.len() == 1 || args.len() == 2)?;
            let v = numeric(&args[0])?;
            if args.len() == 1 {
                // Half away from zero, not banker's rounding.
                Ok(Value::Int(v.round() as i64))
            } else {
                let places = args[1]
                    .as_i64()
                    .ok_or_else(|| EvalError::Type("round() places must be an integer".into()))?;
                let factor = 10f64.powi(places as i32);
                Ok(Value::Float((v * factor).round() / factor))
            }
        }
        "sum" => {
            arity(args.len() == 1)?;
            let Value::List(items) = &args[0] else {
                return Err(EvalError::Type("sum() expects a list".into()));
            };
            let mut total = 0.0;
            for item in items {
                total += numeric(item)?;
            }
            Ok(Value::Float(total))
        }
        "len" => {
            arity(args.len() == 1)?;
            match &args[0] {
                Value::List(items) => Ok(Value::Int(items.len() as i64)),
                Value::String(s) => Ok(Value::Int(s.chars().count() as i64)),
                Value::Map(m) => Ok(Value::Int(m.len() as i64)),
                other => Err(EvalError::Type(format!(
                    "{} has no length",
                    other.type_name()
                ))),
            }
        }
        "sqrt" => {
            arity(args.len() == 1)?;
            Ok(Value::Float(numeric(&args[0])?.sqrt()))
        }
        "pow" => {
            arity(args.len() == 2)?;
            Ok(Value::Float(numeric(&args[0])?.powf(numeric(&args[1])?)))
        }
        "log" => {
            arity(args.len() == 1 || args.len() == 2)?;
            let v = numeric(&args[0])?;
            if args.len() == 2 {
                Ok(Value::Float(v.log(numeric(&args[1])?)))
            } else {
                Ok(Value::Float(v.ln()))
            }
        }
        "exp" => {
            arity(args.len() == 1)?;
            Ok(Value::Float(numeric(&args[0])?.exp()))
        }
        "floor" => {
            arity(args.len() == 1)?;
            Ok(Value::Int(numeric(&args[0])?.floor() as i64))
        }
        "ceil" => {
            arity(args.len() == 1)?;
            Ok(Value::Int(numeric(&args[0])?.ceil() as i64))
        }
        _ => {
            if let Some(hook) = &ns.fn_hook {
                if let Some(result) = hook(name, args) {
                    return result;
                }
            }
            Err(EvalError::UnknownFunction(name.to_string()))
        }
    }
}

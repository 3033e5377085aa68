mod interp;
mod lexer;
mod parser;

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, LazyLock, RwLock};

use hashbrown::HashMap;
use miette::Diagnostic;
use thiserror::Error;

use sluice_model::Value;

pub use interp::Namespace;
pub use parser::Expr;

/// Errors from any phase of the tokenize -> parse -> walk pipeline. An
/// eval error fails one field's transformer chain, never the tick.
#[derive(Debug, Error, Diagnostic)]
pub enum EvalError {
    #[error("unexpected character {0:?} at offset {1}")]
    Lex(char, usize),

    #[error("unterminated string literal")]
    UnterminatedString,

    #[error("unexpected token {0} at offset {1}")]
    UnexpectedToken(String, usize),

    #[error("expression ended unexpectedly")]
    UnexpectedEnd,

    #[error("unknown identifier: {0}")]
    UnknownIdentifier(String),

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("{0}() called with {1} arguments")]
    BadArity(String, usize),

    #[error("type error: {0}")]
    Type(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("index {0} out of range")]
    IndexOutOfRange(i64),
}

static AST_CACHE: LazyLock<RwLock<HashMap<u64, Arc<Expr>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

fn source_hash(src: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    src.hash(&mut hasher);
    hasher.finish()
}

/// Parse with a process-wide AST cache keyed by source hash. Transformer
/// expressions repeat every tick, so this is on the hot path.
pub fn parse_cached(src: &str) -> Result<Arc<Expr>, EvalError> {
    let key = source_hash(src);
    if let Some(ast) = AST_CACHE.read().expect("ast cache poisoned").get(&key) {
        return Ok(ast.clone());
    }
    let tokens = lexer::tokenize(src)?;
    let ast = Arc::new(parser::parse(&tokens)?);
    AST_CACHE
        .write()
        .expect("ast cache poisoned")
        .insert(key, ast.clone());
    Ok(ast)
}

/// Evaluate a sandboxed expression against a fixed namespace. Only
/// whitelisted node kinds exist in the AST by construction; identifiers
/// resolve against the namespace or the math constants, and calls only
/// reach the built-in table plus the namespace's registered functions.
pub fn safe_eval(src: &str, ns: &Namespace) -> Result<Value, EvalError> {
    let ast = parse_cached(src)?;
    interp::evaluate(&ast, ns)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(src: &str) -> Value {
        safe_eval(src, &Namespace::new()).expect(src)
    }

    #[test]
    fn arithmetic_matches_unsandboxed_semantics() {
        assert_eq!(eval("1 + 2 * 3"), Value::Int(7));
        assert_eq!(eval("(1 + 2) * 3"), Value::Int(9));
        assert_eq!(eval("10 / 4"), Value::Float(2.5));
        assert_eq!(eval("10 // 4"), Value::Int(2));
        assert_eq!(eval("10 % 3"), Value::Int(1));
        assert_eq!(eval("2 ** 10"), Value::Int(1024));
        assert_eq!(eval("-3 + 1"), Value::Int(-2));
        assert_eq!(eval("40000 * 1.0"), Value::Float(40000.0));
    }

    #[test]
    fn comparisons_and_boolean_logic() {
        assert_eq!(eval("1 < 2"), Value::Bool(true));
        assert_eq!(eval("2 <= 1"), Value::Bool(false));
        assert_eq!(eval("1 < 2 and 3 > 2"), Value::Bool(true));
        assert_eq!(eval("1 > 2 or 3 > 2"), Value::Bool(true));
        assert_eq!(eval("not (1 > 2)"), Value::Bool(true));
        assert_eq!(eval("1 < 2 < 3"), Value::Bool(true));
        assert_eq!(eval("1 < 2 > 3"), Value::Bool(false));
        assert_eq!(eval("'abc' == 'abc'"), Value::Bool(true));
    }

    #[test]
    fn conditionals_lists_and_subscripts() {
        assert_eq!(eval("1 if 2 > 1 else 0"), Value::Int(1));
        assert_eq!(eval("1 if 2 < 1 else 0"), Value::Int(0));
        assert_eq!(eval("[1, 2, 3][1]"), Value::Int(2));
        assert_eq!(eval("[1, 2, 3][-1]"), Value::Int(3));
        assert_eq!(eval("'hello'[1]"), Value::String("e".into()));
        assert_eq!(eval("len([1, 2, 3])"), Value::Int(3));
    }

    #[test]
    fn math_namespace() {
        assert_eq!(eval("abs(-4)"), Value::Int(4));
        assert_eq!(eval("min(3, 1, 2)"), Value::Int(1));
        assert_eq!(eval("max(3, 1, 2)"), Value::Int(3));
        assert_eq!(eval("round(2.5)"), Value::Int(3));
        assert_eq!(eval("sum([1, 2, 3])"), Value::Float(6.0));
        assert_eq!(eval("sqrt(9)"), Value::Float(3.0));
        assert_eq!(eval("pow(2, 3)"), Value::Float(8.0));
        assert_eq!(eval("floor(2.9)"), Value::Int(2));
        assert_eq!(eval("ceil(2.1)"), Value::Int(3));
        let Value::Float(pi) = eval("pi") else {
            panic!("pi should be a float")
        };
        assert!((pi - std::f64::consts::PI).abs() < 1e-12);
    }

    #[test]
    fn identifiers_resolve_from_the_namespace_only() {
        let mut ns = Namespace::new();
        ns.bind("price", Value::Float(30.0));
        assert_eq!(safe_eval("price / 2", &ns).unwrap(), Value::Float(15.0));
        assert!(matches!(
            safe_eval("volume", &ns),
            Err(EvalError::UnknownIdentifier(_))
        ));
    }

    #[test]
    fn state_outside_the_namespace_is_unreachable() {
        // Attribute access is not even parseable.
        assert!(safe_eval("().__class__", &Namespace::new()).is_err());
        assert!(safe_eval("a.b", &Namespace::new()).is_err());
        // Assignment is not parseable either.
        assert!(safe_eval("x = 1", &Namespace::new()).is_err());
        // Unknown callables are rejected at walk time.
        assert!(matches!(
            safe_eval("open('/etc/passwd')", &Namespace::new()),
            Err(EvalError::UnknownFunction(_))
        ));
    }

    #[test]
    fn division_by_zero_is_an_error_value() {
        assert!(matches!(eval_err("1 / 0"), EvalError::DivisionByZero));
        assert!(matches!(eval_err("1 % 0"), EvalError::DivisionByZero));
    }

    fn eval_err(src: &str) -> EvalError {
        safe_eval(src, &Namespace::new()).unwrap_err()
    }

    #[test]
    fn cache_returns_identical_asts() {
        let a = parse_cached("1 + 2 * 3").unwrap();
        let b = parse_cached("1 + 2 * 3").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn string_concat() {
        assert_eq!(eval("'a' + 'b'"), Value::String("ab".into()));
    }
}

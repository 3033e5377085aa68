use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use log::{debug, error};
use md5::Md5;
use miette::Diagnostic;
use sha2::{Digest, Sha256};
use thiserror::Error;

use sluice_model::{Ingester, Snapshot, Value};
use sluice_store::{Registry, Tsdb};

use crate::eval::{EvalError, Namespace, safe_eval};

#[derive(Debug, Error, Diagnostic)]
pub enum TransformError {
    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error("invalid series transformer: {0}")]
    BadSeriesExpr(String),

    #[error("invalid transformer target: {0}")]
    UnknownTarget(String),

    #[error("unknown series aggregator: {0}")]
    UnknownAggregator(String),

    #[error("{0} cannot be applied to {1}")]
    BadInput(&'static str, &'static str),

    #[error("series load failed")]
    Store(#[from] sluice_store::StoreError),

    #[error("no storage adapter available for series transformer")]
    NoStorage,
}

/// Scalar transformers addressable by bare name in a transformer chain
/// and as functions inside expressions. The spelling stays stringly for
/// configs; dispatch is this enum's match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseTransformer {
    Lower,
    Upper,
    Capitalize,
    Title,
    Int,
    Float,
    Str,
    Bool,
    ToJson,
    ToSnake,
    ToKebab,
    Slugify,
    ToCamel,
    ToPascal,
    Strip,
    Reverse,
    ShortenAddress,
    RemovePunctuation,
    Bin,
    Hex,
    Sha256Digest,
    Md5Digest,
    Round(u8),
}

impl BaseTransformer {
    pub fn from_name(name: &str) -> Option<BaseTransformer> {
        Some(match name {
            "lower" => BaseTransformer::Lower,
            "upper" => BaseTransformer::Upper,
            "capitalize" => BaseTransformer::Capitalize,
            "title" => BaseTransformer::Title,
            "int" => BaseTransformer::Int,
            "float" => BaseTransformer::Float,
            "str" => BaseTransformer::Str,
            "bool" => BaseTransformer::Bool,
            "to_json" => BaseTransformer::ToJson,
            "to_snake" => BaseTransformer::ToSnake,
            "to_kebab" => BaseTransformer::ToKebab,
            "slugify" => BaseTransformer::Slugify,
            "to_camel" => BaseTransformer::ToCamel,
            "to_pascal" => BaseTransformer::ToPascal,
            "strip" => BaseTransformer::Strip,
            "reverse" => BaseTransformer::Reverse,
            "shorten_address" => BaseTransformer::ShortenAddress,
            "remove_punctuation" => BaseTransformer::RemovePunctuation,
            "bin" => BaseTransformer::Bin,
            "hex" => BaseTransformer::Hex,
            "sha256digest" => BaseTransformer::Sha256Digest,
            "md5digest" => BaseTransformer::Md5Digest,
            "round" => BaseTransformer::Round(0),
            other => {
                let n: u8 = other.strip_prefix("round")?.parse().ok()?;
                if (1..=10).contains(&n) {
                    BaseTransformer::Round(n)
                } else {
                    return None;
                }
            }
        })
    }

    pub fn apply(self, value: &Value) -> Result<Value, TransformError> {
        let text = || value.to_string();
        let number = |v: &Value| {
            v.as_f64()
                .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
                .ok_or(TransformError::BadInput("numeric transformer", v.type_name()))
        };
        Ok(match self {
            BaseTransformer::Lower => Value::String(text().to_lowercase()),
            BaseTransformer::Upper => Value::String(text().to_uppercase()),
            BaseTransformer::Capitalize => {
                let s = text();
                let mut chars = s.chars();
                Value::String(match chars.next() {
                    Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                    None => s,
                })
            }
            BaseTransformer::Title => Value::String(
                text()
                    .split(' ')
                    .map(|word| {
                        let mut chars = word.chars();
                        match chars.next() {
                            Some(first) => {
                                first.to_uppercase().collect::<String>()
                                    + &chars.as_str().to_lowercase()
                            }
                            None => String::new(),
                        }
                    })
                    .collect::<Vec<_>>()
                    .join(" "),
            ),
            BaseTransformer::Int => Value::Int(match value {
                Value::Float(f) => *f as i64,
                other => number(other)? as i64,
            }),
            BaseTransformer::Float => Value::Float(number(value)?),
            BaseTransformer::Str => Value::String(text()),
            BaseTransformer::Bool => Value::Bool(value.is_truthy()),
            BaseTransformer::ToJson => Value::String(
                serde_json::to_string(&value.to_json()).unwrap_or_default(),
            ),
            BaseTransformer::ToSnake => Value::String(join_tokens(&text(), "_", false)),
            BaseTransformer::ToKebab | BaseTransformer::Slugify => {
                Value::String(join_tokens(&text(), "-", false))
            }
            BaseTransformer::ToCamel | BaseTransformer::ToPascal => {
                Value::String(join_tokens(&text(), "", true))
            }
            BaseTransformer::Strip => Value::String(text().trim().to_string()),
            BaseTransformer::Reverse => Value::String(text().chars().rev().collect()),
            BaseTransformer::ShortenAddress => {
                let s = text();
                let chars: Vec<char> = s.chars().collect();
                if chars.len() <= 10 {
                    Value::String(s)
                } else {
                    let head: String = chars[..6].iter().collect();
                    let tail: String = chars[chars.len() - 4..].iter().collect();
                    Value::String(format!("{head}...{tail}"))
                }
            }
            BaseTransformer::RemovePunctuation => {
                Value::String(text().chars().filter(|c| !c.is_ascii_punctuation()).collect())
            }
            BaseTransformer::Bin => {
                let n = number(value)? as i64;
                Value::String(format!("{n:b}"))
            }
            BaseTransformer::Hex => {
                let n = number(value)? as i64;
                Value::String(format!("{n:x}"))
            }
            BaseTransformer::Sha256Digest => {
                let digest = Sha256::digest(text().as_bytes());
                Value::String(format!("{digest:x}"))
            }
            BaseTransformer::Md5Digest => {
                let digest = Md5::digest(text().as_bytes());
                Value::String(format!("{digest:x}"))
            }
            BaseTransformer::Round(0) => Value::Int(number(value)?.round() as i64),
            BaseTransformer::Round(places) => {
                let factor = 10f64.powi(i32::from(places));
                Value::Float((number(value)? * factor).round() / factor)
            }
        })
    }
}

fn join_tokens(text: &str, separator: &str, capitalize: bool) -> String {
    text.split(' ')
        .filter(|t| !t.is_empty())
        .map(|token| {
            if capitalize {
                let mut chars = token.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                    None => String::new(),
                }
            } else {
                token.to_lowercase()
            }
        })
        .collect::<Vec<_>>()
        .join(separator)
}

/// Rolling reducers applied to a loaded history window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesAggregator {
    Median,
    Mean,
    Std,
    Var,
    Min,
    Max,
    Sum,
    Cumsum,
    Prod,
}

impl SeriesAggregator {
    pub fn from_name(name: &str) -> Option<SeriesAggregator> {
        Some(match name {
            "median" => SeriesAggregator::Median,
            "mean" => SeriesAggregator::Mean,
            "std" => SeriesAggregator::Std,
            "var" => SeriesAggregator::Var,
            "min" => SeriesAggregator::Min,
            "max" => SeriesAggregator::Max,
            "sum" => SeriesAggregator::Sum,
            "cumsum" => SeriesAggregator::Cumsum,
            "prod" => SeriesAggregator::Prod,
            _ => return None,
        })
    }

    pub fn apply(self, series: &[f64]) -> Value {
        if series.is_empty() {
            return Value::Null;
        }
        let n = series.len() as f64;
        let mean = series.iter().sum::<f64>() / n;
        match self {
            SeriesAggregator::Median => {
                let mut sorted = series.to_vec();
                sorted.sort_by(|a, b| a.total_cmp(b));
                let mid = sorted.len() / 2;
                if sorted.len() % 2 == 0 {
                    Value::Float((sorted[mid - 1] + sorted[mid]) / 2.0)
                } else {
                    Value::Float(sorted[mid])
                }
            }
            SeriesAggregator::Mean => Value::Float(mean),
            SeriesAggregator::Std => {
                let var = series.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
                Value::Float(var.sqrt())
            }
            SeriesAggregator::Var => {
                Value::Float(series.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n)
            }
            SeriesAggregator::Min => {
                Value::Float(series.iter().copied().fold(f64::INFINITY, f64::min))
            }
            SeriesAggregator::Max => {
                Value::Float(series.iter().copied().fold(f64::NEG_INFINITY, f64::max))
            }
            SeriesAggregator::Sum => Value::Float(series.iter().sum()),
            SeriesAggregator::Cumsum => {
                let mut total = 0.0;
                Value::List(
                    series
                        .iter()
                        .map(|v| {
                            total += v;
                            Value::Float(total)
                        })
                        .collect(),
                )
            }
            SeriesAggregator::Prod => Value::Float(series.iter().product()),
        }
    }
}

/// Where `{Ingester.field}` references read from. The registry is the
/// production source; tests stub it with a map.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn snapshot(&self, resource: &str) -> Option<Snapshot>;
}

#[async_trait]
impl SnapshotSource for Registry {
    async fn snapshot(&self, resource: &str) -> Option<Snapshot> {
        self.get_snapshot(resource).await.ok().flatten()
    }
}

#[async_trait]
impl SnapshotSource for HashMap<String, Snapshot> {
    async fn snapshot(&self, resource: &str) -> Option<Snapshot> {
        self.get(resource).cloned()
    }
}

/// Everything one transformation pass may consult outside the tick.
pub struct TransformDeps<'a> {
    pub snapshots: &'a dyn SnapshotSource,
    pub tsdb: Option<Arc<dyn Tsdb>>,
    pub now: DateTime<Utc>,
}

/// Walk every field's transformer chain in declaration order. A failing
/// field keeps its prior value and does not stop the tick; the return
/// value counts fields that transformed cleanly.
pub async fn transform_all(ing: &mut Ingester, deps: &TransformDeps<'_>) -> usize {
    let mut data_by_field: HashMap<String, Value> = HashMap::new();
    let mut ok = 0usize;
    for idx in 0..ing.fields.len() {
        let name = ing.fields[idx].name.clone();
        match transform_field(ing, idx, &mut data_by_field, deps).await {
            Ok(value) => {
                data_by_field.insert(name, value);
                ok += 1;
            }
            Err(e) => {
                error!(
                    "{}.{name} transformer error: {e}, check {} output and transformer chain",
                    ing.name, ing.ingester_kind
                );
                // The field keeps its prior value; siblings may still
                // reference it through the registry snapshot.
                data_by_field.insert(name, ing.fields[idx].value.clone());
            }
        }
    }
    debug!("transformed {} ({ok}/{} fields)", ing.name, ing.fields.len());
    ok
}

async fn transform_field(
    ing: &mut Ingester,
    idx: usize,
    data_by_field: &mut HashMap<String, Value>,
    deps: &TransformDeps<'_>,
) -> Result<Value, TransformError> {
    let transformers = ing.fields[idx].transformers.clone();
    for transformer in &transformers {
        let next = apply_transformer(ing, idx, transformer, data_by_field, deps).await?;
        ing.fields[idx].value = next;
    }
    Ok(ing.fields[idx].value.clone())
}

/// One transformer application, mirroring the documented pipeline:
/// cached-reference expansion, bare-word fast path, series expansion,
/// self/sibling substitution, then the sandboxed evaluator.
pub async fn apply_transformer(
    ing: &mut Ingester,
    idx: usize,
    transformer: &str,
    data_by_field: &HashMap<String, Value>,
    deps: &TransformDeps<'_>,
) -> Result<Value, TransformError> {
    if transformer.is_empty() {
        return Ok(ing.fields[idx].value.clone());
    }

    // Per-call cache: one registry lookup per referenced ingester.
    let mut ref_cache: HashMap<String, Option<Snapshot>> = HashMap::new();
    let expanded =
        resolve_cached_references(ing, transformer, data_by_field, deps, &mut ref_cache).await;

    if is_bare_word(&expanded) {
        if let Ok(number) = expanded.parse::<f64>() {
            return Ok(Value::Float(number));
        }
        if let Some(base) = BaseTransformer::from_name(&expanded) {
            return base.apply(&ing.fields[idx].value);
        }
        return Ok(ing.fields[idx].value.clone());
    }

    let expanded = expand_series_transformers(ing, idx, &expanded, deps).await?;

    // `{self}` first, then current-tick siblings.
    let mut expr = expanded.replace("{self}", &ing.fields[idx].value.to_string());
    for (name, value) in data_by_field {
        expr = expr.replace(&format!("{{{name}}}"), &value.to_string());
    }

    let ns = Namespace::new().with_fn_hook(Arc::new(|name, args| {
        let base = BaseTransformer::from_name(name)?;
        let Some(arg) = args.first() else {
            return Some(Err(EvalError::BadArity(name.to_string(), 0)));
        };
        Some(
            base.apply(arg)
                .map_err(|e| EvalError::Type(e.to_string())),
        )
    }));
    Ok(safe_eval(&expr, &ns)?)
}

fn is_bare_word(s: &str) -> bool {
    !s.is_empty() && !s.contains([' ', '{', '}'])
}

/// Expand `{Ingester.field}` and `{Ingester.idx}` placeholders from the
/// cached snapshots. `{self}`, series groups and current-tick sibling
/// names are left for later phases.
async fn resolve_cached_references(
    ing: &Ingester,
    transformer: &str,
    data_by_field: &HashMap<String, Value>,
    deps: &TransformDeps<'_>,
    ref_cache: &mut HashMap<String, Option<Snapshot>>,
) -> String {
    let mut out = transformer.to_string();
    for (group, follows_series_sep) in brace_groups(transformer) {
        if follows_series_sep
            || group.contains("::")
            || group == "self"
            || data_by_field.contains_key(group.as_str())
        {
            continue;
        }
        let (resource, field_name) = match group.split_once('.') {
            Some((head, tail)) if !head.is_empty() => (head.to_string(), tail.to_string()),
            _ => {
                // Bare name not computed this tick: it may still resolve
                // from our own previous snapshot.
                if ing.field(&group).is_none() {
                    continue;
                }
                (ing.name.clone(), group.clone())
            }
        };

        let snapshot = match ref_cache.get(&resource) {
            Some(cached) => cached.clone(),
            None => {
                let fetched = deps.snapshots.snapshot(&resource).await;
                ref_cache.insert(resource.clone(), fetched.clone());
                fetched
            }
        };
        let Some(snapshot) = snapshot else {
            error!("no cached data found for {resource}");
            continue;
        };
        match snapshot.get(&field_name) {
            Some(value) => {
                out = out.replace(&format!("{{{group}}}"), &value.to_string());
            }
            None => {
                error!("field {field_name} not found in cached data for {resource}");
            }
        }
    }
    out
}

/// Replace each series group with its aggregated scalar, loading the
/// window from storage. Both spellings in the wild are accepted:
/// `{target::fn(lookback)}` and `{target}::fn(lookback)`.
async fn expand_series_transformers(
    ing: &Ingester,
    idx: usize,
    transformer: &str,
    deps: &TransformDeps<'_>,
) -> Result<String, TransformError> {
    let mut out = transformer.to_string();
    while let Some((span, target, fn_name, lookback)) = find_series_expr(&out) {
        let expr = out[span.clone()].to_string();
        if target.is_empty() || fn_name.is_empty() || lookback.is_empty() {
            return Err(TransformError::BadSeriesExpr(expr));
        }

        let target_field = if target == "self" {
            &ing.fields[idx]
        } else {
            ing.field(&target)
                .ok_or_else(|| TransformError::UnknownTarget(target.clone()))?
        };
        let aggregator = SeriesAggregator::from_name(&fn_name)
            .ok_or_else(|| TransformError::UnknownAggregator(fn_name.clone()))?;
        let lookback: sluice_model::Interval = lookback
            .parse()
            .map_err(|_| TransformError::BadSeriesExpr(expr.clone()))?;

        let tsdb = deps.tsdb.as_ref().ok_or(TransformError::NoStorage)?;
        let from = deps.now - lookback.delta();
        let window = tsdb
            .fetch(
                &ing.name,
                from,
                deps.now,
                ing.interval,
                std::slice::from_ref(&target_field.name),
                false,
            )
            .await?;
        let series = window.numeric_column(&target_field.name);
        let aggregated = aggregator.apply(&series);
        // cumsum yields a vector; its last element is what substitutes.
        let scalar = match aggregated {
            Value::List(items) => items.last().cloned().unwrap_or(Value::Null),
            other => other,
        };
        out.replace_range(span, &scalar.to_string());
    }
    Ok(out)
}

/// Locate the first series expression: `target` between the nearest `{`
/// left of `::` (with an optional closing brace), then `fn(lookback)`,
/// with an optional trailing `}`. Returns the byte span to replace.
fn find_series_expr(s: &str) -> Option<(std::ops::Range<usize>, String, String, String)> {
    let sep = s.find("::")?;
    let open = s[..sep].rfind('{')?;
    let target = s[open + 1..sep].trim_end_matches('}').to_string();
    let rest = &s[sep + 2..];
    let paren = rest.find('(')?;
    let close = rest.find(')')?;
    if close < paren {
        return None;
    }
    let fn_name = rest[..paren].to_string();
    let lookback = rest[paren + 1..close].to_string();
    let mut end = sep + 2 + close + 1;
    if s.as_bytes().get(end) == Some(&b'}') {
        end += 1;
    }
    Some((open..end, target, fn_name, lookback))
}

/// All `{...}` groups in source order with a flag marking groups directly
/// followed by `::` (the target of a series transformer, handled later).
fn brace_groups(s: &str) -> Vec<(String, bool)> {
    let mut groups = Vec::new();
    let mut rest = s;
    while let Some(open) = rest.find('{') {
        rest = &rest[open + 1..];
        let Some(close) = rest.find('}') else { break };
        let group = rest[..close].to_string();
        rest = &rest[close + 1..];
        groups.push((group, rest.starts_with("::")));
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sluice_model::{Field, FieldType, IngesterKind, ResourceKind};
    use sluice_store::SqliteTsdb;

    fn ingester(name: &str, fields: Vec<Field>) -> Ingester {
        Ingester {
            name: name.into(),
            resource_kind: ResourceKind::Timeseries,
            ingester_kind: IngesterKind::HttpApi,
            interval: "m5".parse().unwrap(),
            fields,
            target: String::new(),
            selector: String::new(),
            params: serde_json::Value::Null,
            transformers: Vec::new(),
            tags: Vec::new(),
            protected: false,
            last_ingested: None,
        }
        .finalize(IngesterKind::HttpApi)
        .unwrap()
    }

    fn field(name: &str, transformers: &[&str]) -> Field {
        let mut f = Field::new(name, FieldType::Float64);
        f.transformers = transformers.iter().map(|t| t.to_string()).collect();
        f
    }

    fn deps<'a>(snapshots: &'a HashMap<String, Snapshot>) -> TransformDeps<'a> {
        TransformDeps {
            snapshots,
            tsdb: None,
            now: Utc::now(),
        }
    }

    #[tokio::test]
    async fn identity_expression_keeps_the_raw_value() {
        let mut ing = ingester("BTCUSD", vec![field("price", &["{self} * 1.0"])]);
        ing.set_value("price", Value::Float(40_000.0));
        let snapshots = HashMap::new();
        transform_all(&mut ing, &deps(&snapshots)).await;
        assert_eq!(ing.field("price").unwrap().value, Value::Float(40_000.0));
    }

    #[tokio::test]
    async fn cross_ingester_reference_reads_the_cached_snapshot() {
        // AVAX.price_in_usdt = {self} / {USDT.1}, with USDT's snapshot
        // holding field "1" = 1.0.
        let mut ing = ingester("AVAX", vec![field("price_in_usdt", &["{self} / {USDT.1}"])]);
        ing.set_value("price_in_usdt", Value::Float(30.0));
        let mut snapshots = HashMap::new();
        let mut usdt = Snapshot::new();
        usdt.insert("1".to_string(), Value::Float(1.0));
        snapshots.insert("USDT".to_string(), usdt);
        transform_all(&mut ing, &deps(&snapshots)).await;
        assert_eq!(
            ing.field("price_in_usdt").unwrap().value,
            Value::Float(30.0)
        );
    }

    #[tokio::test]
    async fn sibling_references_use_current_tick_values() {
        let mut ing = ingester(
            "PAIR",
            vec![field("base", &[]), field("spread", &["{base} * 0.01"])],
        );
        ing.set_value("base", Value::Float(200.0));
        let snapshots = HashMap::new();
        transform_all(&mut ing, &deps(&snapshots)).await;
        assert_eq!(ing.field("spread").unwrap().value, Value::Float(2.0));
    }

    #[tokio::test]
    async fn bare_word_transformers_and_numeric_literals() {
        let mut ing = ingester(
            "T",
            vec![
                field("sym", &["upper"]),
                field("fixed", &["1.5"]),
                field("rounded", &["round2"]),
            ],
        );
        ing.set_value("sym", Value::String("btcusd".into()));
        ing.set_value("rounded", Value::Float(3.14159));
        let snapshots = HashMap::new();
        transform_all(&mut ing, &deps(&snapshots)).await;
        assert_eq!(
            ing.field("sym").unwrap().value,
            Value::String("BTCUSD".into())
        );
        assert_eq!(ing.field("fixed").unwrap().value, Value::Float(1.5));
        assert_eq!(ing.field("rounded").unwrap().value, Value::Float(3.14));
    }

    #[tokio::test]
    async fn failing_field_keeps_prior_value_and_tick_continues() {
        let mut ing = ingester(
            "T",
            vec![field("bad", &["{self} / 0"]), field("good", &["{self} + 1"])],
        );
        ing.set_value("bad", Value::Float(5.0));
        ing.set_value("good", Value::Float(1.0));
        let snapshots = HashMap::new();
        let ok = transform_all(&mut ing, &deps(&snapshots)).await;
        // ts transforms trivially (no transformers), bad fails, good runs.
        assert_eq!(ok, 2);
        assert_eq!(ing.field("bad").unwrap().value, Value::Float(5.0));
        assert_eq!(ing.field("good").unwrap().value, Value::Float(2.0));
    }

    #[tokio::test]
    async fn series_transformer_aggregates_history() {
        // Five points 1..5 over the past hour; {self}::mean(h1) -> 3.
        let tsdb = Arc::new(SqliteTsdb::connect(":memory:").await.unwrap());
        let mut ing = ingester("P", vec![field("p", &["{self}::mean(h1)"])]);
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        for i in 1..=5i64 {
            ing.set_value(
                "ts",
                Value::Timestamp(now - chrono::Duration::minutes(55 - i * 5)),
            );
            ing.set_value("p", Value::Float(i as f64));
            tsdb.insert(&ing, None).await.unwrap();
        }
        ing.set_value("p", Value::Float(99.0));
        let snapshots = HashMap::new();
        let deps = TransformDeps {
            snapshots: &snapshots,
            tsdb: Some(tsdb),
            now,
        };
        transform_all(&mut ing, &deps).await;
        assert_eq!(ing.field("p").unwrap().value, Value::Float(3.0));
    }

    #[test]
    fn base_transformer_table() {
        let apply = |name: &str, v: Value| {
            BaseTransformer::from_name(name)
                .unwrap_or_else(|| panic!("missing {name}"))
                .apply(&v)
                .unwrap()
        };
        assert_eq!(apply("lower", "MiXeD".into()), Value::String("mixed".into()));
        assert_eq!(apply("title", "hello world".into()), Value::String("Hello World".into()));
        assert_eq!(apply("int", Value::Float(3.9)), Value::Int(3));
        assert_eq!(apply("float", "2.5".into()), Value::Float(2.5));
        assert_eq!(apply("bool", Value::Int(0)), Value::Bool(false));
        assert_eq!(
            apply("to_snake", "Hello Big World".into()),
            Value::String("hello_big_world".into())
        );
        assert_eq!(
            apply("to_pascal", "hello world".into()),
            Value::String("HelloWorld".into())
        );
        assert_eq!(apply("strip", "  x  ".into()), Value::String("x".into()));
        assert_eq!(apply("reverse", "abc".into()), Value::String("cba".into()));
        assert_eq!(
            apply(
                "shorten_address",
                "0xabcdef0123456789abcdef0123456789abcdef01".into()
            ),
            Value::String("0xabcd...ef01".into())
        );
        assert_eq!(
            apply("remove_punctuation", "a.b,c!".into()),
            Value::String("abc".into())
        );
        assert_eq!(apply("bin", Value::Int(5)), Value::String("101".into()));
        assert_eq!(apply("hex", Value::Int(255)), Value::String("ff".into()));
        assert_eq!(apply("round", Value::Float(2.6)), Value::Int(3));
        assert_eq!(apply("round4", Value::Float(1.23456)), Value::Float(1.2346));
        // Known digest of "abc".
        assert_eq!(
            apply("sha256digest", "abc".into()),
            Value::String(
                "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad".into()
            )
        );
        assert_eq!(
            apply("md5digest", "abc".into()),
            Value::String("900150983cd24fb0d6963f7d28e17f72".into())
        );
        assert!(BaseTransformer::from_name("round11").is_none());
        assert!(BaseTransformer::from_name("eval").is_none());
    }

    #[test]
    fn series_aggregators() {
        let series = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(SeriesAggregator::Mean.apply(&series), Value::Float(3.0));
        assert_eq!(SeriesAggregator::Median.apply(&series), Value::Float(3.0));
        assert_eq!(SeriesAggregator::Min.apply(&series), Value::Float(1.0));
        assert_eq!(SeriesAggregator::Max.apply(&series), Value::Float(5.0));
        assert_eq!(SeriesAggregator::Sum.apply(&series), Value::Float(15.0));
        assert_eq!(SeriesAggregator::Prod.apply(&series), Value::Float(120.0));
        assert_eq!(SeriesAggregator::Var.apply(&series), Value::Float(2.0));
        let Value::Float(std) = SeriesAggregator::Std.apply(&series) else {
            panic!("std should be a float")
        };
        assert!((std - 2.0f64.sqrt()).abs() < 1e-12);
        assert_eq!(
            SeriesAggregator::Cumsum.apply(&series),
            Value::List(vec![
                Value::Float(1.0),
                Value::Float(3.0),
                Value::Float(6.0),
                Value::Float(10.0),
                Value::Float(15.0),
            ])
        );
        assert_eq!(SeriesAggregator::Mean.apply(&[]), Value::Null);
    }

    #[test]
    fn series_expr_parsing_accepts_both_spellings() {
        let (span, target, fn_name, lookback) =
            find_series_expr("{self::mean(h1)}").unwrap();
        assert_eq!((span.start, span.end), (0, 16));
        assert_eq!((target.as_str(), fn_name.as_str(), lookback.as_str()), ("self", "mean", "h1"));

        let (span, target, fn_name, lookback) =
            find_series_expr("{price}::cumsum(D1) + 1").unwrap();
        assert_eq!(&"{price}::cumsum(D1) + 1"[span], "{price}::cumsum(D1)");
        assert_eq!(
            (target.as_str(), fn_name.as_str(), lookback.as_str()),
            ("price", "cumsum", "D1")
        );

        assert!(find_series_expr("{self}::mean").is_none());
        assert!(find_series_expr("no series here").is_none());
    }
}

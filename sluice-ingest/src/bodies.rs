use std::sync::LazyLock;

use async_trait::async_trait;
use log::{debug, warn};
use miette::Diagnostic;
use thiserror::Error;

use sluice_model::{ConfigError, Ingester, IngesterKind, Value};
use sluice_store::Registry;

/// Process-wide HTTP client with connection reuse.
static HTTP: LazyLock<reqwest::Client> = LazyLock::new(reqwest::Client::new);

#[derive(Debug, Error, Diagnostic)]
pub enum BodyError {
    #[error("error building request for {0}")]
    RequestBuild(String, #[source] reqwest::Error),

    #[error("error executing request for {0}")]
    RequestExecute(String, #[source] reqwest::Error),

    #[error("{0} returned a server error")]
    Status(String, #[source] reqwest::Error),

    #[error("error extracting response body from {0}")]
    ResponseBody(String, #[source] reqwest::Error),

    #[error("error deserializing response from {0}")]
    Deserialize(String, #[source] serde_json::Error),

    #[error("registry unavailable while seeding processor state")]
    Registry(#[from] sluice_store::RegistryError),
}

/// The per-tick raw-data fetch. The scheduler owns scheduling, claiming,
/// transformation and persistence; a body only populates field values.
#[async_trait]
pub trait IngesterBody: Send + Sync {
    async fn run(&self, ing: &mut Ingester) -> Result<(), BodyError>;
}

/// Resolve the body for a configured dispatch kind. Kinds without a body
/// in this build (chain readers, stream consumers) are rejected at config
/// load rather than silently skipped at runtime.
pub fn body_for(
    ing: &Ingester,
    registry: Registry,
) -> Result<Box<dyn IngesterBody>, ConfigError> {
    match ing.ingester_kind {
        IngesterKind::HttpApi => Ok(Box::new(HttpApiBody)),
        IngesterKind::Processor => Ok(Box::new(ProcessorBody { registry })),
        other => Err(ConfigError::UnsupportedKind {
            ingester: ing.name.clone(),
            kind: other.to_string(),
        }),
    }
}

/// Polls JSON HTTP endpoints. Fields sharing a target are fetched once;
/// each field extracts its value with a dot-path selector
/// (`data.0.last`). An empty selector takes the whole document.
pub struct HttpApiBody;

#[async_trait]
impl IngesterBody for HttpApiBody {
    async fn run(&self, ing: &mut Ingester) -> Result<(), BodyError> {
        let mut fetched: hashbrown::HashMap<String, serde_json::Value> = hashbrown::HashMap::new();

        for idx in 0..ing.fields.len() {
            let (target, selector, params) = {
                let field = &ing.fields[idx];
                (
                    field.target.clone(),
                    field.selector.clone(),
                    field.params.clone(),
                )
            };
            if target.is_empty() {
                continue;
            }
            if !fetched.contains_key(&target) {
                let document = fetch_json(&target, &params).await?;
                fetched.insert(target.clone(), document);
            }
            let document = &fetched[&target];
            match json_select(document, &selector) {
                Some(extract) => {
                    ing.fields[idx].value = Value::from_json(extract.clone());
                }
                None => {
                    warn!(
                        "{}.{}: selector {selector:?} matched nothing in {target}",
                        ing.name, ing.fields[idx].name
                    );
                    ing.fields[idx].value = Value::Null;
                }
            }
        }
        Ok(())
    }
}

async fn fetch_json(
    target: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, BodyError> {
    let mut request = HTTP.get(target);
    if let serde_json::Value::Object(entries) = params {
        let query: Vec<(String, String)> = entries
            .iter()
            .map(|(k, v)| {
                let rendered = match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), rendered)
            })
            .collect();
        request = request.query(&query);
    }
    let request = request
        .build()
        .map_err(|e| BodyError::RequestBuild(target.to_string(), e))?;
    let response = HTTP
        .execute(request)
        .await
        .map_err(|e| BodyError::RequestExecute(target.to_string(), e))?
        .error_for_status()
        .map_err(|e| BodyError::Status(target.to_string(), e))?;
    let text = response
        .text()
        .await
        .map_err(|e| BodyError::ResponseBody(target.to_string(), e))?;
    serde_json::from_str(&text).map_err(|e| BodyError::Deserialize(target.to_string(), e))
}

/// Walk a dot path through a JSON document; numeric segments index
/// arrays.
pub fn json_select<'a>(
    document: &'a serde_json::Value,
    selector: &str,
) -> Option<&'a serde_json::Value> {
    if selector.is_empty() {
        return Some(document);
    }
    let mut current = document;
    for segment in selector.split('.') {
        current = match current {
            serde_json::Value::Object(map) => map.get(segment)?,
            serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Post-processors fetch nothing; they start from the previous committed
/// snapshot and let the transformer chain derive everything else.
pub struct ProcessorBody {
    registry: Registry,
}

#[async_trait]
impl IngesterBody for ProcessorBody {
    async fn run(&self, ing: &mut Ingester) -> Result<(), BodyError> {
        if let Some(snapshot) = self.registry.get_snapshot(&ing.name).await? {
            ing.load_snapshot(&snapshot);
        } else {
            debug!("{}: no prior snapshot; starting from nulls", ing.name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_select_walks_objects_and_arrays() {
        let doc = serde_json::json!({
            "data": { "ticker": [{ "last": 40000.5 }] }
        });
        assert_eq!(
            json_select(&doc, "data.ticker.0.last"),
            Some(&serde_json::json!(40000.5))
        );
        assert_eq!(json_select(&doc, ""), Some(&doc));
        assert_eq!(json_select(&doc, "data.missing"), None);
        assert_eq!(json_select(&doc, "data.ticker.7"), None);
    }
}

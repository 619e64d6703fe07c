use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;
use serde_yaml_ng::{Mapping, Value};
use thiserror::Error;

/// Top-level key holding the service collection of a compose document.
const SERVICES_KEY: &str = "services";

/// Errors raised while parsing or rendering a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Invalid manifest YAML: {0}")]
    Parse(serde_yaml_ng::Error),

    #[error("Manifest top level must be a mapping, found {0}")]
    NotAMapping(&'static str),

    #[error("Failed to render manifest: {0}")]
    Render(serde_yaml_ng::Error),
}

/// A single service definition.
///
/// The definition is kept verbatim so everything the filter does not look at
/// survives re-rendering. Labels are normalized to plain strings: list entries
/// as written, mapping entries as `key=value` (or `key` for a null value).
#[derive(Debug, Clone, PartialEq)]
pub struct Service {
    pub labels: Vec<String>,
    definition: Value,
}

impl Service {
    /// Malformed definitions or labels yield a service without labels, which
    /// no filter retains.
    fn from_value(name: &str, definition: Value) -> Self {
        let labels = match &definition {
            Value::Mapping(fields) => match fields.get("labels") {
                None | Some(Value::Null) => Vec::new(),
                Some(raw) => match serde_yaml_ng::from_value::<RawLabels>(raw.clone()) {
                    Ok(labels) => labels.normalize(),
                    Err(e) => {
                        tracing::warn!(service = name, error = %e, "Unreadable service labels");
                        Vec::new()
                    }
                },
            },
            other => {
                tracing::warn!(
                    service = name,
                    found = kind_of(other),
                    "Service definition is not a mapping"
                );
                Vec::new()
            }
        };

        Self { labels, definition }
    }

    /// The label that satisfies `filter`, if any.
    pub fn matching_label<'a>(&'a self, filter: &LabelFilter) -> Option<&'a str> {
        self.labels
            .iter()
            .map(String::as_str)
            .find(|label| filter.contains(label))
    }
}

/// The two label spellings compose accepts.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawLabels {
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl RawLabels {
    fn normalize(self) -> Vec<String> {
        match self {
            Self::List(items) => items.iter().filter_map(scalar_to_string).collect(),
            Self::Map(entries) => entries
                .into_iter()
                .map(|(key, value)| match scalar_to_string(&value) {
                    Some(value) => format!("{}={}", key, value),
                    None => key,
                })
                .collect(),
        }
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "sequence",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged value",
    }
}

/// A parsed compose document.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    /// Top-level document, including the `services` entry as parsed.
    document: Mapping,
    services: BTreeMap<String, Service>,
}

impl Manifest {
    /// Parse a raw YAML document.
    ///
    /// A document without a usable `services` mapping is accepted with a
    /// warning and treated as having no services.
    pub fn parse(raw: &[u8]) -> Result<Self, ManifestError> {
        let value: Value = serde_yaml_ng::from_slice(raw).map_err(ManifestError::Parse)?;

        let document = match value {
            Value::Mapping(document) => document,
            Value::Null => {
                tracing::warn!("Manifest document is null, treating it as having no services");
                Mapping::new()
            }
            other => return Err(ManifestError::NotAMapping(kind_of(&other))),
        };

        let mut services = BTreeMap::new();
        match document.get(SERVICES_KEY) {
            Some(Value::Mapping(entries)) => {
                for (name, definition) in entries {
                    let Some(name) = scalar_to_string(name) else {
                        tracing::warn!(key = ?name, "Ignoring service with a non-scalar name");
                        continue;
                    };
                    let service = Service::from_value(&name, definition.clone());
                    services.insert(name, service);
                }
            }
            Some(other) => {
                tracing::warn!(
                    found = kind_of(other),
                    "Manifest `services` is not a mapping, treating it as having no services"
                );
            }
            None => {
                tracing::warn!("Manifest has no `services` collection");
            }
        }

        Ok(Self { document, services })
    }

    pub fn services(&self) -> &BTreeMap<String, Service> {
        &self.services
    }

    pub fn service_names(&self) -> Vec<&str> {
        self.services.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Render back to YAML.
    ///
    /// Services are emitted in name order; the other top-level keys keep
    /// their document order.
    pub fn render(&self) -> Result<String, ManifestError> {
        let mut document = self.document.clone();
        let services: Mapping = self
            .services
            .iter()
            .map(|(name, service)| (Value::from(name.as_str()), service.definition.clone()))
            .collect();

        if !services.is_empty() || document.contains_key(SERVICES_KEY) {
            document.insert(Value::from(SERVICES_KEY), Value::Mapping(services));
        }

        serde_yaml_ng::to_string(&document).map_err(ManifestError::Render)
    }
}

/// The set of labels a service must carry at least one of to be kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelFilter {
    labels: BTreeSet<String>,
}

impl LabelFilter {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            labels: labels.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Drop every service that carries none of the retain labels.
    pub fn apply(&self, mut manifest: Manifest) -> FilteredManifest {
        manifest.services.retain(|name, service| match service.matching_label(self) {
            Some(label) => {
                tracing::debug!(service = %name, label, "Keeping service");
                true
            }
            None => {
                tracing::debug!(service = %name, "Ignoring service");
                false
            }
        });
        FilteredManifest { manifest }
    }
}

/// A manifest that only contains services matching a [`LabelFilter`].
#[derive(Debug, Clone, PartialEq)]
pub struct FilteredManifest {
    manifest: Manifest,
}

impl FilteredManifest {
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn service_names(&self) -> Vec<&str> {
        self.manifest.service_names()
    }

    /// An empty result converges the same way as an absent manifest.
    pub fn is_empty(&self) -> bool {
        self.manifest.is_empty()
    }

    pub fn render(&self) -> Result<String, ManifestError> {
        self.manifest.render()
    }
}

/// Parse `raw` and keep only the services matching `filter`.
pub fn filter(raw: &[u8], filter: &LabelFilter) -> Result<FilteredManifest, ManifestError> {
    Manifest::parse(raw).map(|manifest| filter.apply(manifest))
}

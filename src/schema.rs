use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use apache_avro::Schema;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::metrics::{REGISTRY_ERRORS_TOTAL, REGISTRY_REQUESTS_TOTAL, REGISTRY_REQUEST_DURATION};

/// Default Avro definition for the exchange message, registered under the
/// topic's subject when the registry has none.
pub const MESSAGE_SCHEMA: &str = r#"{
    "type": "record",
    "name": "Message",
    "namespace": "dev.canary",
    "fields": [
        {"name": "id", "type": "long"},
        {"name": "timestamp", "type": "long", "logicalType": "timestamp-millis"},
        {"name": "payload", "type": "string"}
    ]
}"#;

const SCHEMA_CONTENT_TYPE: &str = "application/vnd.schemaregistry.v1+json";

/// A schema as the registry reports it.
#[derive(Debug, Clone)]
pub struct RegisteredSchema {
    pub id: u32,
    pub subject: Option<String>,
    pub definition: String,
}

/// Registry operations the resolver consumes. The transport is an external
/// collaborator; tests substitute an in-memory implementation.
#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    /// Latest schema registered under `subject`, or `None` if the subject
    /// is unknown.
    async fn get_latest(&self, subject: &str) -> Result<Option<RegisteredSchema>>;

    /// Register `definition` under `subject` and return the assigned id.
    async fn create(&self, subject: &str, definition: &str) -> Result<RegisteredSchema>;

    /// Forward lookup by id, or `None` if the registry does not know it yet.
    async fn get_by_id(&self, id: u32) -> Result<Option<RegisteredSchema>>;
}

/// A resolved, parsed schema. Read-only after creation and shared across
/// concurrent decode calls behind `Arc`.
#[derive(Debug)]
pub struct SchemaHandle {
    pub id: u32,
    pub subject: Option<String>,
    pub definition: String,
    pub parsed: Schema,
}

impl SchemaHandle {
    fn from_registered(schema: RegisteredSchema) -> Result<Arc<Self>> {
        let parsed = Schema::parse_str(&schema.definition).map_err(|e| {
            AppError::SchemaResolution(format!("registry returned unparseable schema: {e}"))
        })?;
        Ok(Arc::new(Self {
            id: schema.id,
            subject: schema.subject,
            definition: schema.definition,
            parsed,
        }))
    }
}

/// Read-through cache over a [`SchemaRegistry`]. Each id is fetched from the
/// registry at most once per process.
pub struct SchemaResolver<R> {
    registry: R,
    cache: RwLock<HashMap<u32, Arc<SchemaHandle>>>,
}

impl<R: SchemaRegistry> SchemaResolver<R> {
    pub fn new(registry: R) -> Self {
        Self {
            registry,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Look up the latest schema for `subject`, registering the default
    /// message schema when the subject is unknown. Lookup-then-create keeps
    /// registration idempotent across restarts: an existing definition is
    /// never overwritten.
    pub async fn get_or_register(&self, subject: &str) -> Result<Arc<SchemaHandle>> {
        let registered = match self.registry.get_latest(subject).await? {
            Some(schema) => {
                debug!(subject, id = schema.id, "resolved existing schema");
                schema
            }
            None => {
                info!(subject, "subject not found, registering default schema");
                self.registry.create(subject, MESSAGE_SCHEMA).await?
            }
        };
        let handle = SchemaHandle::from_registered(registered)?;
        self.cache
            .write()
            .await
            .insert(handle.id, Arc::clone(&handle));
        Ok(handle)
    }

    /// Resolve the schema a wire envelope points at. `SchemaNotFound` is
    /// transient: registry propagation is eventually consistent.
    pub async fn get_by_id(&self, id: u32) -> Result<Arc<SchemaHandle>> {
        if let Some(handle) = self.cache.read().await.get(&id) {
            return Ok(Arc::clone(handle));
        }
        let registered = self
            .registry
            .get_by_id(id)
            .await?
            .ok_or(AppError::SchemaNotFound(id))?;
        let handle = SchemaHandle::from_registered(registered)?;
        self.cache
            .write()
            .await
            .insert(id, Arc::clone(&handle));
        Ok(handle)
    }
}

/// Confluent-compatible schema registry client over HTTP.
pub struct HttpSchemaRegistry {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSchemaRegistry {
    pub fn new(base_url: &str) -> Result<Self> {
        // The registry can be slow to answer right after a rollout; a short
        // timeout here turns into flaky startup failures.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[derive(Deserialize)]
struct SubjectVersionResponse {
    id: u32,
    subject: Option<String>,
    schema: String,
}

#[derive(Deserialize)]
struct SchemaByIdResponse {
    schema: String,
}

#[derive(Deserialize)]
struct CreateResponse {
    id: u32,
}

#[async_trait]
impl SchemaRegistry for HttpSchemaRegistry {
    async fn get_latest(&self, subject: &str) -> Result<Option<RegisteredSchema>> {
        let url = format!("{}/subjects/{subject}/versions/latest", self.base_url);
        let started = Instant::now();
        let response = self.client.get(&url).send().await;
        REGISTRY_REQUEST_DURATION
            .with_label_values(&["get_latest_schema"])
            .observe(started.elapsed().as_secs_f64());
        REGISTRY_REQUESTS_TOTAL
            .with_label_values(&["get_latest_schema"])
            .inc();

        let response = response?;
        if response.status() == StatusCode::NOT_FOUND {
            REGISTRY_ERRORS_TOTAL
                .with_label_values(&["get_latest_schema", "not_found"])
                .inc();
            return Ok(None);
        }
        let body: SubjectVersionResponse = response.error_for_status()?.json().await?;
        Ok(Some(RegisteredSchema {
            id: body.id,
            subject: body.subject.or_else(|| Some(subject.to_string())),
            definition: body.schema,
        }))
    }

    async fn create(&self, subject: &str, definition: &str) -> Result<RegisteredSchema> {
        let url = format!("{}/subjects/{subject}/versions", self.base_url);
        let started = Instant::now();
        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, SCHEMA_CONTENT_TYPE)
            .json(&json!({ "schema": definition, "schemaType": "AVRO" }))
            .send()
            .await;
        REGISTRY_REQUEST_DURATION
            .with_label_values(&["create_schema"])
            .observe(started.elapsed().as_secs_f64());
        REGISTRY_REQUESTS_TOTAL
            .with_label_values(&["create_schema"])
            .inc();

        let response = response?;
        if !response.status().is_success() {
            REGISTRY_ERRORS_TOTAL
                .with_label_values(&["create_schema", "invalid_schema"])
                .inc();
        }
        let body: CreateResponse = response.error_for_status()?.json().await?;
        Ok(RegisteredSchema {
            id: body.id,
            subject: Some(subject.to_string()),
            definition: definition.to_string(),
        })
    }

    async fn get_by_id(&self, id: u32) -> Result<Option<RegisteredSchema>> {
        let url = format!("{}/schemas/ids/{id}", self.base_url);
        let started = Instant::now();
        let response = self.client.get(&url).send().await;
        REGISTRY_REQUEST_DURATION
            .with_label_values(&["get_schema"])
            .observe(started.elapsed().as_secs_f64());
        REGISTRY_REQUESTS_TOTAL
            .with_label_values(&["get_schema"])
            .inc();

        let response = response?;
        if response.status() == StatusCode::NOT_FOUND {
            REGISTRY_ERRORS_TOTAL
                .with_label_values(&["get_schema", "not_found"])
                .inc();
            return Ok(None);
        }
        let body: SchemaByIdResponse = response.error_for_status()?.json().await?;
        Ok(Some(RegisteredSchema {
            id,
            subject: None,
            definition: body.schema,
        }))
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::sync::Mutex;

    use super::*;

    /// In-memory registry standing in for the HTTP transport in tests.
    #[derive(Default)]
    pub(crate) struct FakeRegistry {
        pub subjects: Mutex<HashMap<String, RegisteredSchema>>,
        pub by_id: Mutex<HashMap<u32, String>>,
        pub next_id: Mutex<u32>,
        pub get_by_id_calls: Mutex<usize>,
        pub create_calls: Mutex<usize>,
    }

    impl FakeRegistry {
        pub fn with_schema(id: u32, definition: &str) -> Self {
            let registry = Self::default();
            registry
                .by_id
                .lock()
                .unwrap()
                .insert(id, definition.to_string());
            registry
        }
    }

    #[async_trait]
    impl SchemaRegistry for FakeRegistry {
        async fn get_latest(&self, subject: &str) -> Result<Option<RegisteredSchema>> {
            Ok(self.subjects.lock().unwrap().get(subject).cloned())
        }

        async fn create(&self, subject: &str, definition: &str) -> Result<RegisteredSchema> {
            *self.create_calls.lock().unwrap() += 1;
            let mut next_id = self.next_id.lock().unwrap();
            *next_id += 1;
            let schema = RegisteredSchema {
                id: *next_id,
                subject: Some(subject.to_string()),
                definition: definition.to_string(),
            };
            self.subjects
                .lock()
                .unwrap()
                .insert(subject.to_string(), schema.clone());
            self.by_id
                .lock()
                .unwrap()
                .insert(schema.id, schema.definition.clone());
            Ok(schema)
        }

        async fn get_by_id(&self, id: u32) -> Result<Option<RegisteredSchema>> {
            *self.get_by_id_calls.lock().unwrap() += 1;
            Ok(self
                .by_id
                .lock()
                .unwrap()
                .get(&id)
                .map(|definition| RegisteredSchema {
                    id,
                    subject: None,
                    definition: definition.clone(),
                }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeRegistry;
    use super::*;

    #[tokio::test]
    async fn get_or_register_creates_missing_subject_once() {
        let resolver = SchemaResolver::new(FakeRegistry::default());

        let handle = resolver.get_or_register("orders-value").await.unwrap();
        assert_eq!(handle.id, 1);
        assert_eq!(handle.definition, MESSAGE_SCHEMA);
        assert_eq!(*resolver.registry.create_calls.lock().unwrap(), 1);

        // Second call hits the existing subject, never re-registers.
        let again = resolver.get_or_register("orders-value").await.unwrap();
        assert_eq!(again.id, 1);
        assert_eq!(*resolver.registry.create_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn get_by_id_consults_registry_once() {
        let resolver = SchemaResolver::new(FakeRegistry::with_schema(7, MESSAGE_SCHEMA));

        let first = resolver.get_by_id(7).await.unwrap();
        let second = resolver.get_by_id(7).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(*resolver.registry.get_by_id_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_id_is_schema_not_found() {
        let resolver = SchemaResolver::new(FakeRegistry::default());
        let err = resolver.get_by_id(42).await.unwrap_err();
        assert!(matches!(err, AppError::SchemaNotFound(42)));
    }

    #[tokio::test]
    async fn unparseable_definition_is_resolution_error() {
        let resolver = SchemaResolver::new(FakeRegistry::with_schema(3, "not avro"));
        let err = resolver.get_by_id(3).await.unwrap_err();
        assert!(matches!(err, AppError::SchemaResolution(_)));
    }
}

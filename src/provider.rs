//! Provider: the resource operations exposed to the plugin host.
//!
//! States cross this boundary as JSON. Each call converts the JSON once into the typed
//! spec of its [`ResourceKind`], validates it, runs the adapter and converts back,
//! adding the computed `id`.

use crate::cache::FsBlobStore;
use crate::config::{Config, Driver, Endpoint};
use crate::credentials::{self, CredentialStore};
use crate::db::pool::ConnectionPool;
use crate::db::retry::RetryPolicy;
use crate::db::{CacheSettings, Connector, SqlxConnector, WsConnector};
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::error::{ProviderError, ProviderResult};
use crate::resources::{
    ConnectionSpec, Resource, ResourceKind, RoleSpec, SchemaSpec, SqlContext, TableSpec,
    UserSpec, ViewSpec,
};
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Expand `$body` once per resource kind with `$ty` bound to that kind's spec type.
macro_rules! with_resource {
    ($kind:expr, $ty:ident => $body:expr) => {
        match $kind {
            ResourceKind::Connection => {
                type $ty = ConnectionSpec;
                $body
            }
            ResourceKind::PhysicalSchema => {
                type $ty = SchemaSpec;
                $body
            }
            ResourceKind::Table => {
                type $ty = TableSpec;
                $body
            }
            ResourceKind::View => {
                type $ty = ViewSpec;
                $body
            }
            ResourceKind::Role => {
                type $ty = RoleSpec;
                $body
            }
            ResourceKind::User => {
                type $ty = UserSpec;
                $body
            }
        }
    };
}

/// Result of one provider operation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Outcome {
    /// New state; `None` after delete or when the object is gone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exists: Option<bool>,
    pub diagnostics: Vec<Diagnostic>,
}

pub struct Provider {
    pool: Arc<ConnectionPool>,
    retry: RetryPolicy,
    cancel: CancellationToken,
    diagnostics: Diagnostics,
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("pool", &self.pool)
            .field("retry", &self.retry)
            .finish()
    }
}

/// Parse a JSON config into a typed spec and validate it.
fn parse_spec<R: Resource>(value: &Value) -> ProviderResult<R> {
    let spec: R = serde_json::from_value(value.clone()).map_err(|e| {
        ProviderError::invalid_argument(format!("Invalid {} config: {}", R::KIND, e))
    })?;
    spec.validate()?;
    Ok(spec)
}

/// Parse a stored state into a typed spec without validating it.
///
/// Imported and refreshed states omit write-only values a config must carry, such as a
/// user's password, so they are not held to config rules.
fn parse_state<R: Resource>(value: &Value) -> ProviderResult<R> {
    serde_json::from_value(value.clone()).map_err(|e| {
        ProviderError::invalid_argument(format!("Invalid {} state: {}", R::KIND, e))
    })
}

/// Serialize a typed spec to state JSON with its `id`.
fn state_value<R: Resource>(spec: &R) -> ProviderResult<Value> {
    let mut value = serde_json::to_value(spec)?;
    if let Value::Object(map) = &mut value {
        map.insert("id".to_string(), Value::String(spec.id()));
    }
    Ok(value)
}

/// Id of a stored state: the `id` attribute, or computed from the attributes.
fn state_id<R: Resource>(state: &Value) -> ProviderResult<String> {
    if let Some(id) = state.get("id").and_then(Value::as_str) {
        return Ok(id.to_string());
    }
    Ok(parse_state::<R>(state)?.id())
}

/// Password for the pool's sessions.
///
/// A configured password wins. Otherwise the credential store is asked when enabled;
/// lookup failures are reported as warnings and an empty password is used.
pub async fn session_password(
    endpoint: &Endpoint,
    store: Option<&dyn CredentialStore>,
    diagnostics: &Diagnostics,
) -> String {
    if let Some(password) = &endpoint.password {
        return password.clone();
    }
    let Some(store) = store else {
        return String::new();
    };

    let connection = endpoint.connection_string();
    match credentials::resolve_password(store, &connection, &endpoint.username).await {
        Ok(Some(password)) => password,
        Ok(None) => {
            diagnostics.warn(
                "No stored password",
                format!(
                    "The credential store has no password for {} at {}",
                    endpoint.username, connection
                ),
            );
            String::new()
        }
        Err(e) => {
            diagnostics.warn("Credential store lookup failed", e.to_string());
            String::new()
        }
    }
}

impl Provider {
    pub fn new(pool: Arc<ConnectionPool>, retry: RetryPolicy, diagnostics: Diagnostics) -> Self {
        Self {
            pool,
            retry,
            cancel: CancellationToken::new(),
            diagnostics,
        }
    }

    /// Build the connector chosen by `config` and open the pool.
    pub async fn connect(config: &Config) -> ProviderResult<Self> {
        config.validate()?;
        let endpoint = config.endpoint()?;
        let diagnostics = Diagnostics::new();

        let store = if config.use_credential_store && endpoint.password.is_none() {
            match credentials::default_store() {
                Ok(store) => Some(store),
                Err(e) => {
                    diagnostics.warn("Credential store unavailable", e.to_string());
                    None
                }
            }
        } else {
            None
        };
        let password = session_password(&endpoint, store.as_deref(), &diagnostics).await;

        let connector: Box<dyn Connector> = match config.driver {
            Driver::Sqlx => Box::new(SqlxConnector::new(
                &endpoint.host,
                endpoint.port,
                &endpoint.username,
                &password,
            )?),
            Driver::Websocket => {
                let mut connector = WsConnector::new(
                    &endpoint.host,
                    endpoint.port,
                    config.tls,
                    endpoint.username.clone(),
                    password,
                )
                .with_compression(config.compression);
                if let (Some(dir), Some(id)) = (&config.cache_dir, &config.cache_id) {
                    info!(dir = %dir.display(), id = %id, "Response cache enabled");
                    connector = connector.with_cache(CacheSettings {
                        store: Arc::new(FsBlobStore::new(dir)),
                        id: id.clone(),
                        diagnostics: diagnostics.clone(),
                    });
                }
                Box::new(connector)
            }
        };

        info!(
            host = %endpoint.host,
            port = endpoint.port,
            driver = %config.driver,
            "Connecting to Exasol"
        );
        let pool =
            ConnectionPool::connect(connector.as_ref(), config.pool_size, config.pool_mode).await?;
        Ok(Self::new(Arc::new(pool), config.retry_policy(), diagnostics))
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Token that aborts pending collision retries when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn context(&self) -> SqlContext<'_> {
        SqlContext::new(&self.pool, &self.retry, &self.cancel)
    }

    /// Run one operation with a diagnostics sink of its own.
    ///
    /// A successful outcome carries the operation's diagnostics plus any recorded on the
    /// provider itself while connecting. On failure the operation's diagnostics are handed
    /// to the enclosing scope, if there is one.
    async fn scoped<F>(&self, operation: F) -> ProviderResult<Outcome>
    where
        F: Future<Output = ProviderResult<(Option<Value>, Option<bool>)>>,
    {
        let sink = Diagnostics::new();
        match sink.scope(operation).await {
            Ok((state, exists)) => {
                let mut diagnostics = self.diagnostics.drain();
                diagnostics.extend(sink.drain());
                Ok(Outcome {
                    state,
                    exists,
                    diagnostics,
                })
            }
            Err(e) => {
                if let Some(outer) = Diagnostics::current() {
                    outer.extend(sink.drain());
                }
                Err(e)
            }
        }
    }

    /// JSON schema of the config of `kind`.
    pub fn schema(kind: ResourceKind) -> ProviderResult<Value> {
        with_resource!(kind, R => Ok(serde_json::to_value(schemars::schema_for!(R))?))
    }

    /// Check a config without touching the database.
    pub fn validate(kind: ResourceKind, config: &Value) -> ProviderResult<()> {
        with_resource!(kind, R => parse_spec::<R>(config).map(|_| ()))
    }

    pub async fn create(&self, kind: ResourceKind, config: &Value) -> ProviderResult<Outcome> {
        self.scoped(async {
            let state = with_resource!(kind, R => self.create_as::<R>(config).await)?;
            ProviderResult::Ok((Some(state), None))
        })
        .await
    }

    /// Refresh a state. A vanished object yields an outcome without state.
    pub async fn read(&self, kind: ResourceKind, state: &Value) -> ProviderResult<Outcome> {
        self.scoped(async {
            let state = with_resource!(kind, R => self.read_as::<R>(state).await)?;
            ProviderResult::Ok((state, None))
        })
        .await
    }

    pub async fn update(
        &self,
        kind: ResourceKind,
        prior: &Value,
        planned: &Value,
    ) -> ProviderResult<Outcome> {
        self.scoped(async {
            let state = with_resource!(kind, R => self.update_as::<R>(prior, planned).await)?;
            ProviderResult::Ok((Some(state), None))
        })
        .await
    }

    pub async fn delete(&self, kind: ResourceKind, state: &Value) -> ProviderResult<Outcome> {
        self.scoped(async {
            with_resource!(kind, R => self.delete_as::<R>(state).await)?;
            ProviderResult::Ok((None, None))
        })
        .await
    }

    pub async fn exists(&self, kind: ResourceKind, id: &str) -> ProviderResult<Outcome> {
        self.scoped(async {
            let ctx = self.context();
            let exists = with_resource!(kind, R => R::exists(id, &ctx).await)?;
            ProviderResult::Ok((None, Some(exists)))
        })
        .await
    }

    pub async fn import(&self, kind: ResourceKind, id: &str) -> ProviderResult<Outcome> {
        info!(resource = %kind, id = %id, "Importing");
        self.scoped(async {
            let ctx = self.context();
            let state = with_resource!(kind, R => state_value(&R::import(id, &ctx).await?))?;
            ProviderResult::Ok((Some(state), None))
        })
        .await
    }

    /// Look up an existing object described by `config`; missing objects are errors.
    pub async fn read_data_source(
        &self,
        kind: ResourceKind,
        config: &Value,
    ) -> ProviderResult<Outcome> {
        self.scoped(async {
            let ctx = self.context();
            let state = with_resource!(kind, R => {
                let id = state_id::<R>(config)?;
                state_value(&R::read(&id, None, &ctx).await?)
            })?;
            ProviderResult::Ok((Some(state), None))
        })
        .await
    }

    async fn create_as<R: Resource>(&self, config: &Value) -> ProviderResult<Value> {
        let spec: R = parse_spec(config)?;
        info!(resource = %R::KIND, id = %spec.id(), "Creating");
        let state = spec.create(&self.context()).await?;
        state_value(&state)
    }

    async fn read_as<R: Resource>(&self, state: &Value) -> ProviderResult<Option<Value>> {
        let id = state_id::<R>(state)?;
        // Prior state only supplies write-only values, so an unparsable one is ignored
        let prior: Option<R> = serde_json::from_value(state.clone()).ok();
        match R::read(&id, prior.as_ref(), &self.context()).await {
            Ok(current) => Ok(Some(state_value(&current)?)),
            Err(e) if e.is_not_found() => {
                debug!(resource = %R::KIND, id = %id, "Object is gone");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn update_as<R: Resource>(&self, prior: &Value, planned: &Value) -> ProviderResult<Value> {
        let prior: R = parse_state(prior)?;
        let planned: R = parse_spec(planned)?;
        info!(resource = %R::KIND, from = %prior.id(), to = %planned.id(), "Updating");
        let state = R::update(&prior, &planned, &self.context()).await?;
        state_value(&state)
    }

    async fn delete_as<R: Resource>(&self, state: &Value) -> ProviderResult<()> {
        let spec: R = parse_state(state)?;
        info!(resource = %R::KIND, id = %spec.id(), "Deleting");
        spec.delete(&self.context()).await
    }

    /// Abort pending retries and close every session.
    pub async fn close(&self) -> ProviderResult<()> {
        self.cancel.cancel();
        self.pool.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryCredentialStore;
    use serde_json::json;

    fn endpoint(password: Option<&str>) -> Endpoint {
        Endpoint {
            host: "db".to_string(),
            port: 8563,
            username: "sys".to_string(),
            password: password.map(str::to_string),
        }
    }

    #[test]
    fn test_schema_for_every_kind() {
        for kind in ResourceKind::ALL {
            let schema = Provider::schema(kind).unwrap();
            assert!(schema.get("properties").is_some(), "{} has no properties", kind);
        }
    }

    #[test]
    fn test_validate_rejects_bad_config() {
        assert!(Provider::validate(ResourceKind::Role, &json!({"name": "r"})).is_ok());
        let err = Provider::validate(ResourceKind::Role, &json!({"comment": "x"})).unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
        let err = Provider::validate(ResourceKind::User, &json!({"name": "u"})).unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
    }

    #[test]
    fn test_parse_state_skips_config_rules() {
        let imported = json!({"name": "ETL", "id": "ETL"});
        assert!(parse_spec::<UserSpec>(&imported).is_err());
        let user: UserSpec = parse_state(&imported).unwrap();
        assert_eq!(user.id(), "ETL");

        let err = parse_state::<UserSpec>(&json!({"id": "ETL"})).unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
    }

    #[test]
    fn test_state_value_adds_id() {
        let spec = SchemaSpec {
            name: "sales".to_string(),
            owner: None,
        };
        assert_eq!(state_value(&spec).unwrap(), json!({"name": "sales", "id": "SALES"}));
        assert_eq!(
            state_id::<TableSpec>(&json!({"id": "S.T"})).unwrap(),
            "S.T"
        );
    }

    #[tokio::test]
    async fn test_session_password_prefers_configured() {
        let diagnostics = Diagnostics::new();
        let memory = MemoryCredentialStore::new();
        memory.set(Some("db:8563"), "sys", "stored").await.unwrap();
        let store: &dyn CredentialStore = &memory;

        let password = session_password(&endpoint(Some("given")), Some(store), &diagnostics).await;
        assert_eq!(password, "given");

        let password = session_password(&endpoint(None), Some(store), &diagnostics).await;
        assert_eq!(password, "stored");
        assert!(diagnostics.is_empty());
    }

    #[tokio::test]
    async fn test_session_password_missing_is_warning() {
        let diagnostics = Diagnostics::new();
        let memory = MemoryCredentialStore::new();
        let store: &dyn CredentialStore = &memory;
        let password = session_password(&endpoint(None), Some(store), &diagnostics).await;
        assert_eq!(password, "");
        assert_eq!(diagnostics.len(), 1);

        let password = session_password(&endpoint(None), None, &diagnostics).await;
        assert_eq!(password, "");
        assert_eq!(diagnostics.len(), 1);
    }
}

//! Operation executor
//!
//! A fixed catalog of one-shot administrative operations. Each entry binds an
//! id to a typed input, a typed output, and a safety class at registration
//! time. Execution order is fixed: decode the input strictly, refuse a
//! dangerous operation that was not confirmed, then dispatch. The first two
//! steps never touch state.

mod config_ops;
mod daemon_ops;
mod inference_ops;
mod mcp_ops;
mod secrets;
mod session_ops;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use opta_connector_lmx::{LmxError, LmxHttpClient};
use opta_protocol::{
    ErrorBody, OperationErrorCode, OperationInfo, OperationRequest, OperationResponse, Safety,
};

use crate::background::Supervisor;
use crate::config::DaemonConfig;
use crate::paths::DataPaths;
use crate::persistence::PersistCommand;
use crate::state::SessionRegistry;
use crate::store::{Store, StoreError};

/// Everything operation handlers may touch.
pub struct OpContext {
    pub store: Arc<Store>,
    pub registry: Arc<SessionRegistry>,
    pub supervisor: Arc<Supervisor>,
    pub paths: DataPaths,
    pub config: DaemonConfig,
    pub lmx: Option<LmxHttpClient>,
    /// Flipped to `true` by `daemon.stop`.
    pub shutdown: watch::Sender<bool>,
    pub persist_tx: mpsc::Sender<PersistCommand>,
    pub started_at: Instant,
}

#[derive(Debug, Error)]
pub enum OperationError {
    #[error("unknown operation `{0}`")]
    Unknown(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("`{0}` is dangerous; resend with confirmDangerous: true")]
    ConfirmationRequired(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("storage is full")]
    StorageFull,
    #[error("{0}")]
    Internal(String),
}

impl OperationError {
    pub fn code(&self) -> OperationErrorCode {
        match self {
            Self::Unknown(_) => OperationErrorCode::UnknownOperation,
            Self::InvalidInput(_) => OperationErrorCode::InvalidInput,
            Self::ConfirmationRequired(_) => OperationErrorCode::ConfirmationRequired,
            Self::NotFound(_) => OperationErrorCode::NotFound,
            Self::Conflict(_) => OperationErrorCode::Conflict,
            Self::Unavailable(_) => OperationErrorCode::Unavailable,
            Self::StorageFull => OperationErrorCode::StorageFull,
            Self::Internal(_) => OperationErrorCode::Internal,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody::new(self.code().as_str(), self.to_string())
    }
}

impl From<StoreError> for OperationError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Full => Self::StorageFull,
            StoreError::NotFound(what) => Self::NotFound(what),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<rusqlite::Error> for OperationError {
    fn from(error: rusqlite::Error) -> Self {
        StoreError::from(error).into()
    }
}

impl From<LmxError> for OperationError {
    fn from(error: LmxError) -> Self {
        if error.is_unreachable() {
            Self::Unavailable(error.to_string())
        } else {
            Self::Internal(error.to_string())
        }
    }
}

/// Input of operations that take none. `{}` and a missing input both decode.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct NoInput {}

type Prepared = BoxFuture<'static, Result<Value, OperationError>>;
type Prepare = Box<dyn Fn(Arc<OpContext>, Value) -> Result<Prepared, OperationError> + Send + Sync>;

pub struct OperationSpec {
    info: OperationInfo,
    /// Decodes the input and returns the not-yet-started handler future.
    prepare: Prepare,
}

/// Register a handler with its input and output types.
pub(crate) fn op<I, O, F, Fut>(
    id: &str,
    title: &str,
    description: &str,
    safety: Safety,
    handler: F,
) -> OperationSpec
where
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
    F: Fn(Arc<OpContext>, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, OperationError>> + Send + 'static,
{
    OperationSpec {
        info: OperationInfo {
            id: id.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            safety,
        },
        prepare: Box::new(move |ctx, raw| {
            let input: I = serde_json::from_value(raw)
                .map_err(|e| OperationError::InvalidInput(e.to_string()))?;
            let pending = handler(ctx, input);
            Ok(Box::pin(async move {
                let output = pending.await?;
                serde_json::to_value(output).map_err(|e| OperationError::Internal(e.to_string()))
            }))
        }),
    }
}

pub struct OperationExecutor {
    ctx: Arc<OpContext>,
    catalog: BTreeMap<String, OperationSpec>,
}

impl OperationExecutor {
    pub fn new(ctx: OpContext) -> Self {
        let mut catalog = BTreeMap::new();
        let specs = config_ops::specs()
            .into_iter()
            .chain(secrets::specs())
            .chain(daemon_ops::specs())
            .chain(session_ops::specs())
            .chain(mcp_ops::specs())
            .chain(inference_ops::specs());
        for spec in specs {
            catalog.insert(spec.info.id.clone(), spec);
        }
        Self {
            ctx: Arc::new(ctx),
            catalog,
        }
    }

    pub fn catalog(&self) -> Vec<OperationInfo> {
        self.catalog.values().map(|s| s.info.clone()).collect()
    }

    pub fn context(&self) -> &Arc<OpContext> {
        &self.ctx
    }

    pub async fn execute(&self, id: &str, request: OperationRequest) -> OperationResponse {
        match self.try_execute(id, request).await {
            Ok(result) => {
                info!(
                    component = "operations",
                    event = "operation.completed",
                    operation = %id,
                );
                OperationResponse::success(result)
            }
            Err(error) => {
                warn!(
                    component = "operations",
                    event = "operation.failed",
                    operation = %id,
                    code = error.code().as_str(),
                    error = %error,
                );
                OperationResponse::failure(error.to_body())
            }
        }
    }

    async fn try_execute(&self, id: &str, request: OperationRequest) -> Result<Value, OperationError> {
        let spec = self
            .catalog
            .get(id)
            .ok_or_else(|| OperationError::Unknown(id.to_string()))?;

        let raw = match request.input {
            None | Some(Value::Null) => Value::Object(Default::default()),
            Some(value) => value,
        };
        let prepared = (spec.prepare)(self.ctx.clone(), raw)?;

        if spec.info.safety == Safety::Dangerous && request.confirm_dangerous != Some(true) {
            return Err(OperationError::ConfirmationRequired(id.to_string()));
        }
        prepared.await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    use crate::background::EventSink;
    use crate::config::BackgroundSettings;
    use crate::state::tests::test_registry;
    use crate::store::tests::test_store;

    pub(crate) struct Harness {
        pub executor: Arc<OperationExecutor>,
        pub shutdown_rx: watch::Receiver<bool>,
        pub persist_rx: mpsc::Receiver<PersistCommand>,
        _archive_rx: mpsc::Receiver<PersistCommand>,
        _dir: tempfile::TempDir,
    }

    pub(crate) fn harness() -> Harness {
        let (dir, store) = test_store();
        let (registry, archive_rx) = test_registry();
        let (persist_tx, persist_rx) = mpsc::channel(256);
        let sink: Arc<dyn EventSink> = registry.clone();
        let supervisor = Supervisor::new(BackgroundSettings::default(), sink, persist_tx.clone());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let ctx = OpContext {
            store,
            registry,
            supervisor,
            paths: DataPaths::new(dir.path()),
            config: DaemonConfig::default(),
            lmx: None,
            shutdown,
            persist_tx,
            started_at: Instant::now(),
        };
        Harness {
            executor: Arc::new(OperationExecutor::new(ctx)),
            shutdown_rx,
            persist_rx,
            _archive_rx: archive_rx,
            _dir: dir,
        }
    }

    impl Harness {
        /// Route-level state sharing this harness's registry and supervisor.
        pub(crate) fn app_state(&self) -> Arc<crate::state::AppState> {
            let ctx = self.executor.context();
            Arc::new(crate::state::AppState {
                registry: ctx.registry.clone(),
                supervisor: ctx.supervisor.clone(),
                operations: self.executor.clone(),
                started_at: Instant::now(),
            })
        }
    }

    pub(crate) async fn call(h: &Harness, id: &str, input: Value) -> OperationResponse {
        h.executor
            .execute(
                id,
                OperationRequest {
                    input: Some(input),
                    confirm_dangerous: None,
                },
            )
            .await
    }

    pub(crate) async fn call_confirmed(h: &Harness, id: &str, input: Value) -> OperationResponse {
        h.executor
            .execute(
                id,
                OperationRequest {
                    input: Some(input),
                    confirm_dangerous: Some(true),
                },
            )
            .await
    }

    #[test]
    fn catalog_is_complete_and_classified() {
        let h = harness();
        let catalog = h.executor.catalog();
        let ids: Vec<&str> = catalog.iter().map(|o| o.id.as_str()).collect();
        for id in [
            "env.profiles.list",
            "env.profiles.save",
            "env.profiles.activate",
            "env.profiles.delete",
            "config.get",
            "config.set",
            "config.list",
            "account.status",
            "account.login",
            "account.logout",
            "apikey.list",
            "apikey.set",
            "apikey.delete",
            "daemon.status",
            "daemon.stop",
            "service.install",
            "service.uninstall",
            "sessions.list",
            "sessions.search",
            "sessions.export",
            "sessions.delete",
            "mcp.list",
            "mcp.add",
            "mcp.remove",
            "embeddings.create",
            "rerank.run",
            "keychain.set",
            "keychain.delete",
        ] {
            assert!(ids.contains(&id), "missing {id}");
        }
        assert_eq!(catalog.len(), 28);

        let safety = |id: &str| catalog.iter().find(|o| o.id == id).unwrap().safety;
        assert_eq!(safety("config.list"), Safety::Read);
        assert_eq!(safety("config.set"), Safety::Write);
        assert_eq!(safety("sessions.delete"), Safety::Dangerous);
        assert_eq!(safety("daemon.stop"), Safety::Dangerous);
    }

    #[tokio::test]
    async fn unknown_operation() {
        let h = harness();
        let response = call(&h, "nope.nothing", json!({})).await;
        assert_eq!(response.error_code(), Some("unknown-operation"));
    }

    #[tokio::test]
    async fn unknown_input_fields_are_rejected() {
        let h = harness();
        let response = call(&h, "config.get", json!({"key": "a", "extra": 1})).await;
        assert_eq!(response.error_code(), Some("invalid-input"));
        let response = call(&h, "config.list", json!({"verbose": true})).await;
        assert_eq!(response.error_code(), Some("invalid-input"));
    }

    #[tokio::test]
    async fn missing_input_decodes_as_empty() {
        let h = harness();
        let response = h
            .executor
            .execute("config.list", OperationRequest::default())
            .await;
        assert!(response.ok, "{:?}", response);
    }

    #[tokio::test]
    async fn invalid_input_wins_over_confirmation() {
        let h = harness();
        let response = call(&h, "apikey.delete", json!({"bogus": true})).await;
        assert_eq!(response.error_code(), Some("invalid-input"));
    }

    #[tokio::test]
    async fn dangerous_without_confirmation_has_no_side_effect() {
        let h = harness();
        assert!(call(&h, "apikey.set", json!({"provider": "openai", "key": "sk-1"})).await.ok);

        let response = call(&h, "apikey.delete", json!({"provider": "openai"})).await;
        assert_eq!(response.error_code(), Some("confirmation-required"));
        let response = h
            .executor
            .execute(
                "apikey.delete",
                OperationRequest {
                    input: Some(json!({"provider": "openai"})),
                    confirm_dangerous: Some(false),
                },
            )
            .await;
        assert_eq!(response.error_code(), Some("confirmation-required"));

        let listed = call(&h, "apikey.list", json!({})).await;
        assert_eq!(listed.result.unwrap().as_array().unwrap().len(), 1);

        let response = call_confirmed(&h, "apikey.delete", json!({"provider": "openai"})).await;
        assert!(response.ok);
        let listed = call(&h, "apikey.list", json!({})).await;
        assert!(listed.result.unwrap().as_array().unwrap().is_empty());
    }
}

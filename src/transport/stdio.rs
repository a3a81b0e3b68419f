//! Stdio host for the provider.
//!
//! Requests arrive as one JSON object per line on stdin and each gets exactly one JSON
//! response line on stdout, echoing the request `id`. Requests run concurrently, so
//! responses may come back out of order. Logs go to stderr.

use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::error::{ProviderError, ProviderResult};
use crate::provider::{Outcome, Provider};
use crate::resources::ResourceKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Schema,
    Validate,
    Create,
    Read,
    Update,
    Delete,
    Exists,
    Import,
    ReadDataSource,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    pub op: Op,
    pub resource_type: String,
    /// Planned attributes for create/update/validate/read_data_source.
    #[serde(default)]
    pub config: Option<Value>,
    /// Prior state for read/update/delete/exists.
    #[serde(default)]
    pub state: Option<Value>,
    #[serde(default)]
    pub import_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl From<&ProviderError> for ErrorBody {
    fn from(err: &ProviderError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            suggestion: err.suggestion().map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub id: Value,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exists: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    pub diagnostics: Vec<Diagnostic>,
}

impl Response {
    fn success(id: Value, outcome: Outcome) -> Self {
        Self {
            id,
            ok: true,
            state: outcome.state,
            exists: outcome.exists,
            schema: None,
            error: None,
            diagnostics: outcome.diagnostics,
        }
    }

    fn failure(id: Value, err: &ProviderError, diagnostics: Vec<Diagnostic>) -> Self {
        Self {
            id,
            ok: false,
            state: None,
            exists: None,
            schema: None,
            error: Some(err.into()),
            diagnostics,
        }
    }
}

fn required<'a>(value: &'a Option<Value>, field: &str) -> ProviderResult<&'a Value> {
    value
        .as_ref()
        .ok_or_else(|| ProviderError::invalid_argument(format!("Request needs '{}'", field)))
}

async fn dispatch(provider: &Provider, request: &Request) -> ProviderResult<Response> {
    let kind: ResourceKind = request.resource_type.parse()?;
    let id = request.id.clone();
    debug!(op = ?request.op, resource = %kind, "Handling request");

    let outcome = match request.op {
        Op::Schema => {
            let mut response = Response::success(id, Outcome::default());
            response.schema = Some(Provider::schema(kind)?);
            return Ok(response);
        }
        Op::Validate => {
            Provider::validate(kind, required(&request.config, "config")?)?;
            Outcome::default()
        }
        Op::Create => provider.create(kind, required(&request.config, "config")?).await?,
        Op::Read => provider.read(kind, required(&request.state, "state")?).await?,
        Op::Update => {
            provider
                .update(
                    kind,
                    required(&request.state, "state")?,
                    required(&request.config, "config")?,
                )
                .await?
        }
        Op::Delete => provider.delete(kind, required(&request.state, "state")?).await?,
        Op::Exists => {
            let from_state = request
                .state
                .as_ref()
                .and_then(|s| s.get("id"))
                .and_then(Value::as_str);
            let object_id = request
                .import_id
                .as_deref()
                .or(from_state)
                .ok_or_else(|| ProviderError::invalid_argument("Request needs 'import_id'"))?;
            provider.exists(kind, object_id).await?
        }
        Op::Import => {
            let object_id = request
                .import_id
                .as_deref()
                .ok_or_else(|| ProviderError::invalid_argument("Request needs 'import_id'"))?;
            provider.import(kind, object_id).await?
        }
        Op::ReadDataSource => {
            provider
                .read_data_source(kind, required(&request.config, "config")?)
                .await?
        }
    };
    Ok(Response::success(id, outcome))
}

/// Answer one request line. Never fails: errors become `ok: false` responses.
pub async fn handle_line(provider: &Provider, line: &str) -> Response {
    let raw: Value = match serde_json::from_str(line) {
        Ok(raw) => raw,
        Err(e) => {
            let err = ProviderError::invalid_argument(format!("Malformed request: {}", e));
            return Response::failure(Value::Null, &err, Vec::new());
        }
    };
    let id = raw.get("id").cloned().unwrap_or(Value::Null);
    let request: Request = match serde_json::from_value(raw) {
        Ok(request) => request,
        Err(e) => {
            let err = ProviderError::invalid_argument(format!("Malformed request: {}", e));
            return Response::failure(id, &err, Vec::new());
        }
    };

    // Warnings of a failed operation land in this request's sink
    let diagnostics = Diagnostics::new();
    match diagnostics.scope(dispatch(provider, &request)).await {
        Ok(response) => response,
        Err(e) => {
            warn!(op = ?request.op, resource = %request.resource_type, error = %e, "Request failed");
            Response::failure(id, &e, diagnostics.drain())
        }
    }
}

async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &Response,
) -> ProviderResult<()> {
    let mut line = serde_json::to_vec(response)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Line-delimited JSON host around a [`Provider`].
pub struct StdioHost {
    provider: Arc<Provider>,
}

impl StdioHost {
    pub fn new(provider: Arc<Provider>) -> Self {
        Self { provider }
    }

    /// Serve stdin until EOF or a shutdown signal, then close the pool.
    pub async fn run(&self) -> ProviderResult<()> {
        info!("Starting provider host on stdio");

        let stdin = BufReader::new(tokio::io::stdin());
        let stdout = tokio::io::stdout();
        let shutdown_requested = self.serve(stdin, stdout, wait_for_signal()).await?;

        if shutdown_requested {
            info!("Shutdown signal received (send again to force exit)");
            tokio::spawn(async {
                wait_for_signal().await;
                warn!("Received second signal, forcing immediate exit");
                std::process::exit(1);
            });
        }

        info!("Closing connection pool");
        if let Err(e) = self.provider.close().await {
            warn!(error = %e, "Failed to close connection pool cleanly");
        }

        if shutdown_requested {
            // A pending stdin read cannot be interrupted
            info!("Exiting process");
            std::process::exit(0);
        }

        info!("Provider host stopped");
        Ok(())
    }

    /// Serve requests from `reader` until EOF or `shutdown` completes.
    ///
    /// Returns `true` when stopped by `shutdown`, in which case in-flight requests are
    /// aborted and pending retries cancelled.
    pub async fn serve<R, W, S>(&self, reader: R, mut writer: W, shutdown: S) -> ProviderResult<bool>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
        S: Future<Output = ()>,
    {
        let mut lines = reader.lines();
        let (tx, mut rx) = mpsc::unbounded_channel::<Response>();
        let mut tasks = JoinSet::new();
        let mut input_open = true;
        tokio::pin!(shutdown);

        loop {
            if !input_open && tasks.is_empty() {
                break;
            }

            tokio::select! {
                _ = &mut shutdown => {
                    self.provider.cancellation_token().cancel();
                    tasks.abort_all();
                    return Ok(true);
                }
                line = lines.next_line(), if input_open => match line? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => {
                        let provider = self.provider.clone();
                        let tx = tx.clone();
                        tasks.spawn(async move {
                            let response = handle_line(&provider, &line).await;
                            let _ = tx.send(response);
                        });
                    }
                    None => {
                        debug!("Input closed");
                        input_open = false;
                    }
                },
                Some(response) = rx.recv() => write_response(&mut writer, &response).await?,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "Request task failed");
                    }
                }
            }
        }

        // Every finished task has already queued its response
        while let Ok(response) = rx.try_recv() {
            write_response(&mut writer, &response).await?;
        }
        Ok(false)
    }
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}

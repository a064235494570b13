//! HTTP dashboard: start/stop trader subprocesses and read recent logs.
//!
//! Every route requires HTTP Basic Auth with the `DASHBOARD_USER` /
//! `DASHBOARD_PASSWORD` credentials.

use std::{
    collections::HashMap,
    env,
    path::PathBuf,
    process::Stdio,
    sync::Arc,
};

use axum::{
    extract::{Path, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    process::{Child, Command},
    sync::Mutex,
};
use tracing::{info, warn};

use crate::{config::WalletConfig, logging};

const DEFAULT_LOG_LINES: usize = 100;
const MAX_LOG_LINES: usize = 2_000;

#[derive(Debug, Error)]
pub enum DashboardError {
    #[error("unknown wallet {0}")]
    UnknownWallet(String),
    #[error("wallet {0} is disabled")]
    DisabledWallet(String),
    #[error("bot for wallet {0} is already running")]
    AlreadyRunning(String),
    #[error("bot for wallet {0} is not running")]
    NotRunning(String),
    #[error("no log file found")]
    NoLogs,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl IntoResponse for DashboardError {
    fn into_response(self) -> Response {
        let status = match &self {
            DashboardError::UnknownWallet(_) | DashboardError::NoLogs => StatusCode::NOT_FOUND,
            DashboardError::DisabledWallet(_) => StatusCode::FORBIDDEN,
            DashboardError::AlreadyRunning(_) | DashboardError::NotRunning(_) => {
                StatusCode::CONFLICT
            }
            DashboardError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({"error": self.to_string()}))).into_response()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    /// Both variables must be set and non-empty.
    pub fn from_env() -> Option<Self> {
        let user = env::var("DASHBOARD_USER").ok().filter(|v| !v.is_empty())?;
        let password = env::var("DASHBOARD_PASSWORD").ok().filter(|v| !v.is_empty())?;
        Some(Self { user, password })
    }

    /// Checks an `Authorization: Basic <base64(user:password)>` header.
    pub fn authorizes(&self, headers: &HeaderMap) -> bool {
        let Some(value) = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
        else {
            return false;
        };
        let Some(encoded) = value.strip_prefix("Basic ") else {
            return false;
        };
        let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return false;
        };
        match decoded.split_once(':') {
            Some((user, password)) => user == self.user && password == self.password,
            None => false,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// How to launch a trader subprocess.
#[derive(Clone, Debug)]
pub struct TraderCommand {
    pub program: PathBuf,
    pub config_path: PathBuf,
    pub markets_path: PathBuf,
}

#[derive(Clone, Debug, Serialize)]
pub struct BotStatus {
    pub wallet: String,
    pub name: String,
    pub enabled: bool,
    pub running: bool,
    pub market: Option<String>,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_exit: Option<String>,
}

struct BotProcess {
    child: Child,
    market: String,
    started_at: DateTime<Utc>,
}

/// Owns the trader subprocesses, one per wallet at most.
pub struct Supervisor {
    command: TraderCommand,
    wallets: Vec<WalletConfig>,
    bots: Mutex<HashMap<String, BotProcess>>,
    exits: Mutex<HashMap<String, String>>,
}

impl Supervisor {
    pub fn new(command: TraderCommand, wallets: Vec<WalletConfig>) -> Self {
        Self {
            command,
            wallets,
            bots: Mutex::new(HashMap::new()),
            exits: Mutex::new(HashMap::new()),
        }
    }

    fn wallet(&self, id: &str) -> Result<&WalletConfig, DashboardError> {
        self.wallets
            .iter()
            .find(|wallet| wallet.id.eq_ignore_ascii_case(id))
            .ok_or_else(|| DashboardError::UnknownWallet(id.to_string()))
    }

    pub async fn start(&self, wallet_id: &str, market: &str) -> Result<BotStatus, DashboardError> {
        let wallet = self.wallet(wallet_id)?;
        if !wallet.enabled {
            return Err(DashboardError::DisabledWallet(wallet.id.clone()));
        }
        self.reap().await;

        let mut bots = self.bots.lock().await;
        if bots.contains_key(&wallet.id) {
            return Err(DashboardError::AlreadyRunning(wallet.id.clone()));
        }

        let child = Command::new(&self.command.program)
            .arg(&wallet.id)
            .arg(market)
            .arg("--config")
            .arg(&self.command.config_path)
            .arg("--markets")
            .arg(&self.command.markets_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        info!(wallet = %wallet.name, pid = ?child.id(), %market, "trader started");

        bots.insert(
            wallet.id.clone(),
            BotProcess {
                child,
                market: market.to_string(),
                started_at: Utc::now(),
            },
        );
        drop(bots);
        self.exits.lock().await.remove(&wallet.id);
        self.status_of(wallet).await
    }

    pub async fn stop(&self, wallet_id: &str) -> Result<BotStatus, DashboardError> {
        let wallet = self.wallet(wallet_id)?;
        let process = self.bots.lock().await.remove(&wallet.id);
        let Some(mut process) = process else {
            return Err(DashboardError::NotRunning(wallet.id.clone()));
        };
        process.child.kill().await?;
        info!(wallet = %wallet.name, "trader stopped");
        self.exits
            .lock()
            .await
            .insert(wallet.id.clone(), "stopped from dashboard".to_string());
        self.status_of(wallet).await
    }

    pub async fn stop_all(&self) {
        let mut bots = self.bots.lock().await;
        for (wallet, mut process) in bots.drain() {
            if let Err(err) = process.child.kill().await {
                warn!(%wallet, "failed to stop trader: {err}");
            }
        }
    }

    /// Drops children that exited on their own, remembering why.
    async fn reap(&self) {
        let mut bots = self.bots.lock().await;
        let mut exited = Vec::new();
        for (wallet, process) in bots.iter_mut() {
            match process.child.try_wait() {
                Ok(Some(status)) => exited.push((wallet.clone(), status.to_string())),
                Ok(None) => {}
                Err(err) => exited.push((wallet.clone(), err.to_string())),
            }
        }
        let mut exits = self.exits.lock().await;
        for (wallet, reason) in exited {
            warn!(%wallet, "trader exited: {reason}");
            bots.remove(&wallet);
            exits.insert(wallet, reason);
        }
    }

    async fn status_of(&self, wallet: &WalletConfig) -> Result<BotStatus, DashboardError> {
        let bots = self.bots.lock().await;
        let exits = self.exits.lock().await;
        let process = bots.get(&wallet.id);
        Ok(BotStatus {
            wallet: wallet.id.clone(),
            name: wallet.name.clone(),
            enabled: wallet.enabled,
            running: process.is_some(),
            market: process.map(|p| p.market.clone()),
            pid: process.and_then(|p| p.child.id()),
            started_at: process.map(|p| p.started_at),
            last_exit: exits.get(&wallet.id).cloned(),
        })
    }

    pub async fn status(&self) -> Vec<BotStatus> {
        self.reap().await;
        let mut statuses = Vec::with_capacity(self.wallets.len());
        for wallet in &self.wallets {
            if let Ok(status) = self.status_of(wallet).await {
                statuses.push(status);
            }
        }
        statuses
    }
}

/// Where the traders write their logs.
#[derive(Clone, Debug)]
pub struct LogSource {
    pub directory: PathBuf,
    pub prefix: String,
}

pub struct DashboardState {
    pub credentials: Credentials,
    pub supervisor: Supervisor,
    pub logs: LogSource,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Default)]
pub struct StartRequest {
    pub market: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub lines: Option<usize>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    started_at: DateTime<Utc>,
    bots: Vec<BotStatus>,
}

#[derive(Debug, Serialize)]
struct LogsResponse {
    file: String,
    lines: Vec<String>,
}

async fn require_auth(
    State(state): State<Arc<DashboardState>>,
    request: Request,
    next: Next,
) -> Response {
    if state.credentials.authorizes(request.headers()) {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"inj-dashboard\"")],
            Json(serde_json::json!({"error": "unauthorized"})),
        )
            .into_response()
    }
}

async fn status_handler(State(state): State<Arc<DashboardState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        started_at: state.started_at,
        bots: state.supervisor.status().await,
    })
}

async fn start_handler(
    State(state): State<Arc<DashboardState>>,
    Path(wallet): Path<String>,
    body: Option<Json<StartRequest>>,
) -> Result<Json<BotStatus>, DashboardError> {
    let market = body
        .and_then(|Json(request)| request.market)
        .unwrap_or_else(|| "all".to_string());
    state.supervisor.start(&wallet, &market).await.map(Json)
}

async fn stop_handler(
    State(state): State<Arc<DashboardState>>,
    Path(wallet): Path<String>,
) -> Result<Json<BotStatus>, DashboardError> {
    state.supervisor.stop(&wallet).await.map(Json)
}

async fn logs_handler(
    State(state): State<Arc<DashboardState>>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogsResponse>, DashboardError> {
    let lines = query.lines.unwrap_or(DEFAULT_LOG_LINES).min(MAX_LOG_LINES);
    let logs = state.logs.clone();
    let (file, lines) = tokio::task::spawn_blocking(move || {
        let file = logging::latest_log_file(&logs.directory, &logs.prefix)?
            .ok_or(DashboardError::NoLogs)?;
        let tail = logging::tail_lines(&file, lines)?;
        Ok::<_, DashboardError>((file, tail))
    })
    .await
    .map_err(|err| DashboardError::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))??;
    Ok(Json(LogsResponse {
        file: file.display().to_string(),
        lines,
    }))
}

pub fn router(state: Arc<DashboardState>) -> Router {
    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/bots/:wallet/start", post(start_handler))
        .route("/api/bots/:wallet/stop", post(stop_handler))
        .route("/api/logs", get(logs_handler))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state)
}

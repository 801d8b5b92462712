//! Run orchestration: fetch the source table, diff it against the store, notify each
//! new record, then persist all of them.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use inwatch_adapters::{AdapterContext, HtmlTableSource, ScrapeError, TableSource, TableTarget};
use inwatch_core::{format_message, new_additions_with, FingerprintScheme, Record};
use inwatch_notify::{MatrixConfig, MatrixNotifier, Notifier, DEFAULT_HOMESERVER, DEFAULT_PASSWORD_ENV};
use inwatch_storage::{DatasetStore, HttpClientConfig, HttpFetcher, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "inwatch-sync";

pub const DEFAULT_SOURCE_URL: &str = "http://www.openinsider.com/screener?s=&o=&pl=50&ph=&ll=&lh=&fd=90&fdr=&td=0&tdr=&fdlyl=&fdlyh=&daysago=&xp=1&vl=100&vh=&ocl=&och=&sic1=-1&sicl=100&sich=9999&isofficer=1&iscob=1&isceo=1&ispres=1&iscoo=1&iscfo=1&isgc=1&isvp=1&grp=0&nfl=&nfh=&nil=&nih=&nol=&noh=&v2l=&v2h=&oc2l=&oc2h=&sortcol=0&cnt=500&page=1";
pub const DEFAULT_TABLE_SELECTOR: &str = "table.tinytable";
pub const DEFAULT_STORE_PATH: &str = "trades.jsonl";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub source_url: String,
    pub table_selector: String,
    pub store_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub fingerprint_scheme: FingerprintScheme,
    pub matrix_homeserver: String,
    pub matrix_user: String,
    pub matrix_room_id: String,
    pub matrix_password_env: String,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup; unset or blank keys fall back to
    /// their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let fingerprint_scheme = match get("INWATCH_FINGERPRINT_SCHEME") {
            Some(raw) => raw
                .parse::<FingerprintScheme>()
                .context("parsing INWATCH_FINGERPRINT_SCHEME")?,
            None => FingerprintScheme::default(),
        };
        let http_timeout_secs = match get("INWATCH_HTTP_TIMEOUT_SECS") {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .with_context(|| format!("parsing INWATCH_HTTP_TIMEOUT_SECS={raw}"))?,
            None => 20,
        };

        Ok(Self {
            source_url: get("INWATCH_SOURCE_URL").unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string()),
            table_selector: get("INWATCH_TABLE_SELECTOR")
                .unwrap_or_else(|| DEFAULT_TABLE_SELECTOR.to_string()),
            store_path: get("INWATCH_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_PATH)),
            user_agent: get("INWATCH_USER_AGENT").unwrap_or_else(|| "inwatch-bot/0.1".to_string()),
            http_timeout_secs,
            fingerprint_scheme,
            matrix_homeserver: get("MATRIX_HOMESERVER")
                .unwrap_or_else(|| DEFAULT_HOMESERVER.to_string()),
            matrix_user: get("MATRIX_USER").unwrap_or_default(),
            matrix_room_id: get("MATRIX_ROOM_ID").unwrap_or_default(),
            matrix_password_env: DEFAULT_PASSWORD_ENV.to_string(),
        })
    }

    pub fn target(&self) -> TableTarget {
        TableTarget {
            url: self.source_url.clone(),
            selector: self.table_selector.clone(),
        }
    }

    pub fn matrix(&self) -> MatrixConfig {
        MatrixConfig {
            homeserver: self.matrix_homeserver.clone(),
            user: self.matrix_user.clone(),
            password_env: self.matrix_password_env.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
        }
    }

    /// Builds the Matrix notifier, failing on missing settings or secret before any
    /// network traffic.
    pub fn build_notifier(&self) -> Result<MatrixNotifier> {
        anyhow::ensure!(!self.matrix_user.is_empty(), "MATRIX_USER is not set");
        anyhow::ensure!(!self.matrix_room_id.is_empty(), "MATRIX_ROOM_ID is not set");
        MatrixNotifier::from_env(self.matrix()).context("building matrix notifier")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Fetching,
    Diffing,
    Notifying,
    Persisting,
    Done,
    Failed,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("scrape failed: {0}")]
    Scrape(#[from] ScrapeError),
    #[error("reading dataset store failed: {0}")]
    StoreRead(#[source] StoreError),
    #[error("persisting new records failed: {0}")]
    Persist(#[source] StoreError),
}

impl RunError {
    /// State the run was in when it failed.
    pub fn failed_in(&self) -> RunState {
        match self {
            Self::Scrape(_) => RunState::Fetching,
            Self::StoreRead(_) => RunState::Diffing,
            Self::Persist(_) => RunState::Persisting,
        }
    }
}

/// A new record that was persisted but not delivered.
#[derive(Debug, Clone, Serialize)]
pub struct RecordIssue {
    pub index: usize,
    pub fingerprint: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub final_state: RunState,
    pub scraped: usize,
    pub new_records: usize,
    pub notified: usize,
    pub persisted: usize,
    pub unformattable: Vec<RecordIssue>,
    pub send_failures: Vec<RecordIssue>,
}

impl RunReport {
    pub fn all_delivered(&self) -> bool {
        self.unformattable.is_empty() && self.send_failures.is_empty()
    }
}

pub struct RunOrchestrator {
    target: TableTarget,
    destination: String,
    scheme: FingerprintScheme,
    store: DatasetStore,
    source: Box<dyn TableSource>,
    notifier: Box<dyn Notifier>,
}

impl RunOrchestrator {
    pub fn new(
        target: TableTarget,
        destination: impl Into<String>,
        store: DatasetStore,
        source: Box<dyn TableSource>,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        Self {
            target,
            destination: destination.into(),
            scheme: FingerprintScheme::default(),
            store,
            source,
            notifier,
        }
    }

    pub fn with_fingerprint_scheme(mut self, scheme: FingerprintScheme) -> Self {
        self.scheme = scheme;
        self
    }

    /// Wires the live HTML source, the Matrix notifier and the on-disk store.
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let notifier = config.build_notifier()?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        Ok(Self::new(
            config.target(),
            config.matrix_room_id.clone(),
            DatasetStore::new(config.store_path.clone()),
            Box::new(HtmlTableSource::new(http)),
            Box::new(notifier),
        )
        .with_fingerprint_scheme(config.fingerprint_scheme))
    }

    /// Executes one `Fetching → Diffing → Notifying → Persisting → Done` pass.
    ///
    /// Scrape and store-read failures end the run before anything is sent or written.
    /// Records that cannot be formatted or sent are still persisted and reported.
    pub async fn run_once(&self) -> Result<RunReport, RunError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("run", %run_id);

        let result = self.execute(run_id, started_at).instrument(span.clone()).await;
        if let Err(err) = &result {
            span.in_scope(|| {
                error!(state = ?err.failed_in(), error = %err, "run failed");
            });
        }
        result
    }

    async fn execute(&self, run_id: Uuid, started_at: DateTime<Utc>) -> Result<RunReport, RunError> {
        info!(state = ?RunState::Fetching, url = %self.target.url, "starting scrape and compare");
        let ctx = AdapterContext { run_id };
        let table = self.source.fetch_table(&ctx, &self.target).await?;
        if table.is_empty() {
            return Err(ScrapeError::Empty {
                url: self.target.url.clone(),
            }
            .into());
        }
        let scraped = table.into_dataset();

        info!(state = ?RunState::Diffing, scraped = scraped.len());
        let stored = self.store.read_all().await.map_err(RunError::StoreRead)?;
        if stored.is_empty() {
            info!("no existing data; treating all scraped records as new");
        }
        let fresh = new_additions_with(self.scheme, &scraped, &stored);

        let mut report = RunReport {
            run_id,
            started_at,
            finished_at: started_at,
            final_state: RunState::Done,
            scraped: scraped.len(),
            new_records: fresh.len(),
            notified: 0,
            persisted: 0,
            unformattable: Vec::new(),
            send_failures: Vec::new(),
        };

        if fresh.is_empty() {
            info!(state = ?RunState::Done, "no new additions found");
            report.finished_at = Utc::now();
            return Ok(report);
        }

        info!(state = ?RunState::Notifying, new_records = fresh.len(), "found new additions");
        self.notify_all(&fresh, &mut report).await;

        info!(state = ?RunState::Persisting, records = fresh.len());
        self.store.append(&fresh).await.map_err(RunError::Persist)?;
        report.persisted = fresh.len();

        report.finished_at = Utc::now();
        info!(
            state = ?RunState::Done,
            notified = report.notified,
            persisted = report.persisted,
            undelivered = report.unformattable.len() + report.send_failures.len(),
            "run complete"
        );
        Ok(report)
    }

    async fn notify_all(&self, fresh: &[Record], report: &mut RunReport) {
        for (index, record) in fresh.iter().enumerate() {
            let fingerprint = self.scheme.fingerprint(record).to_hex();
            let message = match format_message(record) {
                Ok(message) => message,
                Err(err) => {
                    warn!(index, %fingerprint, error = %err, "skipping notification for unformattable record");
                    report.unformattable.push(RecordIssue {
                        index,
                        fingerprint,
                        error: err.to_string(),
                    });
                    continue;
                }
            };

            info!(index, "MSG: {message}");
            match self.notifier.send(&self.destination, &message).await {
                Ok(()) => report.notified += 1,
                Err(err) => {
                    warn!(index, %fingerprint, error = %err, "notification failed");
                    report.send_failures.push(RecordIssue {
                        index,
                        fingerprint,
                        error: err.to_string(),
                    });
                }
            }
        }
        self.notifier.close().await;
    }
}

pub async fn run_once_from_env() -> Result<RunReport> {
    let config = SyncConfig::from_env()?;
    let orchestrator = RunOrchestrator::from_config(&config)?;
    Ok(orchestrator.run_once().await?)
}

/// Sends a single message to the configured room; used to check credentials.
pub async fn send_test_message_from_env(message: &str) -> Result<()> {
    let config = SyncConfig::from_env()?;
    let notifier = config.build_notifier()?;
    let result = notifier.send(&config.matrix_room_id, message).await;
    notifier.close().await;
    result.context("sending test message")
}

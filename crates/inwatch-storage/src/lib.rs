//! Append-only dataset storage + HTTP fetch utilities for Insider Watch.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use inwatch_core::{Dataset, Record};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "inwatch-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("corrupt record on line {line} of {}: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        line: usize,
        source: serde_json::Error,
    },
    #[error("{action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("encoding record for storage: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }
}

/// JSON-lines log of every record seen so far. One record per line, oldest first.
#[derive(Debug, Clone)]
pub struct DatasetStore {
    path: PathBuf,
}

impl DatasetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the whole log in file order. A missing file is an empty dataset.
    ///
    /// Every line must be a flat JSON object of strings; only the empty remainder after
    /// the final newline is skipped.
    pub async fn read_all(&self) -> Result<Dataset, StoreError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(path = %self.path.display(), "dataset store not found; starting empty");
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(StoreError::Io {
                    action: "reading",
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let body = bytes.strip_suffix(b"\n").unwrap_or(&bytes[..]);
        let mut records = Vec::new();
        if !body.is_empty() {
            for (idx, line) in body.split(|b| *b == b'\n').enumerate() {
                let record: Record =
                    serde_json::from_slice(line).map_err(|source| StoreError::Corrupt {
                        path: self.path.clone(),
                        line: idx + 1,
                        source,
                    })?;
                records.push(record);
            }
        }
        debug!(path = %self.path.display(), records = records.len(), "read dataset store");
        Ok(records)
    }

    /// Appends `records` in order by rewriting the log through a temp file and
    /// renaming it into place, so readers see either the old or the new contents.
    ///
    /// An empty slice does nothing, not even create the file.
    pub async fn append(&self, records: &[Record]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut contents = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => Vec::new(),
            Err(source) => return Err(self.io_error("reading", source)),
        };
        // A torn final line must not swallow the first appended record.
        if contents.last().is_some_and(|b| *b != b'\n') {
            contents.push(b'\n');
        }
        for record in records {
            serde_json::to_writer(&mut contents, record)?;
            contents.push(b'\n');
        }

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| self.io_error("creating directory for", source))?;

        let temp_path = dir.join(format!(".{}.{}.tmp", Uuid::new_v4(), contents.len()));
        if let Err(err) = self.write_and_replace(&temp_path, &contents).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }

        info!(path = %self.path.display(), appended = records.len(), "appended records to dataset store");
        Ok(())
    }

    async fn write_and_replace(&self, temp_path: &Path, contents: &[u8]) -> Result<(), StoreError> {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(temp_path)
            .await
            .map_err(|source| self.io_error("creating temp file for", source))?;
        file.write_all(contents)
            .await
            .map_err(|source| self.io_error("writing temp file for", source))?;
        file.flush()
            .await
            .map_err(|source| self.io_error("flushing temp file for", source))?;
        file.sync_all()
            .await
            .map_err(|source| self.io_error("syncing temp file for", source))?;
        drop(file);

        fs::rename(temp_path, &self.path)
            .await
            .map_err(|source| self.io_error("replacing", source))?;
        debug!(temp = %temp_path.display(), path = %self.path.display(), "replaced dataset store");
        Ok(())
    }

    fn io_error(&self, action: &'static str, source: std::io::Error) -> StoreError {
        StoreError::Io {
            action,
            path: self.path.clone(),
            source,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Single-shot HTTP GET client. Failures are returned as-is; retrying is left to
/// whatever schedules the next run.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "fetched");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn trade(ticker: &str, price: &str) -> Record {
        Record::from_pairs([("Ticker", ticker), ("Price", price)])
    }

    #[tokio::test]
    async fn missing_store_reads_as_empty() {
        let dir = tempdir().expect("tempdir");
        let store = DatasetStore::new(dir.path().join("trades.jsonl"));
        assert!(store.read_all().await.expect("read").is_empty());
    }

    #[tokio::test]
    async fn append_adds_after_existing_lines() {
        let dir = tempdir().expect("tempdir");
        let store = DatasetStore::new(dir.path().join("trades.jsonl"));

        store.append(&[trade("A", "$1")]).await.expect("first append");
        store
            .append(&[trade("B", "$2"), trade("C", "$3")])
            .await
            .expect("second append");

        let all = store.read_all().await.expect("read");
        assert_eq!(all, vec![trade("A", "$1"), trade("B", "$2"), trade("C", "$3")]);

        let text = std::fs::read_to_string(store.path()).expect("raw");
        assert_eq!(
            text.lines().next(),
            Some(r#"{"Ticker":"A","Price":"$1"}"#)
        );
    }

    #[tokio::test]
    async fn empty_append_does_not_create_the_file() {
        let dir = tempdir().expect("tempdir");
        let store = DatasetStore::new(dir.path().join("nested").join("trades.jsonl"));
        store.append(&[]).await.expect("noop append");
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn append_creates_missing_parent_directories() {
        let dir = tempdir().expect("tempdir");
        let store = DatasetStore::new(dir.path().join("nested").join("trades.jsonl"));
        store.append(&[trade("A", "$1")]).await.expect("append");
        assert_eq!(store.read_all().await.expect("read").len(), 1);
    }

    #[tokio::test]
    async fn unparsable_line_is_reported_with_its_number() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("trades.jsonl");
        std::fs::write(
            &path,
            "{\"Ticker\":\"A\"}\nnot json at all\n{\"Ticker\":\"B\"}\n",
        )
        .expect("seed");

        let err = DatasetStore::new(&path).read_all().await.unwrap_err();
        assert!(err.is_corrupt());
        match err {
            StoreError::Corrupt { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn non_string_values_are_corrupt() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("trades.jsonl");
        std::fs::write(&path, "{\"Ticker\":\"A\",\"Qty\":100}\n").expect("seed");

        let err = DatasetStore::new(&path).read_all().await.unwrap_err();
        assert!(err.is_corrupt());
    }

    #[tokio::test]
    async fn interior_blank_lines_are_corrupt() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("trades.jsonl");
        std::fs::write(&path, "{\"Ticker\":\"A\"}\n\n{\"Ticker\":\"B\"}\n").expect("seed");
        let err = DatasetStore::new(&path).read_all().await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { line: 2, .. }));

        std::fs::write(&path, "{\"Ticker\":\"A\"}\n   \n").expect("seed");
        let err = DatasetStore::new(&path).read_all().await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { line: 2, .. }));
    }

    #[tokio::test]
    async fn final_newline_is_optional() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("trades.jsonl");
        let store = DatasetStore::new(&path);

        std::fs::write(&path, "{\"Ticker\":\"A\"}\n{\"Ticker\":\"B\"}").expect("seed");
        assert_eq!(store.read_all().await.expect("read").len(), 2);

        std::fs::write(&path, "").expect("seed");
        assert!(store.read_all().await.expect("read").is_empty());
    }

    #[tokio::test]
    async fn invalid_utf8_line_is_corrupt() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("trades.jsonl");
        std::fs::write(&path, b"{\"Ticker\":\"A\"}\n\xff\xfe garbage\n").expect("seed");

        let err = DatasetStore::new(&path).read_all().await.unwrap_err();
        assert!(err.is_corrupt());
        assert!(matches!(err, StoreError::Corrupt { line: 2, .. }));

        std::fs::write(&path, b"{\"Ticker\":\"\xff\"}\n").expect("seed");
        let err = DatasetStore::new(&path).read_all().await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { line: 1, .. }));
    }

    #[tokio::test]
    async fn append_replaces_the_file_instead_of_writing_in_place() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("trades.jsonl");
        let store = DatasetStore::new(&path);
        store.append(&[trade("A", "$1")]).await.expect("first append");
        let before = std::fs::read(&path).expect("raw");

        // The link keeps the old file alive; an in-place write would show through it.
        let snapshot = dir.path().join("snapshot.jsonl");
        std::fs::hard_link(&path, &snapshot).expect("link");
        store.append(&[trade("B", "$2")]).await.expect("second append");

        assert_eq!(std::fs::read(&snapshot).expect("snapshot"), before);
        assert_eq!(store.read_all().await.expect("read").len(), 2);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .expect("list")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn failed_append_leaves_store_untouched() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("trades.jsonl");
        std::fs::write(&path, "{\"Ticker\":\"A\"}\n").expect("seed");
        let before = std::fs::read(&path).expect("raw");

        // The store file sits where the nested store expects a directory.
        let blocked = DatasetStore::new(path.join("trades.jsonl"));
        assert!(blocked.append(&[trade("B", "$2")]).await.is_err());

        assert_eq!(std::fs::read(&path).expect("raw"), before);
    }

    #[tokio::test]
    async fn torn_last_line_is_not_merged_with_new_records() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("trades.jsonl");
        std::fs::write(&path, "{\"Ticker\":\"A\"}\n{\"Tick").expect("seed");

        let store = DatasetStore::new(&path);
        store.append(&[trade("B", "$2")]).await.expect("append");

        let text = std::fs::read_to_string(&path).expect("raw");
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "{\"Tick");
        assert_eq!(lines[2], r#"{"Ticker":"B","Price":"$2"}"#);
    }

    #[test]
    fn fetcher_builds_with_user_agent() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: Some("inwatch-test/0.1".to_string()),
        });
        assert!(fetcher.is_ok());
    }
}

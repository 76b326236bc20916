//! Day-rotated SQLite event store.
//!
//! One database file per UTC calendar day (`events-YYYY-MM-DD.db`),
//! created lazily on first write. A dedicated worker thread owns every
//! connection; the async side talks to it over a channel, which
//! serializes transactions without locking the connection. Events are
//! buffered and flushed in batches, and each buffered event is routed
//! to the file matching its own timestamp's day, so a flush that
//! straddles midnight lands rows in both files.
//!
//! The special path `:memory:` keeps a single in-memory database and
//! bypasses rotation, retention and backup.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Datelike, Local, NaiveDate, TimeZone, Utc};
use rusqlite::Connection;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::MonitoringConfig;
use crate::core::control::ControlValue;
use crate::core::error::{QsysError, Result};
use crate::core::events::{ChangeEvent, ChangeGroupSignal, EventSource, SignalReceiver};
use crate::monitor::backup::{
    backup_database, check_integrity, db_err, export_events, io_err, parse_import,
    restore_database,
};
use crate::monitor::query::EventQuery;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    change_group_id TEXT NOT NULL,
    control_path TEXT NOT NULL,
    component_name TEXT NOT NULL,
    control_name TEXT NOT NULL,
    value REAL,
    string_value TEXT,
    source TEXT NOT NULL,
    created_at INTEGER DEFAULT (unixepoch()*1000)
);
CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events (timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_events_group_time ON events (change_group_id, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_events_path_time ON events (control_path, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_events_component_time ON events (component_name, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_events_component_time_asc ON events (component_name, timestamp);
CREATE INDEX IF NOT EXISTS idx_events_group_time_asc ON events (change_group_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_events_created ON events (created_at);
";

/// Store statistics, computed after a flush.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStatistics {
    /// Rows across every day file.
    pub total_events: u64,
    /// Distinct control paths.
    pub unique_controls: u64,
    /// Distinct change groups.
    pub unique_change_groups: u64,
    /// Oldest event timestamp.
    pub oldest_event: Option<i64>,
    /// Newest event timestamp.
    pub newest_event: Option<i64>,
    /// Average ingest rate over the recorded span.
    pub events_per_second: Option<f64>,
    /// Total bytes on disk.
    pub database_size: u64,
    /// Events still buffered (0 right after the implicit flush).
    pub buffer_size: usize,
}

enum StoreCommand {
    Insert {
        events: Vec<ChangeEvent>,
        or_ignore: bool,
        reply: oneshot::Sender<Result<usize>>,
    },
    Query {
        query: EventQuery,
        reply: oneshot::Sender<Result<Vec<ChangeEvent>>>,
    },
    Statistics {
        reply: oneshot::Sender<Result<StoreStatistics>>,
    },
    Backup {
        compress: bool,
        reply: oneshot::Sender<Result<PathBuf>>,
    },
    Restore {
        path: PathBuf,
        reply: oneshot::Sender<Result<()>>,
    },
    Export {
        query: EventQuery,
        reply: oneshot::Sender<Result<(PathBuf, serde_json::Value)>>,
    },
    Sweep {
        reply: oneshot::Sender<Result<usize>>,
    },
    Shutdown,
}

/// Handle to the event store.
pub struct EventStore {
    config: MonitoringConfig,
    buffer: Mutex<Vec<(ChangeEvent, bool)>>,
    tx: std::sync::mpsc::Sender<StoreCommand>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
    dropped_events: AtomicU64,
    cancel: CancellationToken,
}

impl EventStore {
    /// Open the store and spawn its worker thread plus the periodic
    /// flush, retention and auto-backup tasks.
    pub fn open(config: MonitoringConfig) -> Result<Arc<Self>> {
        let (tx, rx) = std::sync::mpsc::channel();
        let worker_config = config.clone();
        let worker = std::thread::Builder::new()
            .name("qgw-event-store".into())
            .spawn(move || DbWorker::new(worker_config).run(rx))
            .map_err(|e| QsysError::internal(format!("spawn store worker: {e}")))?;

        let store = Arc::new(Self {
            config,
            buffer: Mutex::new(Vec::new()),
            tx,
            worker: Mutex::new(Some(worker)),
            dropped_events: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        });

        store.spawn_flusher();
        if !store.is_memory() {
            store.spawn_retention_sweeper();
            store.spawn_auto_backup();
        }
        Ok(store)
    }

    fn is_memory(&self) -> bool {
        self.config.db_path == Path::new(":memory:")
    }

    /// Spawn a consumer task feeding the store from the signal bus.
    pub fn attach(self: &Arc<Self>, mut signals: SignalReceiver) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match signals.recv().await {
                    Ok(ChangeGroupSignal::Changes { changes, .. }) => {
                        store.ingest_batch(changes).await;
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        store.dropped_events.fetch_add(missed, Ordering::Relaxed);
                        tracing::warn!(missed, "Event store lagged behind the signal bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }

    /// Buffer one event.
    pub async fn ingest(&self, event: ChangeEvent) {
        self.ingest_batch(vec![event]).await;
    }

    /// Buffer a batch; flushes early when the buffer fills.
    pub async fn ingest_batch(&self, events: Vec<ChangeEvent>) {
        let should_flush = {
            let mut buffer = self.buffer.lock().expect("buffer lock");
            buffer.extend(events.into_iter().map(|e| (e, false)));
            buffer.len() >= self.config.buffer_size
        };
        if should_flush {
            self.flush().await;
        }
    }

    /// Flush the buffer inside one transaction per day file.
    ///
    /// On failure the batch is re-queued once; events failing a second
    /// time are dropped and counted.
    pub async fn flush(&self) {
        let batch: Vec<(ChangeEvent, bool)> = {
            let mut buffer = self.buffer.lock().expect("buffer lock");
            std::mem::take(&mut *buffer)
        };
        if batch.is_empty() {
            return;
        }

        let events: Vec<ChangeEvent> = batch.iter().map(|(e, _)| e.clone()).collect();
        let (reply, rx) = oneshot::channel();
        let sent = self
            .tx
            .send(StoreCommand::Insert {
                events,
                or_ignore: false,
                reply,
            })
            .is_ok();

        let outcome = if sent {
            rx.await.unwrap_or_else(|_| Err(QsysError::internal("store worker gone")))
        } else {
            Err(QsysError::internal("store worker gone"))
        };

        if let Err(e) = outcome {
            tracing::warn!(error = %e, count = batch.len(), "Event flush failed");
            let mut requeue = Vec::new();
            let mut dropped = 0u64;
            for (event, retried) in batch {
                if retried {
                    dropped += 1;
                } else {
                    requeue.push((event, true));
                }
            }
            if dropped > 0 {
                self.dropped_events.fetch_add(dropped, Ordering::Relaxed);
                tracing::error!(dropped, "Dropped events after repeated flush failures");
            }
            if !requeue.is_empty() {
                let mut buffer = self.buffer.lock().expect("buffer lock");
                requeue.extend(std::mem::take(&mut *buffer));
                *buffer = requeue;
            }
        }
    }

    /// Query recorded events (flushes first).
    pub async fn query(&self, query: EventQuery) -> Result<Vec<ChangeEvent>> {
        self.flush().await;
        self.request(|reply| StoreCommand::Query { query, reply }).await
    }

    /// Store statistics (flushes first).
    pub async fn statistics(&self) -> Result<StoreStatistics> {
        self.flush().await;
        let mut stats = self
            .request(|reply| StoreCommand::Statistics { reply })
            .await?;
        stats.buffer_size = self.buffer.lock().expect("buffer lock").len();
        Ok(stats)
    }

    /// Back up the current day's database.
    pub async fn backup(&self, compress: bool) -> Result<PathBuf> {
        self.flush().await;
        self.request(|reply| StoreCommand::Backup { compress, reply })
            .await
    }

    /// Restore a backup over the current day's database.
    pub async fn restore(&self, path: PathBuf) -> Result<()> {
        self.request(|reply| StoreCommand::Restore { path, reply })
            .await
    }

    /// Export a range query to a JSON document on disk.
    pub async fn export(&self, query: EventQuery) -> Result<(PathBuf, serde_json::Value)> {
        self.flush().await;
        self.request(|reply| StoreCommand::Export { query, reply })
            .await
    }

    /// Import an export document. Returns the number of rows written.
    pub async fn import(&self, document: serde_json::Value) -> Result<usize> {
        let events = parse_import(&document)?;
        self.request(|reply| StoreCommand::Insert {
            events,
            or_ignore: true,
            reply,
        })
        .await
    }

    /// Run the retention sweep immediately.
    pub async fn sweep_now(&self) -> Result<usize> {
        self.request(|reply| StoreCommand::Sweep { reply }).await
    }

    /// Events dropped after repeated flush failures or bus lag.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Flush, stop background tasks and join the worker thread.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.flush().await;
        let _ = self.tx.send(StoreCommand::Shutdown);
        let handle = self.worker.lock().expect("worker lock").take();
        if let Some(handle) = handle {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
    }

    async fn request<T, F>(&self, make: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<Result<T>>) -> StoreCommand,
    {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| QsysError::internal("store worker gone"))?;
        rx.await
            .unwrap_or_else(|_| Err(QsysError::internal("store worker gone")))
    }

    fn spawn_flusher(self: &Arc<Self>) {
        let store = Arc::clone(self);
        let interval = std::time::Duration::from_millis(self.config.flush_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = store.cancel.cancelled() => return,
                    _ = ticker.tick() => store.flush().await,
                }
            }
        });
    }

    /// Daily at local 03:00: delete day files past retention, VACUUM
    /// the current one. Failures are logged, never propagated.
    fn spawn_retention_sweeper(self: &Arc<Self>) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let wait = duration_until_local_3am();
                tokio::select! {
                    _ = store.cancel.cancelled() => return,
                    _ = tokio::time::sleep(wait) => {
                        match store.sweep_now().await {
                            Ok(removed) => {
                                tracing::info!(removed, "Retention sweep complete");
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "Retention sweep failed");
                            }
                        }
                    }
                }
            }
        });
    }

    fn spawn_auto_backup(self: &Arc<Self>) {
        if self.config.backup_interval_ms == 0 {
            return;
        }
        let store = Arc::clone(self);
        let interval = std::time::Duration::from_millis(self.config.backup_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = store.cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = store.backup(true).await {
                            tracing::warn!(error = %e, "Scheduled backup failed");
                        }
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore")
            .field("db_path", &self.config.db_path)
            .field("buffered", &self.buffer.lock().expect("buffer lock").len())
            .finish()
    }
}

fn duration_until_local_3am() -> std::time::Duration {
    let now = Local::now();
    let today_3am = now
        .date_naive()
        .and_hms_opt(3, 0, 0)
        .and_then(|naive| Local.from_local_datetime(&naive).single());
    let next = match today_3am {
        Some(t) if t > now => t,
        _ => {
            let tomorrow = now.date_naive() + chrono::Days::new(1);
            tomorrow
                .and_hms_opt(3, 0, 0)
                .and_then(|naive| Local.from_local_datetime(&naive).single())
                .unwrap_or(now + chrono::Duration::hours(24))
        }
    };
    (next - now).to_std().unwrap_or(std::time::Duration::from_secs(3600))
}

// === Worker thread ===

struct DbWorker {
    config: MonitoringConfig,
    in_memory: bool,
    memory_conn: Option<Connection>,
    day_conns: HashMap<String, Connection>,
}

impl DbWorker {
    fn new(config: MonitoringConfig) -> Self {
        let in_memory = config.db_path == Path::new(":memory:");
        Self {
            config,
            in_memory,
            memory_conn: None,
            day_conns: HashMap::new(),
        }
    }

    fn run(mut self, rx: std::sync::mpsc::Receiver<StoreCommand>) {
        while let Ok(command) = rx.recv() {
            match command {
                StoreCommand::Insert {
                    events,
                    or_ignore,
                    reply,
                } => {
                    let _ = reply.send(self.insert(events, or_ignore));
                }
                StoreCommand::Query { query, reply } => {
                    let _ = reply.send(self.query(&query));
                }
                StoreCommand::Statistics { reply } => {
                    let _ = reply.send(self.statistics());
                }
                StoreCommand::Backup { compress, reply } => {
                    let _ = reply.send(self.backup(compress));
                }
                StoreCommand::Restore { path, reply } => {
                    let _ = reply.send(self.restore(&path));
                }
                StoreCommand::Export { query, reply } => {
                    let _ = reply.send(self.export(&query));
                }
                StoreCommand::Sweep { reply } => {
                    let _ = reply.send(self.sweep());
                }
                StoreCommand::Shutdown => break,
            }
        }
    }

    /// The connection for one UTC day key, opened lazily.
    fn conn_for_day(&mut self, day: &str) -> Result<&Connection> {
        if self.in_memory {
            if self.memory_conn.is_none() {
                let conn =
                    Connection::open_in_memory().map_err(|e| db_err("open :memory:", e))?;
                init_schema(&conn)?;
                self.memory_conn = Some(conn);
            }
            return Ok(self.memory_conn.as_ref().expect("just initialized"));
        }

        if !self.day_conns.contains_key(day) {
            std::fs::create_dir_all(&self.config.db_path)
                .map_err(|e| io_err("create db dir", e))?;
            let path = self.day_file(day);
            let conn = Connection::open(&path).map_err(|e| db_err("open day db", e))?;
            init_schema(&conn)?;
            tracing::debug!(path = %path.display(), "Opened day database");
            self.day_conns.insert(day.to_string(), conn);
        }
        Ok(self.day_conns.get(day).expect("just inserted"))
    }

    fn day_file(&self, day: &str) -> PathBuf {
        self.config.db_path.join(format!("events-{day}.db"))
    }

    /// Insert a batch, one transaction per day file.
    fn insert(&mut self, events: Vec<ChangeEvent>, or_ignore: bool) -> Result<usize> {
        let mut by_day: HashMap<String, Vec<ChangeEvent>> = HashMap::new();
        for event in events {
            by_day.entry(day_key(event.timestamp_ms)).or_default().push(event);
        }

        let sql = if or_ignore {
            "INSERT OR IGNORE INTO events
             (timestamp, change_group_id, control_path, component_name, control_name, value, string_value, source)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
        } else {
            "INSERT INTO events
             (timestamp, change_group_id, control_path, component_name, control_name, value, string_value, source)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
        };

        let mut written = 0;
        for (day, batch) in by_day {
            // Borrow dance: the transaction needs a unique connection.
            self.conn_for_day(&day)?;
            let conn = if self.in_memory {
                self.memory_conn.as_mut().expect("initialized above")
            } else {
                self.day_conns.get_mut(&day).expect("initialized above")
            };

            let tx = conn
                .unchecked_transaction()
                .map_err(|e| db_err("begin transaction", e))?;
            {
                let mut stmt = tx.prepare_cached(sql).map_err(|e| db_err("prepare insert", e))?;
                for event in &batch {
                    written += stmt
                        .execute(rusqlite::params![
                            event.timestamp_ms,
                            event.group_id,
                            event.control_path,
                            event.component_name,
                            event.control_name,
                            event.value.as_f64(),
                            event.string_value,
                            event.source.as_str(),
                        ])
                        .map_err(|e| db_err("insert event", e))?;
                }
            }
            tx.commit().map_err(|e| db_err("commit batch", e))?;
        }
        Ok(written)
    }

    /// Day files that could contain rows for the query's time range.
    fn candidate_days(&self, query: &EventQuery) -> Result<Vec<String>> {
        if self.in_memory {
            return Ok(vec![String::from(":memory:")]);
        }
        let mut days: Vec<String> = match std::fs::read_dir(&self.config.db_path) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .filter_map(|e| {
                    let name = e.file_name().to_string_lossy().into_owned();
                    parse_day_file(&name)
                })
                .collect(),
            Err(_) => Vec::new(),
        };

        if let Some(start) = query.start_time {
            let start_day = day_key(start);
            days.retain(|d| *d >= start_day);
        }
        if let Some(end) = query.end_time {
            let end_day = day_key(end);
            days.retain(|d| *d <= end_day);
        }
        // Newest day first; matches the descending result order.
        days.sort_by(|a, b| b.cmp(a));
        Ok(days)
    }

    fn query(&mut self, query: &EventQuery) -> Result<Vec<ChangeEvent>> {
        let limit = query.effective_limit();
        let offset = query.offset.unwrap_or(0);
        let fetch_cap = limit.saturating_add(offset);

        let (where_sql, params) = build_where(query);
        let sql = format!(
            "SELECT timestamp, change_group_id, control_path, component_name, control_name, \
             value, string_value, source FROM events{where_sql} \
             ORDER BY timestamp DESC, id DESC LIMIT {fetch_cap}"
        );

        let mut rows: Vec<ChangeEvent> = Vec::new();
        for day in self.candidate_days(query)? {
            if rows.len() >= fetch_cap {
                break;
            }
            let conn = if self.in_memory {
                match &self.memory_conn {
                    Some(conn) => conn,
                    // Nothing written yet.
                    None => break,
                }
            } else {
                self.conn_for_day(&day)?
            };

            let mut stmt = conn.prepare(&sql).map_err(|e| db_err("prepare query", e))?;
            let mapped = stmt
                .query_map(rusqlite::params_from_iter(params.iter()), row_to_event)
                .map_err(|e| db_err("run query", e))?;
            for event in mapped {
                rows.push(event.map_err(|e| db_err("read row", e))?);
            }
        }

        // Files were visited newest-day-first and each is internally
        // ordered, so a stable sort finishes the global ordering.
        rows.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms));
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    fn statistics(&mut self) -> Result<StoreStatistics> {
        let all = EventQuery::default();
        let mut total: u64 = 0;
        let mut oldest: Option<i64> = None;
        let mut newest: Option<i64> = None;
        let mut controls: HashSet<String> = HashSet::new();
        let mut groups: HashSet<String> = HashSet::new();
        let mut size: u64 = 0;

        for day in self.candidate_days(&all)? {
            if !self.in_memory {
                size += std::fs::metadata(self.day_file(&day)).map(|m| m.len()).unwrap_or(0);
            }
            let conn = if self.in_memory {
                match &self.memory_conn {
                    Some(conn) => conn,
                    None => break,
                }
            } else {
                self.conn_for_day(&day)?
            };

            let (count, min_ts, max_ts): (u64, Option<i64>, Option<i64>) = conn
                .query_row(
                    "SELECT COUNT(*), MIN(timestamp), MAX(timestamp) FROM events",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .map_err(|e| db_err("aggregate stats", e))?;
            total += count;
            oldest = merge_min(oldest, min_ts);
            newest = merge_max(newest, max_ts);

            let mut stmt = conn
                .prepare("SELECT DISTINCT control_path, change_group_id FROM events")
                .map_err(|e| db_err("distinct stats", e))?;
            let mapped = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(|e| db_err("distinct stats", e))?;
            for pair in mapped {
                let (path, group) = pair.map_err(|e| db_err("distinct stats", e))?;
                controls.insert(path);
                groups.insert(group);
            }
        }

        let events_per_second = match (oldest, newest) {
            (Some(a), Some(b)) if b > a => Some(total as f64 / ((b - a) as f64 / 1000.0)),
            _ => None,
        };

        Ok(StoreStatistics {
            total_events: total,
            unique_controls: controls.len() as u64,
            unique_change_groups: groups.len() as u64,
            oldest_event: oldest,
            newest_event: newest,
            events_per_second,
            database_size: size,
            buffer_size: 0,
        })
    }

    fn backup(&mut self, compress: bool) -> Result<PathBuf> {
        if self.in_memory {
            return Err(QsysError::validation(
                "Backup is not available for :memory: stores",
            ));
        }
        let today = day_key(Utc::now().timestamp_millis());
        let backup_dir = self.config.backup_path.clone();
        let max_backups = self.config.max_backups;
        let conn = self.conn_for_day(&today)?;
        backup_database(conn, &backup_dir, compress, max_backups)
    }

    fn restore(&mut self, backup_path: &Path) -> Result<()> {
        if self.in_memory {
            return Err(QsysError::validation(
                "Restore is not available for :memory: stores",
            ));
        }
        let today = day_key(Utc::now().timestamp_millis());
        // Close the live connection before overwriting its file.
        self.day_conns.remove(&today);
        std::fs::create_dir_all(&self.config.db_path).map_err(|e| io_err("create db dir", e))?;
        restore_database(backup_path, &self.day_file(&today))
    }

    fn export(&mut self, query: &EventQuery) -> Result<(PathBuf, serde_json::Value)> {
        let events = self.query(query)?;
        export_events(
            &events,
            &self.config.backup_path.clone(),
            query.start_time,
            query.end_time,
        )
    }

    /// Delete day files older than the retention horizon, then VACUUM
    /// the current day.
    fn sweep(&mut self) -> Result<usize> {
        if self.in_memory {
            return Ok(0);
        }
        let cutoff = Utc::now().date_naive() - chrono::Days::new(self.config.retention_days as u64);
        let mut removed = 0;

        let entries = match std::fs::read_dir(&self.config.db_path) {
            Ok(entries) => entries,
            Err(_) => return Ok(0),
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(day) = parse_day_file(&name) else {
                continue;
            };
            let Ok(date) = NaiveDate::parse_from_str(&day, "%Y-%m-%d") else {
                continue;
            };
            if date < cutoff {
                self.day_conns.remove(&day);
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => {
                        removed += 1;
                        tracing::info!(day = %day, "Removed expired event database");
                    }
                    Err(e) => {
                        tracing::warn!(day = %day, error = %e, "Failed to remove expired database");
                    }
                }
            }
        }

        let today = day_key(Utc::now().timestamp_millis());
        if self.day_file(&today).exists() {
            let conn = self.conn_for_day(&today)?;
            if let Err(e) = conn.execute_batch("VACUUM") {
                tracing::warn!(error = %e, "VACUUM failed");
            }
        }
        Ok(removed)
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    // Some pragmas answer with a row (journal_mode); step through
    // whatever comes back instead of assuming none.
    for pragma in [
        "PRAGMA journal_mode=WAL",
        "PRAGMA synchronous=NORMAL",
        "PRAGMA cache_size=10000",
    ] {
        let mut stmt = conn.prepare(pragma).map_err(|e| db_err("prepare pragma", e))?;
        let mut rows = stmt.query([]).map_err(|e| db_err("apply pragma", e))?;
        while rows.next().map_err(|e| db_err("apply pragma", e))?.is_some() {}
    }
    conn.execute_batch(SCHEMA).map_err(|e| db_err("create schema", e))?;
    check_integrity(conn)
}

/// UTC day key (`YYYY-MM-DD`) for a millisecond timestamp.
fn day_key(timestamp_ms: i64) -> String {
    let date = DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
        .map(|t| t.date_naive())
        .unwrap_or_else(|| Utc::now().date_naive());
    format!("{:04}-{:02}-{:02}", date.year(), date.month(), date.day())
}

fn parse_day_file(name: &str) -> Option<String> {
    let day = name.strip_prefix("events-")?.strip_suffix(".db")?;
    if NaiveDate::parse_from_str(day, "%Y-%m-%d").is_ok() {
        Some(day.to_string())
    } else {
        None
    }
}

fn merge_min(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (x, None) | (None, x) => x,
    }
}

fn merge_max(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (x, None) | (None, x) => x,
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChangeEvent> {
    let value: Option<f64> = row.get(5)?;
    let string_value: Option<String> = row.get(6)?;
    let string_value = string_value.unwrap_or_default();
    let source: String = row.get(7)?;
    let control_value = match value {
        Some(v) => ControlValue::Number(v),
        None => ControlValue::String(string_value.clone()),
    };
    Ok(ChangeEvent {
        timestamp_ms: row.get(0)?,
        group_id: row.get(1)?,
        control_path: row.get(2)?,
        component_name: row.get(3)?,
        control_name: row.get(4)?,
        value: control_value,
        string_value,
        source: source.parse().unwrap_or(EventSource::Unknown),
    })
}

/// Compose the WHERE clause. Values are always bound parameters, never
/// interpolated.
fn build_where(query: &EventQuery) -> (String, Vec<rusqlite::types::Value>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut params: Vec<rusqlite::types::Value> = Vec::new();

    if let Some(group_id) = &query.group_id {
        clauses.push(format!("change_group_id = ?{}", params.len() + 1));
        params.push(group_id.clone().into());
    }
    if let Some(start) = query.start_time {
        clauses.push(format!("timestamp >= ?{}", params.len() + 1));
        params.push(start.into());
    }
    if let Some(end) = query.end_time {
        clauses.push(format!("timestamp <= ?{}", params.len() + 1));
        params.push(end.into());
    }
    for (column, values) in [
        ("control_name", &query.control_names),
        ("control_path", &query.control_paths),
        ("component_name", &query.component_names),
    ] {
        if let Some(values) = values {
            if values.is_empty() {
                clauses.push(String::from("0 = 1"));
                continue;
            }
            let placeholders: Vec<String> = values
                .iter()
                .map(|v| {
                    params.push(v.clone().into());
                    format!("?{}", params.len())
                })
                .collect();
            clauses.push(format!("{column} IN ({})", placeholders.join(", ")));
        }
    }
    if let Some(filter) = &query.value_filter {
        use crate::monitor::query::FilterOp;
        match filter.op {
            FilterOp::Contains => {
                let needle = match &filter.value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                clauses.push(format!("string_value LIKE ?{}", params.len() + 1));
                params.push(format!("%{needle}%").into());
            }
            FilterOp::Eq | FilterOp::Ne => {
                let op = if filter.op == FilterOp::Eq { "=" } else { "!=" };
                match &filter.value {
                    serde_json::Value::String(s) => {
                        clauses.push(format!("string_value {op} ?{}", params.len() + 1));
                        params.push(s.clone().into());
                    }
                    other => match other.as_f64() {
                        Some(n) => {
                            clauses.push(format!("value {op} ?{}", params.len() + 1));
                            params.push(n.into());
                        }
                        None => clauses.push(String::from("0 = 1")),
                    },
                }
            }
            FilterOp::Gt | FilterOp::Gte | FilterOp::Lt | FilterOp::Lte => {
                let op = match filter.op {
                    FilterOp::Gt => ">",
                    FilterOp::Gte => ">=",
                    FilterOp::Lt => "<",
                    _ => "<=",
                };
                match filter.value.as_f64() {
                    Some(n) => {
                        clauses.push(format!("value {op} ?{}", params.len() + 1));
                        params.push(n.into());
                    }
                    None => clauses.push(String::from("0 = 1")),
                }
            }
        }
    }

    if clauses.is_empty() {
        (String::new(), params)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(ts: i64, group: &str, path: &str, value: f64) -> ChangeEvent {
        let (component, control) = path.split_once('.').unwrap_or(("", path));
        ChangeEvent {
            timestamp_ms: ts,
            group_id: group.to_string(),
            control_path: path.to_string(),
            component_name: component.to_string(),
            control_name: control.to_string(),
            value: ControlValue::Number(value),
            string_value: value.to_string(),
            source: EventSource::SdkControlEvent,
        }
    }

    fn disk_config(dir: &Path) -> MonitoringConfig {
        MonitoringConfig {
            enabled: true,
            db_path: dir.join("events"),
            backup_path: dir.join("backups"),
            buffer_size: 1000,
            flush_interval_ms: 3_600_000,
            backup_interval_ms: 0,
            ..MonitoringConfig::default()
        }
    }

    fn memory_config() -> MonitoringConfig {
        MonitoringConfig {
            enabled: true,
            db_path: PathBuf::from(":memory:"),
            flush_interval_ms: 3_600_000,
            backup_interval_ms: 0,
            ..MonitoringConfig::default()
        }
    }

    // Noon UTC on 2026-07-01.
    const T0: i64 = 1_782_907_200_000;

    #[tokio::test]
    async fn test_insert_query_round_trip() {
        let store = EventStore::open(memory_config()).unwrap();
        store.ingest(event(T0, "g", "Mixer.gain", -6.0)).await;
        store.ingest(event(T0 + 10, "g", "Mixer.gain", -3.0)).await;

        let results = store.query(EventQuery::for_group("g")).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].timestamp_ms, T0 + 10);
        assert_eq!(results[0].value, ControlValue::Number(-3.0));
        store.close().await;
    }

    #[tokio::test]
    async fn test_limit_and_order() {
        let store = EventStore::open(memory_config()).unwrap();
        for i in 0..20 {
            store.ingest(event(T0 + i, "g", "A.x", i as f64)).await;
        }
        let results = store
            .query(EventQuery {
                group_id: Some("g".into()),
                limit: Some(5),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 5);
        assert!(results.windows(2).all(|w| w[0].timestamp_ms >= w[1].timestamp_ms));
        store.close().await;
    }

    #[tokio::test]
    async fn test_filters_translate_to_sql() {
        let store = EventStore::open(memory_config()).unwrap();
        store.ingest(event(T0, "g1", "Mixer.gain", -6.0)).await;
        store.ingest(event(T0 + 1, "g1", "Mixer.mute", 1.0)).await;
        store.ingest(event(T0 + 2, "g2", "Amp.gain", 3.0)).await;

        let results = store
            .query(EventQuery {
                control_names: Some(vec!["gain".into()]),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 2);

        let results = store
            .query(EventQuery {
                component_names: Some(vec!["Amp".into()]),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 1);

        let results = store
            .query(EventQuery {
                value_filter: Some(crate::monitor::query::ValueFilter {
                    op: crate::monitor::query::FilterOp::Gte,
                    value: serde_json::json!(0),
                }),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        store.close().await;
    }

    #[tokio::test]
    async fn test_day_rotation_routes_by_event_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::open(disk_config(dir.path())).unwrap();

        // One event just before midnight UTC, one just after.
        let midnight = 1_782_950_400_000; // 2026-07-02T00:00:00Z
        store.ingest(event(midnight - 5, "g", "A.x", 1.0)).await;
        store.ingest(event(midnight + 5, "g", "A.x", 2.0)).await;
        store.flush().await;

        let db_dir = dir.path().join("events");
        assert!(db_dir.join("events-2026-07-01.db").exists());
        assert!(db_dir.join("events-2026-07-02.db").exists());

        // Both remain visible through one query.
        let results = store.query(EventQuery::for_group("g")).await.unwrap();
        assert_eq!(results.len(), 2);
        store.close().await;
    }

    #[tokio::test]
    async fn test_statistics() {
        let store = EventStore::open(memory_config()).unwrap();
        store.ingest(event(T0, "g1", "Mixer.gain", -6.0)).await;
        store.ingest(event(T0 + 1000, "g2", "Mixer.mute", 1.0)).await;

        let stats = store.statistics().await.unwrap();
        assert_eq!(stats.total_events, 2);
        assert_eq!(stats.unique_controls, 2);
        assert_eq!(stats.unique_change_groups, 2);
        assert_eq!(stats.oldest_event, Some(T0));
        assert_eq!(stats.newest_event, Some(T0 + 1000));
        assert_eq!(stats.buffer_size, 0);
        assert!(stats.events_per_second.unwrap() > 1.9);
        store.close().await;
    }

    #[tokio::test]
    async fn test_export_import_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::open(disk_config(dir.path())).unwrap();
        for i in 0..5 {
            store.ingest(event(T0 + i, "g", "A.x", i as f64)).await;
        }
        let (path, document) = store
            .export(EventQuery {
                start_time: Some(T0),
                end_time: Some(T0 + 10),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(path.exists());
        assert_eq!(document["eventsCount"], 5);

        let target_dir = tempfile::tempdir().unwrap();
        let target = EventStore::open(disk_config(target_dir.path())).unwrap();
        let written = target.import(document).await.unwrap();
        assert_eq!(written, 5);

        let source_events = store.query(EventQuery::default()).await.unwrap();
        let target_events = target.query(EventQuery::default()).await.unwrap();
        assert_eq!(source_events, target_events);
        store.close().await;
        target.close().await;
    }

    #[tokio::test]
    async fn test_backup_restore_preserves_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::open(disk_config(dir.path())).unwrap();

        let now = Utc::now().timestamp_millis();
        for i in 0..10 {
            store.ingest(event(now + i, "g", "A.x", i as f64)).await;
        }
        let backup_path = store.backup(false).await.unwrap();
        assert!(backup_path.exists());

        // Wipe by restoring into a fresh store directory.
        let dir2 = tempfile::tempdir().unwrap();
        let restored = EventStore::open(disk_config(dir2.path())).unwrap();
        restored.restore(backup_path).await.unwrap();

        let results = restored.query(EventQuery::for_group("g")).await.unwrap();
        assert_eq!(results.len(), 10);
        store.close().await;
        restored.close().await;
    }

    #[tokio::test]
    async fn test_retention_sweep_removes_old_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = MonitoringConfig {
            retention_days: 30,
            ..disk_config(dir.path())
        };
        let db_dir = config.db_path.clone();
        std::fs::create_dir_all(&db_dir).unwrap();
        std::fs::write(db_dir.join("events-2020-01-01.db"), b"old").unwrap();
        std::fs::write(db_dir.join("not-a-day-file.txt"), b"keep").unwrap();

        let store = EventStore::open(config).unwrap();
        let now = Utc::now().timestamp_millis();
        store.ingest(event(now, "g", "A.x", 1.0)).await;
        store.flush().await;

        let removed = store.sweep_now().await.unwrap();
        assert_eq!(removed, 1);
        assert!(!db_dir.join("events-2020-01-01.db").exists());
        assert!(db_dir.join("not-a-day-file.txt").exists());
        store.close().await;
    }

    #[tokio::test]
    async fn test_memory_store_skips_backup() {
        let store = EventStore::open(memory_config()).unwrap();
        assert!(store.backup(false).await.is_err());
        assert_eq!(store.sweep_now().await.unwrap(), 0);
        store.close().await;
    }

    #[test]
    fn test_day_key() {
        assert_eq!(day_key(T0), "2026-07-01");
        assert_eq!(parse_day_file("events-2026-07-01.db").as_deref(), Some("2026-07-01"));
        assert_eq!(parse_day_file("events-backup-x.db"), None);
        assert_eq!(parse_day_file("whatever.txt"), None);
    }
}

//! In-memory event ring cache.
//!
//! One append-only ring per change group, bounded by event count and
//! age, with a global memory ceiling enforced across groups. Optional
//! time-windowed compression thins old events; optional disk spillover
//! serializes whole groups to JSONL and merges them back at query time.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;

use crate::core::events::{ChangeEvent, ChangeGroupSignal, SignalReceiver};
use crate::monitor::query::EventQuery;

/// Ring cache tuning.
#[derive(Debug, Clone)]
pub struct RingConfig {
    /// Per-group event cap.
    pub max_events: usize,

    /// Per-group age cap in milliseconds.
    pub max_age_ms: i64,

    /// Global ceiling across groups, in megabytes.
    pub global_memory_limit_mb: f64,

    /// Optional down-sampling of old events.
    pub compression: Option<CompressionConfig>,

    /// Optional spill-to-disk under memory pressure.
    pub spillover: Option<SpilloverConfig>,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            max_events: 100_000,
            max_age_ms: 300_000,
            global_memory_limit_mb: 256.0,
            compression: None,
            spillover: None,
        }
    }
}

/// Time-windowed down-sampling configuration.
///
/// Events older than `recent_window_ms` are thinned: an event is kept
/// only when it differs from the last kept value by at least
/// `significant_change_percent`, and at least `min_time_between_events_ms`
/// has passed. The medium and ancient windows apply the same rule with
/// doubled and quadrupled aggressiveness.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Events newer than this are never thinned.
    pub recent_window_ms: i64,

    /// Medium-age boundary.
    pub medium_window_ms: i64,

    /// Ancient boundary; beyond it thinning is most aggressive.
    pub ancient_window_ms: i64,

    /// Minimum relative change (percent) to keep an event.
    pub significant_change_percent: f64,

    /// Minimum spacing between kept events.
    pub min_time_between_events_ms: i64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            recent_window_ms: 60_000,
            medium_window_ms: 300_000,
            ancient_window_ms: 900_000,
            significant_change_percent: 1.0,
            min_time_between_events_ms: 1000,
        }
    }
}

/// Disk spillover configuration.
#[derive(Debug, Clone)]
pub struct SpilloverConfig {
    /// Where JSONL spill files land.
    pub directory: PathBuf,

    /// Spill when memory exceeds this fraction of the global limit
    /// (percent, e.g. `80.0`).
    pub threshold_percent: f64,
}

/// Cache health report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RingHealth {
    /// `healthy`, `degraded` (memory pressure or spill errors), or
    /// `unhealthy` (eviction failing).
    pub status: String,
    /// Errors observed (spill/IO).
    pub error_count: u64,
    /// Current memory footprint.
    pub memory_usage_mb: f64,
    /// Footprint as a percentage of the global limit.
    pub percentage: f64,
    /// Whether compression is configured.
    pub compression_active: bool,
    /// Whether spillover is configured.
    pub disk_spillover_active: bool,
    /// Per-group statistics.
    pub groups: Vec<RingGroupHealth>,
}

/// Per-group slice of the health report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RingGroupHealth {
    /// Group id.
    pub group_id: String,
    /// Events held in memory.
    pub event_count: usize,
    /// Approximate bytes held.
    pub memory_bytes: usize,
    /// Whether this group has a spill file on disk.
    pub spilled: bool,
}

struct GroupRing {
    /// `(insertion sequence, event)`, oldest first.
    events: VecDeque<(u64, ChangeEvent)>,
    bytes: usize,
    last_ingest_ms: i64,
}

impl GroupRing {
    fn new() -> Self {
        Self {
            events: VecDeque::new(),
            bytes: 0,
            last_ingest_ms: 0,
        }
    }
}

/// The ring cache.
pub struct RingCache {
    config: RingConfig,
    groups: Mutex<HashMap<String, GroupRing>>,
    /// Groups currently spilled to disk (id -> file path).
    spilled: Mutex<HashMap<String, PathBuf>>,
    seq: AtomicU64,
    error_count: AtomicU64,
    dropped_events: AtomicU64,
}

impl RingCache {
    /// Create a cache.
    pub fn new(config: RingConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            groups: Mutex::new(HashMap::new()),
            spilled: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            dropped_events: AtomicU64::new(0),
        })
    }

    /// Spawn a consumer task that feeds the cache from the signal bus.
    pub fn attach(self: &Arc<Self>, mut signals: SignalReceiver) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match signals.recv().await {
                    Ok(ChangeGroupSignal::Changes { changes, .. }) => {
                        cache.ingest_batch(changes);
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        cache.dropped_events.fetch_add(missed, Ordering::Relaxed);
                        tracing::warn!(missed, "Ring cache lagged behind the signal bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }

    /// Append one event.
    pub fn ingest(&self, event: ChangeEvent) {
        self.ingest_batch(vec![event]);
    }

    /// Append a batch, then enforce the bounds.
    pub fn ingest_batch(&self, events: Vec<ChangeEvent>) {
        if events.is_empty() {
            return;
        }
        {
            let mut groups = self.groups.lock().expect("ring lock");
            for event in events {
                let seq = self.seq.fetch_add(1, Ordering::Relaxed);
                let ring = groups
                    .entry(event.group_id.clone())
                    .or_insert_with(GroupRing::new);
                ring.bytes += event.approx_size_bytes();
                ring.last_ingest_ms = event.timestamp_ms;
                ring.events.push_back((seq, event));
            }
            self.enforce_bounds(&mut groups);
        }
        self.maybe_spill();
    }

    /// Age-based eviction, per-group caps, then the global ceiling
    /// (oldest groups first).
    fn enforce_bounds(&self, groups: &mut HashMap<String, GroupRing>) {
        let cutoff = Utc::now().timestamp_millis() - self.config.max_age_ms;

        for ring in groups.values_mut() {
            while let Some((_, oldest)) = ring.events.front() {
                if oldest.timestamp_ms < cutoff || ring.events.len() > self.config.max_events {
                    let bytes = oldest.approx_size_bytes();
                    ring.bytes = ring.bytes.saturating_sub(bytes);
                    ring.events.pop_front();
                } else {
                    break;
                }
            }
        }

        let limit_bytes = (self.config.global_memory_limit_mb * 1024.0 * 1024.0) as usize;
        let mut total: usize = groups.values().map(|r| r.bytes).sum();
        while total > limit_bytes {
            // Evict from the group holding the oldest event.
            let Some(oldest_group) = groups
                .iter()
                .filter(|(_, r)| !r.events.is_empty())
                .min_by_key(|(_, r)| r.events.front().map(|(s, _)| *s).unwrap_or(u64::MAX))
                .map(|(id, _)| id.clone())
            else {
                break;
            };
            let Some(ring) = groups.get_mut(&oldest_group) else {
                break;
            };
            if let Some((_, event)) = ring.events.pop_front() {
                let bytes = event.approx_size_bytes();
                ring.bytes = ring.bytes.saturating_sub(bytes);
                total = total.saturating_sub(bytes);
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
            }
        }

        groups.retain(|_, ring| !ring.events.is_empty());
    }

    /// Run one compression pass over every group.
    ///
    /// No-op unless compression is configured.
    pub fn compress(&self) {
        let Some(compression) = &self.config.compression else {
            return;
        };
        let now = Utc::now().timestamp_millis();
        let mut groups = self.groups.lock().expect("ring lock");

        for ring in groups.values_mut() {
            let mut kept: VecDeque<(u64, ChangeEvent)> = VecDeque::with_capacity(ring.events.len());
            let mut last_kept: Option<(crate::core::control::ControlValue, i64)> = None;
            let mut bytes = 0usize;

            // Oldest-first walk; decide window per event age.
            let events = std::mem::take(&mut ring.events);
            for (seq, event) in events {
                let age = now - event.timestamp_ms;
                let keep = if age <= compression.recent_window_ms {
                    true
                } else {
                    let aggressiveness = if age <= compression.medium_window_ms {
                        1.0
                    } else if age <= compression.ancient_window_ms {
                        2.0
                    } else {
                        4.0
                    };
                    is_significant(
                        last_kept.as_ref().map(|(v, ts)| (v, *ts)),
                        &event,
                        compression.significant_change_percent * aggressiveness,
                        compression.min_time_between_events_ms * aggressiveness as i64,
                    )
                };

                if keep {
                    bytes += event.approx_size_bytes();
                    last_kept = Some((event.value.clone(), event.timestamp_ms));
                    kept.push_back((seq, event));
                }
            }

            ring.events = kept;
            ring.bytes = bytes;
        }
    }

    /// Spill the oldest groups to disk when over the threshold.
    fn maybe_spill(&self) {
        let Some(spillover) = &self.config.spillover else {
            return;
        };
        let limit_bytes = (self.config.global_memory_limit_mb * 1024.0 * 1024.0) as usize;
        let threshold = (limit_bytes as f64 * spillover.threshold_percent / 100.0) as usize;

        loop {
            let victim = {
                let groups = self.groups.lock().expect("ring lock");
                let total: usize = groups.values().map(|r| r.bytes).sum();
                if total <= threshold || groups.len() <= 1 {
                    return;
                }
                // Oldest ingest first.
                groups
                    .iter()
                    .min_by_key(|(_, r)| r.last_ingest_ms)
                    .map(|(id, _)| id.clone())
            };
            let Some(group_id) = victim else { return };
            if let Err(e) = self.spill_group(&group_id, &spillover.directory) {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(group = %group_id, error = %e, "Disk spillover failed");
                return;
            }
        }
    }

    /// Serialize one group to JSONL and drop it from memory.
    fn spill_group(&self, group_id: &str, directory: &PathBuf) -> std::io::Result<()> {
        use std::io::Write;

        let events: Vec<ChangeEvent> = {
            let mut groups = self.groups.lock().expect("ring lock");
            let Some(ring) = groups.remove(group_id) else {
                return Ok(());
            };
            ring.events.into_iter().map(|(_, e)| e).collect()
        };

        std::fs::create_dir_all(directory)?;
        let path = directory.join(format!("spill-{}.jsonl", sanitize(group_id)));
        let mut file = std::io::BufWriter::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?,
        );
        for event in &events {
            let line = serde_json::to_string(event)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            writeln!(file, "{line}")?;
        }
        file.flush()?;

        self.spilled
            .lock()
            .expect("spill lock")
            .insert(group_id.to_string(), path);
        tracing::debug!(group = %group_id, count = events.len(), "Spilled group to disk");
        Ok(())
    }

    /// Read a spilled group back for a query.
    fn read_spilled(&self, group_id: &str) -> Vec<ChangeEvent> {
        let path = {
            let spilled = self.spilled.lock().expect("spill lock");
            match spilled.get(group_id) {
                Some(path) => path.clone(),
                None => return Vec::new(),
            }
        };
        let Ok(text) = std::fs::read_to_string(&path) else {
            self.error_count.fetch_add(1, Ordering::Relaxed);
            return Vec::new();
        };
        text.lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    /// Query the cache.
    ///
    /// Results are ordered by timestamp descending; equal timestamps
    /// keep insertion order within a group (newest insertion first).
    /// Spilled groups are transparently merged back in.
    pub fn query(&self, query: &EventQuery) -> Vec<ChangeEvent> {
        let mut matched: Vec<(u64, ChangeEvent)> = Vec::new();

        {
            let groups = self.groups.lock().expect("ring lock");
            for ring in groups.values() {
                for (seq, event) in &ring.events {
                    if query.matches(event) {
                        matched.push((*seq, event.clone()));
                    }
                }
            }
        }

        // Merge spilled groups (sequence 0: they predate memory content).
        let spilled_ids: Vec<String> = {
            let spilled = self.spilled.lock().expect("spill lock");
            match &query.group_id {
                Some(id) => spilled.keys().filter(|k| *k == id).cloned().collect(),
                None => spilled.keys().cloned().collect(),
            }
        };
        for id in spilled_ids {
            for event in self.read_spilled(&id) {
                if query.matches(&event) {
                    matched.push((0, event));
                }
            }
        }

        matched.sort_by(|(seq_a, a), (seq_b, b)| {
            b.timestamp_ms
                .cmp(&a.timestamp_ms)
                .then_with(|| seq_b.cmp(seq_a))
        });

        let offset = query.offset.unwrap_or(0);
        matched
            .into_iter()
            .skip(offset)
            .take(query.effective_limit())
            .map(|(_, e)| e)
            .collect()
    }

    /// Number of events held in memory for one group.
    pub fn group_len(&self, group_id: &str) -> usize {
        let groups = self.groups.lock().expect("ring lock");
        groups.get(group_id).map(|r| r.events.len()).unwrap_or(0)
    }

    /// Events dropped by forced eviction or bus lag.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Health report.
    pub fn health(&self) -> RingHealth {
        let groups = self.groups.lock().expect("ring lock");
        let spilled = self.spilled.lock().expect("spill lock");
        let total_bytes: usize = groups.values().map(|r| r.bytes).sum();
        let limit_bytes = self.config.global_memory_limit_mb * 1024.0 * 1024.0;
        let percentage = if limit_bytes > 0.0 {
            (total_bytes as f64 / limit_bytes) * 100.0
        } else {
            0.0
        };
        let errors = self.error_count.load(Ordering::Relaxed);

        let status = if percentage > 100.0 {
            "unhealthy"
        } else if errors > 0 || percentage > 90.0 {
            "degraded"
        } else {
            "healthy"
        };

        let group_health = groups
            .iter()
            .map(|(id, ring)| RingGroupHealth {
                group_id: id.clone(),
                event_count: ring.events.len(),
                memory_bytes: ring.bytes,
                spilled: spilled.contains_key(id),
            })
            .collect();

        RingHealth {
            status: status.to_string(),
            error_count: errors,
            memory_usage_mb: total_bytes as f64 / (1024.0 * 1024.0),
            percentage,
            compression_active: self.config.compression.is_some(),
            disk_spillover_active: self.config.spillover.is_some(),
            groups: group_health,
        }
    }
}

impl std::fmt::Debug for RingCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let groups = self.groups.lock().expect("ring lock");
        f.debug_struct("RingCache")
            .field("groups", &groups.len())
            .field("events", &groups.values().map(|r| r.events.len()).sum::<usize>())
            .finish()
    }
}

/// Keep an event when it moved enough, and not too soon, relative to
/// the last kept one.
fn is_significant(
    last: Option<(&crate::core::control::ControlValue, i64)>,
    event: &ChangeEvent,
    change_percent: f64,
    min_spacing_ms: i64,
) -> bool {
    let Some((last_value, last_ts)) = last else {
        return true;
    };
    if event.timestamp_ms - last_ts < min_spacing_ms {
        return false;
    }
    match (last_value.as_f64(), event.value.as_f64()) {
        (Some(a), Some(b)) => {
            let base = a.abs().max(1e-9);
            ((b - a).abs() / base) * 100.0 >= change_percent
        }
        // Non-numeric values: any difference is significant.
        _ => *last_value != event.value,
    }
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::control::ControlValue;
    use crate::core::events::EventSource;

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

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    #[test]
    fn test_query_orders_descending_with_stable_ties() {
        let cache = RingCache::new(RingConfig::default());
        let t = now_ms();
        cache.ingest(event(t, "g", "A.x", 1.0));
        cache.ingest(event(t + 10, "g", "A.x", 2.0));
        cache.ingest(event(t + 10, "g", "A.y", 3.0));
        cache.ingest(event(t + 20, "g", "A.x", 4.0));

        let results = cache.query(&EventQuery::for_group("g"));
        assert_eq!(results.len(), 4);
        assert_eq!(results[0].value, ControlValue::Number(4.0));
        // Equal timestamps: later insertion first.
        assert_eq!(results[1].value, ControlValue::Number(3.0));
        assert_eq!(results[2].value, ControlValue::Number(2.0));
        assert_eq!(results[3].value, ControlValue::Number(1.0));
    }

    #[test]
    fn test_limit_and_offset() {
        let cache = RingCache::new(RingConfig::default());
        let t = now_ms();
        for i in 0..10 {
            cache.ingest(event(t + i, "g", "A.x", i as f64));
        }

        let query = EventQuery {
            group_id: Some("g".into()),
            limit: Some(3),
            ..Default::default()
        };
        assert_eq!(cache.query(&query).len(), 3);

        let query = EventQuery {
            group_id: Some("g".into()),
            limit: Some(3),
            offset: Some(8),
            ..Default::default()
        };
        let page = cache.query(&query);
        assert_eq!(page.len(), 2);
        assert_eq!(page[1].value, ControlValue::Number(0.0));
    }

    #[test]
    fn test_count_cap_evicts_oldest() {
        let cache = RingCache::new(RingConfig {
            max_events: 5,
            ..Default::default()
        });
        let t = now_ms();
        for i in 0..8 {
            cache.ingest(event(t + i, "g", "A.x", i as f64));
        }
        assert_eq!(cache.group_len("g"), 5);
        let results = cache.query(&EventQuery::for_group("g"));
        // The oldest three are gone.
        assert_eq!(results.last().unwrap().value, ControlValue::Number(3.0));
    }

    #[test]
    fn test_age_eviction() {
        let cache = RingCache::new(RingConfig {
            max_age_ms: 1000,
            ..Default::default()
        });
        let t = now_ms();
        cache.ingest(event(t - 10_000, "g", "A.x", 1.0));
        cache.ingest(event(t, "g", "A.x", 2.0));
        assert_eq!(cache.group_len("g"), 1);
    }

    #[test]
    fn test_global_ceiling_drops_with_counter() {
        let cache = RingCache::new(RingConfig {
            // A few hundred bytes: only a handful of events fit.
            global_memory_limit_mb: 0.0005,
            ..Default::default()
        });
        let t = now_ms();
        for i in 0..100 {
            cache.ingest(event(t + i, "g", "A.x", i as f64));
        }
        assert!(cache.dropped_events() > 0);
        let health = cache.health();
        assert!(health.memory_usage_mb * 1024.0 * 1024.0 <= 0.0005 * 1024.0 * 1024.0 + 1024.0);
    }

    #[test]
    fn test_compression_thins_old_events() {
        let cache = RingCache::new(RingConfig {
            compression: Some(CompressionConfig {
                recent_window_ms: 1000,
                medium_window_ms: 60_000,
                ancient_window_ms: 120_000,
                significant_change_percent: 10.0,
                min_time_between_events_ms: 0,
            }),
            // Age eviction off for this test.
            max_age_ms: i64::MAX / 2,
            ..Default::default()
        });
        let t = now_ms() - 30_000;
        // 50 near-identical old events and one big jump.
        for i in 0..50 {
            cache.ingest(event(t + i * 10, "g", "A.x", 100.0 + (i % 2) as f64 * 0.01));
        }
        cache.ingest(event(t + 600, "g", "A.x", 500.0));

        cache.compress();
        let kept = cache.group_len("g");
        assert!(kept < 51, "compression kept everything ({kept})");
        // The jump must survive.
        let results = cache.query(&EventQuery::for_group("g"));
        assert!(results.iter().any(|e| e.value == ControlValue::Number(500.0)));
    }

    #[test]
    fn test_spillover_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RingCache::new(RingConfig {
            global_memory_limit_mb: 0.001,
            spillover: Some(SpilloverConfig {
                directory: dir.path().to_path_buf(),
                threshold_percent: 1.0,
            }),
            ..Default::default()
        });

        let t = now_ms();
        for i in 0..20 {
            cache.ingest(event(t + i, "old", "A.x", i as f64));
        }
        for i in 0..20 {
            cache.ingest(event(t + 100 + i, "new", "B.y", i as f64));
        }

        // The older group was spilled but remains queryable.
        let health = cache.health();
        assert!(health.groups.iter().any(|g| g.spilled) || cache.group_len("old") == 0);
        let results = cache.query(&EventQuery::for_group("old"));
        assert!(!results.is_empty());
    }

    #[test]
    fn test_health_shape() {
        let cache = RingCache::new(RingConfig::default());
        cache.ingest(event(now_ms(), "g", "A.x", 1.0));
        let health = cache.health();
        assert_eq!(health.status, "healthy");
        assert_eq!(health.groups.len(), 1);
        assert!(!health.compression_active);
        assert!(!health.disk_spillover_active);
    }
}

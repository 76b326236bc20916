//! Change-group registry.
//!
//! Named sets of control paths with a polling cadence. Groups are
//! created implicitly by the first `AddControl` for a new id, polled
//! manually or by a per-group timer task, and destroyed explicitly or
//! at registry disposal.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::core::control::ControlPath;
use crate::core::error::{QsysError, Result};
use crate::core::events::{ChangeEvent, ChangeGroupSignal, EventSource, SignalSender};
use crate::qrwc::adapter::{ChangeGroupHandler, ControlReader};

use super::poller::{spawn_poller, PollerHandle};

/// Valid poll rates in seconds.
pub const MIN_POLL_RATE: f64 = 0.03;
/// Upper poll rate bound.
pub const MAX_POLL_RATE: f64 = 3600.0;
/// Rate used when `AutoPoll` omits one.
pub const DEFAULT_POLL_RATE: f64 = 0.03;

/// Consecutive tick failures before auto-poll suspends itself.
pub(crate) const MAX_CONSECUTIVE_POLL_FAILURES: u32 = 10;

/// Snapshot of one group for listings.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupInfo {
    /// Group id.
    pub id: String,
    /// Number of subscribed controls.
    pub control_count: usize,
    /// Configured poll rate in seconds.
    pub poll_rate_seconds: f64,
    /// Whether a poll timer is running.
    pub active: bool,
}

/// Outcome of an add operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddOutcome {
    /// The group already existed before this call.
    pub existed: bool,
    /// Controls actually added.
    pub added: usize,
    /// Controls skipped because they were already subscribed.
    pub skipped_duplicates: usize,
    /// Controls skipped because they did not resolve.
    pub skipped_invalid: Vec<String>,
    /// Subscribed controls after the call.
    pub total: usize,
}

pub(crate) struct GroupState {
    pub(crate) controls: Vec<String>,
    pub(crate) rate: f64,
    pub(crate) snapshot: HashMap<String, (crate::core::control::ControlValue, String)>,
    pub(crate) polled_once: bool,
    pub(crate) last_emitted_ms: i64,
    pub(crate) poller: Option<PollerHandle>,
}

impl GroupState {
    fn new(rate: f64) -> Self {
        Self {
            controls: Vec::new(),
            rate,
            snapshot: HashMap::new(),
            polled_once: false,
            last_emitted_ms: 0,
            poller: None,
        }
    }

    fn is_active(&self) -> bool {
        self.poller.as_ref().is_some_and(|p| !p.is_finished())
    }
}

pub(crate) struct RegistryInner {
    pub(crate) reader: Arc<dyn ControlReader>,
    pub(crate) groups: Mutex<HashMap<String, GroupState>>,
    pub(crate) signals: SignalSender,
}

impl RegistryInner {
    /// One poll pass over a group: read, diff against the snapshot,
    /// emit. Returns the changes in tick order.
    pub(crate) async fn poll_once(
        self: &Arc<Self>,
        id: &str,
        source: EventSource,
    ) -> Result<Vec<ChangeEvent>> {
        let controls = {
            let groups = self.groups.lock().expect("group lock");
            let group = groups
                .get(id)
                .ok_or_else(|| QsysError::validation(format!("Change group not found: {id}")))?;
            group.controls.clone()
        };
        if controls.is_empty() {
            return Ok(Vec::new());
        }

        let readings = self.reader.read_controls(&controls).await?;

        let mut groups = self.groups.lock().expect("group lock");
        // The group may have been destroyed while the read was in flight.
        let Some(group) = groups.get_mut(id) else {
            return Ok(Vec::new());
        };

        let first_poll = !group.polled_once;
        let timestamp_ms = Utc::now().timestamp_millis().max(group.last_emitted_ms);

        let mut changes = Vec::new();
        for reading in readings {
            let previous = group.snapshot.get(&reading.name);
            let changed = first_poll || previous.map(|(v, _)| v) != Some(&reading.value);
            if changed {
                let path = ControlPath::parse(&reading.name).unwrap_or(ControlPath {
                    component: None,
                    control: reading.name.clone(),
                });
                changes.push(ChangeEvent {
                    timestamp_ms,
                    group_id: id.to_string(),
                    control_path: reading.name.clone(),
                    component_name: path.component.clone().unwrap_or_default(),
                    control_name: path.control,
                    value: reading.value.clone(),
                    string_value: reading.string.clone(),
                    source,
                });
            }
            group
                .snapshot
                .insert(reading.name, (reading.value, reading.string));
        }

        group.polled_once = true;
        if !changes.is_empty() {
            group.last_emitted_ms = timestamp_ms;
        }
        drop(groups);

        if !changes.is_empty() {
            let _ = self.signals.send(ChangeGroupSignal::Changes {
                group_id: id.to_string(),
                changes: changes.clone(),
                timestamp_ms,
            });
        }
        Ok(changes)
    }

    /// Mark a group inactive after its poller suspended itself.
    pub(crate) fn poller_suspended(&self, id: &str, reason: &str) {
        let mut groups = self.groups.lock().expect("group lock");
        if let Some(group) = groups.get_mut(id) {
            group.poller = None;
        }
        drop(groups);
        let _ = self.signals.send(ChangeGroupSignal::AutoPollStopped {
            group_id: id.to_string(),
            reason: reason.to_string(),
        });
    }
}

/// The change-group registry.
pub struct ChangeGroupRegistry {
    inner: Arc<RegistryInner>,
}

impl ChangeGroupRegistry {
    /// Create a registry reading through the given control reader.
    pub fn new(reader: Arc<dyn ControlReader>, signals: SignalSender) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(RegistryInner {
                reader,
                groups: Mutex::new(HashMap::new()),
                signals,
            }),
        })
    }

    /// Add controls to a group, creating it when the id is new.
    ///
    /// Adds are set-union: duplicates are skipped, never an error, and
    /// an existing group keeps everything it already tracks. Paths that
    /// do not resolve against the discovery index are skipped and
    /// reported.
    pub fn add_controls(&self, id: &str, controls: &[String]) -> Result<AddOutcome> {
        if id.is_empty() {
            return Err(QsysError::validation("Change group id must not be empty"));
        }

        let mut groups = self.inner.groups.lock().expect("group lock");
        let existed = groups.contains_key(id);
        let group = groups
            .entry(id.to_string())
            .or_insert_with(|| GroupState::new(DEFAULT_POLL_RATE));

        let mut added = 0;
        let mut skipped_duplicates = 0;
        let mut skipped_invalid = Vec::new();

        for raw in controls {
            let Ok(path) = ControlPath::parse(raw) else {
                skipped_invalid.push(raw.clone());
                continue;
            };
            if !self.inner.reader.resolves(&path) {
                skipped_invalid.push(raw.clone());
                continue;
            }
            if group.controls.iter().any(|c| c == raw) {
                skipped_duplicates += 1;
                continue;
            }
            group.controls.push(raw.clone());
            added += 1;
        }

        let outcome = AddOutcome {
            existed,
            added,
            skipped_duplicates,
            skipped_invalid,
            total: group.controls.len(),
        };
        drop(groups);

        if !existed {
            let _ = self.inner.signals.send(ChangeGroupSignal::Activated {
                group_id: id.to_string(),
            });
        }
        Ok(outcome)
    }

    /// Remove controls from a group. Unknown controls are ignored.
    pub fn remove_controls(&self, id: &str, controls: &[String]) -> Result<usize> {
        let mut groups = self.inner.groups.lock().expect("group lock");
        let group = groups
            .get_mut(id)
            .ok_or_else(|| QsysError::validation(format!("Change group not found: {id}")))?;
        let before = group.controls.len();
        group.controls.retain(|c| !controls.contains(c));
        for control in controls {
            group.snapshot.remove(control);
        }
        Ok(before - group.controls.len())
    }

    /// Remove every control from a group; the group itself survives.
    pub fn clear(&self, id: &str) -> Result<()> {
        let mut groups = self.inner.groups.lock().expect("group lock");
        let group = groups
            .get_mut(id)
            .ok_or_else(|| QsysError::validation(format!("Change group not found: {id}")))?;
        group.controls.clear();
        group.snapshot.clear();
        group.polled_once = false;
        Ok(())
    }

    /// Manual poll: diff now, with `changeGroup` event source.
    pub async fn poll(&self, id: &str) -> Result<Vec<ChangeEvent>> {
        self.inner.poll_once(id, EventSource::ChangeGroup).await
    }

    /// Start (or restart) auto-poll for a group.
    ///
    /// `rate_seconds` must fall in `[0.03, 3600]`; `None` uses the
    /// default 0.03 s. A running timer is replaced, not stacked.
    pub fn auto_poll(&self, id: &str, rate_seconds: Option<f64>) -> Result<f64> {
        let rate = validate_rate(rate_seconds.unwrap_or(DEFAULT_POLL_RATE))?;

        let mut groups = self.inner.groups.lock().expect("group lock");
        let group = groups
            .get_mut(id)
            .ok_or_else(|| QsysError::validation(format!("Change group not found: {id}")))?;

        if let Some(old) = group.poller.take() {
            old.cancel();
        }
        group.rate = rate;
        group.poller = Some(spawn_poller(Arc::clone(&self.inner), id.to_string(), rate));
        drop(groups);

        let _ = self.inner.signals.send(ChangeGroupSignal::AutoPollStarted {
            group_id: id.to_string(),
            rate_seconds: rate,
        });
        Ok(rate)
    }

    /// Destroy a group: cancel its timer and drop its subscriptions.
    /// Recorded history (in the event sinks) is unaffected.
    pub fn destroy(&self, id: &str) -> Result<()> {
        let mut groups = self.inner.groups.lock().expect("group lock");
        let group = groups
            .remove(id)
            .ok_or_else(|| QsysError::validation(format!("Change group not found: {id}")))?;
        let was_active = group.is_active();
        if let Some(poller) = group.poller {
            poller.cancel();
        }
        drop(groups);

        if was_active {
            let _ = self.inner.signals.send(ChangeGroupSignal::AutoPollStopped {
                group_id: id.to_string(),
                reason: String::from("destroyed"),
            });
        }
        let _ = self.inner.signals.send(ChangeGroupSignal::Deactivated {
            group_id: id.to_string(),
        });
        Ok(())
    }

    /// Destroy every group (process shutdown / disposal).
    pub fn destroy_all(&self) {
        let ids: Vec<String> = {
            let groups = self.inner.groups.lock().expect("group lock");
            groups.keys().cloned().collect()
        };
        for id in ids {
            let _ = self.destroy(&id);
        }
    }

    /// Whether a group exists.
    pub fn contains(&self, id: &str) -> bool {
        self.inner.groups.lock().expect("group lock").contains_key(id)
    }

    /// Listing of all groups, sorted by id.
    pub fn list(&self) -> Vec<GroupInfo> {
        let groups = self.inner.groups.lock().expect("group lock");
        let mut out: Vec<GroupInfo> = groups
            .iter()
            .map(|(id, group)| GroupInfo {
                id: id.clone(),
                control_count: group.controls.len(),
                poll_rate_seconds: group.rate,
                active: group.is_active(),
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Info for one group.
    pub fn info(&self, id: &str) -> Option<GroupInfo> {
        let groups = self.inner.groups.lock().expect("group lock");
        groups.get(id).map(|group| GroupInfo {
            id: id.to_string(),
            control_count: group.controls.len(),
            poll_rate_seconds: group.rate,
            active: group.is_active(),
        })
    }

    /// The controls subscribed in a group, in insertion order.
    pub fn controls(&self, id: &str) -> Option<Vec<String>> {
        let groups = self.inner.groups.lock().expect("group lock");
        groups.get(id).map(|g| g.controls.clone())
    }
}

impl std::fmt::Debug for ChangeGroupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeGroupRegistry")
            .field("groups", &self.list().len())
            .finish()
    }
}

/// Reject rates outside `[0.03, 3600]` seconds.
pub fn validate_rate(rate: f64) -> Result<f64> {
    if !rate.is_finite() || rate < MIN_POLL_RATE || rate > MAX_POLL_RATE {
        return Err(QsysError::validation(format!(
            "Invalid poll rate: {rate} (must be between {MIN_POLL_RATE} and {MAX_POLL_RATE} seconds)"
        )));
    }
    Ok(rate)
}

#[async_trait]
impl ChangeGroupHandler for ChangeGroupRegistry {
    async fn handle(&self, method: &str, params: Value) -> Result<Value> {
        match method {
            "ChangeGroup.AddControl" => {
                let id = require_id(&params)?;
                let controls = string_array(params.get("Controls"))?;
                let outcome = self.add_controls(&id, &controls)?;
                Ok(add_outcome_json(&outcome))
            }
            "ChangeGroup.AddComponentControl" => {
                let id = require_id(&params)?;
                let component = params
                    .get("Component")
                    .ok_or_else(|| QsysError::validation("AddComponentControl requires Component"))?;
                let name = component
                    .get("Name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| QsysError::validation("Component requires Name"))?;
                let controls: Vec<String> = component
                    .get("Controls")
                    .and_then(Value::as_array)
                    .map(|entries| {
                        entries
                            .iter()
                            .filter_map(|e| e.get("Name").and_then(Value::as_str))
                            .map(|c| format!("{name}.{c}"))
                            .collect()
                    })
                    .unwrap_or_default();
                let outcome = self.add_controls(&id, &controls)?;
                Ok(add_outcome_json(&outcome))
            }
            "ChangeGroup.Remove" => {
                let id = require_id(&params)?;
                let controls = string_array(params.get("Controls"))?;
                let removed = self.remove_controls(&id, &controls)?;
                Ok(serde_json::json!({ "result": true, "removedCount": removed }))
            }
            "ChangeGroup.Clear" => {
                let id = require_id(&params)?;
                self.clear(&id)?;
                Ok(serde_json::json!({ "result": true }))
            }
            "ChangeGroup.Poll" => {
                let id = require_id(&params)?;
                let changes = self.poll(&id).await?;
                let entries: Vec<Value> = changes
                    .iter()
                    .map(|c| {
                        serde_json::json!({
                            "Name": c.control_path,
                            "Value": c.value.to_wire(),
                            "String": c.string_value,
                        })
                    })
                    .collect();
                Ok(serde_json::json!({ "Id": id, "Changes": entries }))
            }
            "ChangeGroup.AutoPoll" => {
                let id = require_id(&params)?;
                let rate = params.get("Rate").and_then(Value::as_f64);
                let applied = self.auto_poll(&id, rate)?;
                Ok(serde_json::json!({ "Id": id, "Rate": applied }))
            }
            "ChangeGroup.Destroy" => {
                let id = require_id(&params)?;
                self.destroy(&id)?;
                Ok(serde_json::json!({ "result": true }))
            }
            other => Err(QsysError::unknown_command(other)),
        }
    }
}

fn require_id(params: &Value) -> Result<String> {
    params
        .get("Id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(String::from)
        .ok_or_else(|| QsysError::validation("Change-group method requires Id"))
}

fn string_array(value: Option<&Value>) -> Result<Vec<String>> {
    value
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .ok_or_else(|| QsysError::validation("Controls must be an array of names"))
}

fn add_outcome_json(outcome: &AddOutcome) -> Value {
    let mut json = serde_json::json!({
        "result": true,
        "addedCount": outcome.added,
        "controlCount": outcome.total,
    });
    if outcome.existed {
        json["warning"] = Value::String(format!(
            "Change group already existed; controls merged ({} total)",
            outcome.total
        ));
    }
    if !outcome.skipped_invalid.is_empty() {
        json["skippedControls"] = serde_json::json!(outcome.skipped_invalid);
    }
    json
}

//! Event query surface shared by the ring cache and the SQLite store.

use serde::{Deserialize, Serialize};

use crate::core::control::ControlValue;
use crate::core::events::ChangeEvent;

/// Default (and maximum default) result cap.
pub const DEFAULT_QUERY_LIMIT: usize = 10_000;

/// Comparison operator for value filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Greater than.
    Gt,
    /// Greater or equal.
    Gte,
    /// Less than.
    Lt,
    /// Less or equal.
    Lte,
    /// Substring match on the string form.
    Contains,
}

/// A filter on the event value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueFilter {
    /// Comparison operator.
    pub op: FilterOp,

    /// Right-hand side.
    pub value: serde_json::Value,
}

impl ValueFilter {
    /// Whether an event value passes the filter.
    pub fn matches(&self, value: &ControlValue, string_value: &str) -> bool {
        match self.op {
            FilterOp::Contains => {
                let needle = match &self.value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                string_value.contains(&needle)
            }
            FilterOp::Eq | FilterOp::Ne => {
                let equal = match (&self.value, value) {
                    (serde_json::Value::String(a), ControlValue::String(b)) => a == b,
                    (serde_json::Value::String(a), _) => *a == string_value,
                    (rhs, lhs) => match (rhs.as_f64(), lhs.as_f64()) {
                        (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
                        _ => rhs.as_bool().zip(lhs.as_bool()).is_some_and(|(a, b)| a == b),
                    },
                };
                if self.op == FilterOp::Eq {
                    equal
                } else {
                    !equal
                }
            }
            FilterOp::Gt | FilterOp::Gte | FilterOp::Lt | FilterOp::Lte => {
                let (Some(rhs), Some(lhs)) = (self.value.as_f64(), value.as_f64()) else {
                    return false;
                };
                match self.op {
                    FilterOp::Gt => lhs > rhs,
                    FilterOp::Gte => lhs >= rhs,
                    FilterOp::Lt => lhs < rhs,
                    FilterOp::Lte => lhs <= rhs,
                    _ => unreachable!(),
                }
            }
        }
    }
}

/// Query parameters for event history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventQuery {
    /// Restrict to one change group.
    pub group_id: Option<String>,

    /// Inclusive lower bound (millis since epoch).
    pub start_time: Option<i64>,

    /// Inclusive upper bound (millis since epoch).
    pub end_time: Option<i64>,

    /// Restrict to these control names (the segment after the dot).
    pub control_names: Option<Vec<String>>,

    /// Restrict to these full dotted paths.
    pub control_paths: Option<Vec<String>>,

    /// Restrict to these component names.
    pub component_names: Option<Vec<String>>,

    /// Filter on the event value.
    pub value_filter: Option<ValueFilter>,

    /// Result cap (default 10 000).
    pub limit: Option<usize>,

    /// Skip this many results (after ordering).
    pub offset: Option<usize>,
}

impl EventQuery {
    /// Query for everything in one group.
    pub fn for_group(group_id: impl Into<String>) -> Self {
        Self {
            group_id: Some(group_id.into()),
            ..Default::default()
        }
    }

    /// The effective result cap.
    #[inline]
    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_QUERY_LIMIT)
    }

    /// Whether an event passes every non-time filter.
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if let Some(group_id) = &self.group_id {
            if event.group_id != *group_id {
                return false;
            }
        }
        if let Some(start) = self.start_time {
            if event.timestamp_ms < start {
                return false;
            }
        }
        if let Some(end) = self.end_time {
            if event.timestamp_ms > end {
                return false;
            }
        }
        if let Some(names) = &self.control_names {
            if !names.iter().any(|n| *n == event.control_name) {
                return false;
            }
        }
        if let Some(paths) = &self.control_paths {
            if !paths.iter().any(|p| *p == event.control_path) {
                return false;
            }
        }
        if let Some(components) = &self.component_names {
            if !components.iter().any(|c| *c == event.component_name) {
                return false;
            }
        }
        if let Some(filter) = &self.value_filter {
            if !filter.matches(&event.value, &event.string_value) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    #[test]
    fn test_group_and_time_filters() {
        let e = event(1000, "g1", "Mixer.gain", -6.0);

        assert!(EventQuery::for_group("g1").matches(&e));
        assert!(!EventQuery::for_group("g2").matches(&e));

        let query = EventQuery {
            start_time: Some(500),
            end_time: Some(1500),
            ..Default::default()
        };
        assert!(query.matches(&e));

        let query = EventQuery {
            start_time: Some(1001),
            ..Default::default()
        };
        assert!(!query.matches(&e));
    }

    #[test]
    fn test_name_filters() {
        let e = event(1000, "g1", "Mixer.gain", -6.0);

        let query = EventQuery {
            control_names: Some(vec!["gain".into()]),
            component_names: Some(vec!["Mixer".into()]),
            control_paths: Some(vec!["Mixer.gain".into()]),
            ..Default::default()
        };
        assert!(query.matches(&e));

        let query = EventQuery {
            control_names: Some(vec!["mute".into()]),
            ..Default::default()
        };
        assert!(!query.matches(&e));
    }

    #[test]
    fn test_value_filter_operators() {
        let v = ControlValue::Number(5.0);
        let check = |op, rhs: f64| ValueFilter {
            op,
            value: serde_json::json!(rhs),
        }
        .matches(&v, "5");

        assert!(check(FilterOp::Eq, 5.0));
        assert!(check(FilterOp::Ne, 6.0));
        assert!(check(FilterOp::Gt, 4.0));
        assert!(check(FilterOp::Gte, 5.0));
        assert!(check(FilterOp::Lt, 6.0));
        assert!(check(FilterOp::Lte, 5.0));
        assert!(!check(FilterOp::Gt, 5.0));
    }

    #[test]
    fn test_contains_filter() {
        let filter = ValueFilter {
            op: FilterOp::Contains,
            value: serde_json::json!("mut"),
        };
        assert!(filter.matches(&ControlValue::String("muted".into()), "muted"));
        assert!(!filter.matches(&ControlValue::String("open".into()), "open"));
    }

    #[test]
    fn test_query_deserializes_camel_case() {
        let query: EventQuery = serde_json::from_str(
            r#"{"groupId":"g1","startTime":100,"valueFilter":{"op":"gte","value":3}}"#,
        )
        .unwrap();
        assert_eq!(query.group_id.as_deref(), Some("g1"));
        assert_eq!(query.start_time, Some(100));
        assert_eq!(query.value_filter.unwrap().op, FilterOp::Gte);
    }
}

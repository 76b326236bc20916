//! Change events and typed gateway signals.
//!
//! Signals are carried on typed broadcast channels, one variant per
//! signal, rather than a string-keyed listener table: renaming a variant
//! is a compile error, not a silently dropped message.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::core::control::ControlValue;

/// Where a change event was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventSource {
    /// Manual `ChangeGroup.Poll` diff.
    #[serde(rename = "changeGroup")]
    ChangeGroup,

    /// Auto-poll tick (including the first-tick initial snapshot).
    #[serde(rename = "sdk-control-event")]
    SdkControlEvent,

    /// Connection or design state transition.
    #[serde(rename = "state-change")]
    StateChange,

    /// Origin could not be classified.
    #[serde(rename = "unknown")]
    Unknown,
}

impl EventSource {
    /// Wire-stable string form.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ChangeGroup => "changeGroup",
            Self::SdkControlEvent => "sdk-control-event",
            Self::StateChange => "state-change",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EventSource {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "changeGroup" => Ok(Self::ChangeGroup),
            "sdk-control-event" => Ok(Self::SdkControlEvent),
            "state-change" => Ok(Self::StateChange),
            _ => Ok(Self::Unknown),
        }
    }
}

/// One observed control-value change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    /// Millis since epoch when the change was observed.
    #[serde(rename = "timestampMillis")]
    pub timestamp_ms: i64,

    /// Owning change group.
    pub group_id: String,

    /// Dotted control path.
    pub control_path: String,

    /// Component segment of the path (empty for named controls).
    pub component_name: String,

    /// Control segment of the path.
    pub control_name: String,

    /// The observed value.
    pub value: ControlValue,

    /// Display form of the value.
    pub string_value: String,

    /// Observation source.
    pub source: EventSource,
}

impl ChangeEvent {
    /// Estimated in-memory footprint, used for ring-cache accounting.
    pub fn approx_size_bytes(&self) -> usize {
        let value_len = match &self.value {
            ControlValue::String(s) => s.len(),
            _ => 8,
        };
        std::mem::size_of::<Self>()
            + self.group_id.len()
            + self.control_path.len()
            + self.component_name.len()
            + self.control_name.len()
            + self.string_value.len()
            + value_len
    }
}

/// A change-group signal.
#[derive(Debug, Clone)]
pub enum ChangeGroupSignal {
    /// One poll tick produced changes.
    Changes {
        /// Group id.
        group_id: String,
        /// The changed controls, in tick order.
        changes: Vec<ChangeEvent>,
        /// Tick timestamp (millis since epoch).
        timestamp_ms: i64,
    },

    /// Auto-poll started or restarted for a group.
    AutoPollStarted {
        /// Group id.
        group_id: String,
        /// Poll rate in seconds.
        rate_seconds: f64,
    },

    /// Auto-poll stopped for a group.
    AutoPollStopped {
        /// Group id.
        group_id: String,
        /// Why polling stopped (`destroyed`, `repeated-failures`, ...).
        reason: String,
    },

    /// A group was created or re-activated.
    Activated {
        /// Group id.
        group_id: String,
    },

    /// A group was destroyed.
    Deactivated {
        /// Group id.
        group_id: String,
    },
}

impl ChangeGroupSignal {
    /// The group this signal concerns.
    pub fn group_id(&self) -> &str {
        match self {
            Self::Changes { group_id, .. }
            | Self::AutoPollStarted { group_id, .. }
            | Self::AutoPollStopped { group_id, .. }
            | Self::Activated { group_id }
            | Self::Deactivated { group_id } => group_id,
        }
    }
}

/// Sender half of the signal bus.
pub type SignalSender = broadcast::Sender<ChangeGroupSignal>;

/// Receiver half of the signal bus.
pub type SignalReceiver = broadcast::Receiver<ChangeGroupSignal>;

/// Default bus capacity; slow consumers observe `Lagged` rather than
/// blocking the poller.
pub const SIGNAL_CHANNEL_CAPACITY: usize = 4096;

/// Create the signal bus.
pub fn signal_channel() -> (SignalSender, SignalReceiver) {
    broadcast::channel(SIGNAL_CHANNEL_CAPACITY)
}

//! Control paths, values and set-time validation.
//!
//! A control is addressed by a dotted path `Component.Control`; a path with
//! no dot is a named control registered globally on the core. Values are a
//! tagged union of number, boolean and string, with the boolean form
//! normalized to 0/1 on the wire.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::error::{QsysError, Result};

/// Component-name validation: letter or underscore first, then letters,
/// digits, spaces, underscores and dashes.
static COMPONENT_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9 _-]*$").expect("component name pattern"));

/// A parsed control path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ControlPath {
    /// Owning component, or `None` for a named (global) control.
    pub component: Option<String>,

    /// The control name within the component (or the global name).
    pub control: String,
}

impl ControlPath {
    /// Parse and validate a dotted path.
    ///
    /// `Mixer.gain` addresses control `gain` on component `Mixer`;
    /// `masterVolume` (no dot) addresses a named control.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(QsysError::validation("Control path must not be empty"));
        }

        match raw.split_once('.') {
            Some((component, control)) => {
                if !COMPONENT_NAME.is_match(component) {
                    return Err(QsysError::validation(format!(
                        "Invalid component name in control path: {raw}"
                    )));
                }
                if control.is_empty() || control.contains('.') {
                    return Err(QsysError::validation(format!(
                        "Control name must be a single segment: {raw}"
                    )));
                }
                Ok(Self {
                    component: Some(component.to_string()),
                    control: control.to_string(),
                })
            }
            None => Ok(Self {
                component: None,
                control: raw.to_string(),
            }),
        }
    }

    /// Whether this addresses a named (global) control.
    #[inline]
    pub fn is_named(&self) -> bool {
        self.component.is_none()
    }

    /// The dotted string form.
    pub fn to_dotted(&self) -> String {
        match &self.component {
            Some(c) => format!("{}.{}", c, self.control),
            None => self.control.clone(),
        }
    }
}

impl std::fmt::Display for ControlPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.component {
            Some(c) => write!(f, "{}.{}", c, self.control),
            None => write!(f, "{}", self.control),
        }
    }
}

/// A protocol-agnostic control value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlValue {
    /// Boolean (normalized to 0/1 on the wire).
    Bool(bool),

    /// 64-bit float (gain, position, level).
    Number(f64),

    /// String value.
    String(String),
}

impl ControlValue {
    /// Interpret as f64 where possible.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(v) => Some(*v),
            Self::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Self::String(_) => None,
        }
    }

    /// Interpret as bool, accepting the three inbound forms the core
    /// uses: bare bool, 0/1 numeric, `"true"`/`"false"` string.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            Self::Number(v) => Some(*v != 0.0),
            Self::String(s) => match s.as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
        }
    }

    /// The display form used for `String` companion fields.
    pub fn display_string(&self) -> String {
        match self {
            Self::Bool(v) => v.to_string(),
            Self::Number(v) => {
                if v.fract() == 0.0 && v.abs() < 1e15 {
                    format!("{}", *v as i64)
                } else {
                    v.to_string()
                }
            }
            Self::String(s) => s.clone(),
        }
    }

    /// The JSON value sent on the wire. Booleans become 0/1.
    pub fn to_wire(&self) -> serde_json::Value {
        match self {
            Self::Bool(v) => serde_json::json!(if *v { 1 } else { 0 }),
            Self::Number(v) => serde_json::json!(v),
            Self::String(s) => serde_json::json!(s),
        }
    }

    /// Decode a wire value without metadata. Numbers stay numeric,
    /// bools become `Bool`, everything else is a string.
    pub fn from_wire(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => Self::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Self::String(s.clone()),
            other => Self::String(other.to_string()),
        }
    }
}

impl From<f64> for ControlValue {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<bool> for ControlValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for ControlValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for ControlValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

/// Nominal control type reported by discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlType {
    /// Generic numeric control.
    Number,
    /// Two-state control.
    Boolean,
    /// Text control.
    String,
    /// Gain in dB (numeric with range).
    Gain,
    /// Mute toggle (boolean).
    Mute,
    /// Normalized 0.0-1.0 position.
    Position,
}

impl ControlType {
    /// Whether values of this type are numeric.
    #[inline]
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Number | Self::Gain | Self::Position)
    }

    /// Whether values of this type are boolean.
    #[inline]
    pub fn is_boolean(&self) -> bool {
        matches!(self, Self::Boolean | Self::Mute)
    }

    /// Classify from the free-form type string discovery reports.
    pub fn from_reported(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "number" | "float" | "integer" => Some(Self::Number),
            "boolean" | "bool" => Some(Self::Boolean),
            "string" | "text" => Some(Self::String),
            "gain" => Some(Self::Gain),
            "mute" => Some(Self::Mute),
            "position" => Some(Self::Position),
            _ => None,
        }
    }
}

impl std::fmt::Display for ControlType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::String => "string",
            Self::Gain => "gain",
            Self::Mute => "mute",
            Self::Position => "position",
        };
        write!(f, "{}", s)
    }
}

/// Metadata discovered for a control.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlMetadata {
    /// Nominal type, if discovery reported one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_type: Option<ControlType>,

    /// Minimum for numeric controls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,

    /// Maximum for numeric controls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,

    /// Maximum length for string controls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
}

impl ControlMetadata {
    /// Metadata for a typed control without range constraints.
    pub fn typed(control_type: ControlType) -> Self {
        Self {
            control_type: Some(control_type),
            ..Default::default()
        }
    }

    /// Set the numeric range.
    #[must_use]
    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    /// Set the maximum string length.
    #[must_use]
    pub fn with_max_length(mut self, len: usize) -> Self {
        self.max_length = Some(len);
        self
    }
}

/// Validate and coerce a requested value against control metadata.
///
/// Rules:
/// - Booleans are normalized to 0/1. A string that is not literally
///   `"true"`/`"false"` is rejected for boolean controls.
/// - Strings to numeric controls are rejected; numerics to string
///   controls are accepted and stringified.
/// - Numeric controls with a discovered range reject out-of-range
///   values; string controls with `max_length` reject over-length ones.
/// - Controls with no metadata pass through unvalidated.
pub fn coerce_value(value: &ControlValue, metadata: Option<&ControlMetadata>) -> Result<ControlValue> {
    let Some(meta) = metadata else {
        return Ok(value.clone());
    };
    let Some(control_type) = meta.control_type else {
        return Ok(value.clone());
    };

    if control_type.is_boolean() {
        let b = value.as_bool().ok_or_else(|| {
            QsysError::validation(format!(
                "Value {:?} is not a valid boolean (expected true/false, 0/1, or \"true\"/\"false\")",
                value
            ))
        })?;
        return Ok(ControlValue::Bool(b));
    }

    if control_type.is_numeric() {
        let n = match value {
            ControlValue::Number(v) => *v,
            ControlValue::Bool(v) => {
                if *v {
                    1.0
                } else {
                    0.0
                }
            }
            ControlValue::String(_) => {
                return Err(QsysError::validation(format!(
                    "String value not accepted for {control_type} control"
                )));
            }
        };
        if let Some(max) = meta.max {
            if n > max {
                return Err(QsysError::validation(format!(
                    "Value {n} is above maximum {max}"
                )));
            }
        }
        if let Some(min) = meta.min {
            if n < min {
                return Err(QsysError::validation(format!(
                    "Value {n} is below minimum {min}"
                )));
            }
        }
        return Ok(ControlValue::Number(n));
    }

    // String control: numerics are accepted and stringified.
    let s = match value {
        ControlValue::String(s) => s.clone(),
        other => other.display_string(),
    };
    if let Some(max_length) = meta.max_length {
        if s.len() > max_length {
            return Err(QsysError::validation(format!(
                "String value too long: {} > {max_length}",
                s.len()
            )));
        }
    }
    Ok(ControlValue::String(s))
}

/// Normalize a value read from the wire against metadata.
///
/// Boolean controls surface as 0/1 with a `"true"`/`"false"` display
/// string regardless of the form the core chose to send.
pub fn normalize_read(
    value: &serde_json::Value,
    metadata: Option<&ControlMetadata>,
) -> (ControlValue, String) {
    let decoded = ControlValue::from_wire(value);
    let is_boolean = metadata
        .and_then(|m| m.control_type)
        .is_some_and(|t| t.is_boolean());

    if is_boolean {
        if let Some(b) = decoded.as_bool() {
            return (
                ControlValue::Number(if b { 1.0 } else { 0.0 }),
                b.to_string(),
            );
        }
    }

    let display = decoded.display_string();
    (decoded, display)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_component_path() {
        let path = ControlPath::parse("Main Mixer.gain").unwrap();
        assert_eq!(path.component.as_deref(), Some("Main Mixer"));
        assert_eq!(path.control, "gain");
        assert!(!path.is_named());
        assert_eq!(path.to_dotted(), "Main Mixer.gain");
    }

    #[test]
    fn test_parse_named_control() {
        let path = ControlPath::parse("masterVolume").unwrap();
        assert!(path.is_named());
        assert_eq!(path.control, "masterVolume");
    }

    #[test]
    fn test_parse_rejects_bad_paths() {
        assert!(ControlPath::parse("").is_err());
        assert!(ControlPath::parse("9Mixer.gain").is_err());
        assert!(ControlPath::parse("Mixer.gain.extra").is_err());
        assert!(ControlPath::parse("Mixer.").is_err());
    }

    #[test]
    fn test_boolean_coercion() {
        let meta = ControlMetadata::typed(ControlType::Mute);

        let v = coerce_value(&ControlValue::Bool(true), Some(&meta)).unwrap();
        assert_eq!(v, ControlValue::Bool(true));

        let v = coerce_value(&ControlValue::from("false"), Some(&meta)).unwrap();
        assert_eq!(v, ControlValue::Bool(false));

        let v = coerce_value(&ControlValue::Number(1.0), Some(&meta)).unwrap();
        assert_eq!(v, ControlValue::Bool(true));

        assert!(coerce_value(&ControlValue::from("yes"), Some(&meta)).is_err());
    }

    #[test]
    fn test_string_to_number_rejected() {
        let meta = ControlMetadata::typed(ControlType::Gain);
        assert!(coerce_value(&ControlValue::from("loud"), Some(&meta)).is_err());
    }

    #[test]
    fn test_number_to_string_stringified() {
        let meta = ControlMetadata::typed(ControlType::String);
        let v = coerce_value(&ControlValue::Number(42.0), Some(&meta)).unwrap();
        assert_eq!(v, ControlValue::String("42".to_string()));
    }

    #[test]
    fn test_range_validation_messages() {
        let meta = ControlMetadata::typed(ControlType::Gain).with_range(-100.0, 10.0);

        let err = coerce_value(&ControlValue::Number(20.0), Some(&meta)).unwrap_err();
        assert!(err.message.contains("above maximum"));

        let err = coerce_value(&ControlValue::Number(-120.0), Some(&meta)).unwrap_err();
        assert!(err.message.contains("below minimum"));

        assert!(coerce_value(&ControlValue::Number(0.0), Some(&meta)).is_ok());
    }

    #[test]
    fn test_max_length_validation() {
        let meta = ControlMetadata::typed(ControlType::String).with_max_length(4);
        let err = coerce_value(&ControlValue::from("too long"), Some(&meta)).unwrap_err();
        assert!(err.message.contains("too long"));
    }

    #[test]
    fn test_no_metadata_passes_through() {
        let v = coerce_value(&ControlValue::from("anything"), None).unwrap();
        assert_eq!(v, ControlValue::String("anything".to_string()));
    }

    #[test]
    fn test_normalize_read_boolean_forms() {
        let meta = ControlMetadata::typed(ControlType::Mute);

        for raw in [
            serde_json::json!(true),
            serde_json::json!(1),
            serde_json::json!("true"),
        ] {
            let (value, display) = normalize_read(&raw, Some(&meta));
            assert_eq!(value, ControlValue::Number(1.0));
            assert_eq!(display, "true");
        }

        let (value, display) = normalize_read(&serde_json::json!(0), Some(&meta));
        assert_eq!(value, ControlValue::Number(0.0));
        assert_eq!(display, "false");
    }

    #[test]
    fn test_wire_form_of_bool() {
        assert_eq!(ControlValue::Bool(true).to_wire(), serde_json::json!(1));
        assert_eq!(ControlValue::Bool(false).to_wire(), serde_json::json!(0));
    }
}

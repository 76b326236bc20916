//! Component model and the discovery index.
//!
//! The index caches the component/control tree reported by the core. It
//! has a single writer (discovery or an explicit refresh) and many
//! readers; lookups never block discovery.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::core::control::{ControlMetadata, ControlPath, ControlType};

/// A named property on a component (opaque name/value pair).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentProperty {
    /// Property name.
    #[serde(rename = "Name")]
    pub name: String,

    /// Property value (opaque string).
    #[serde(rename = "Value")]
    pub value: String,
}

/// A component reported by discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    /// Component name (unique within a design).
    #[serde(rename = "Name")]
    pub name: String,

    /// Component type, e.g. `mixer`, `gain`, `Status Combiner`.
    #[serde(rename = "Type")]
    pub component_type: String,

    /// Ordered property list.
    #[serde(rename = "Properties", default)]
    pub properties: Vec<ComponentProperty>,
}

/// A control discovered on a component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlInfo {
    /// Control name within the component.
    pub name: String,

    /// Discovered metadata (type, range, length).
    pub metadata: ControlMetadata,

    /// Direction as reported (`Read`, `Write`, `Read/Write`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
}

impl ControlInfo {
    /// Create a control entry with just a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            metadata: ControlMetadata::default(),
            direction: None,
        }
    }

    /// Create a typed control entry.
    pub fn typed(name: impl Into<String>, control_type: ControlType) -> Self {
        Self {
            name: name.into(),
            metadata: ControlMetadata::typed(control_type),
            direction: None,
        }
    }

    /// Set the metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: ControlMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Cached entry for one component.
#[derive(Debug, Clone)]
struct IndexedComponent {
    component: Component,
    controls: Vec<ControlInfo>,
}

/// Component/control index built from discovery responses.
///
/// Keyed by component name. Controls for a component are populated
/// lazily, the first time they are fetched.
#[derive(Debug, Default)]
pub struct ComponentIndex {
    components: DashMap<String, IndexedComponent>,
}

impl ComponentIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the component list from a fresh discovery pass.
    ///
    /// Control lists for components that survive are preserved so a
    /// re-discovery does not drop cached metadata.
    pub fn replace_components(&self, components: Vec<Component>) {
        let mut retained: Vec<(String, Vec<ControlInfo>)> = Vec::new();
        for entry in self.components.iter() {
            if components.iter().any(|c| c.name == *entry.key()) {
                retained.push((entry.key().clone(), entry.value().controls.clone()));
            }
        }
        self.components.clear();
        for component in components {
            let name = component.name.clone();
            let controls = retained
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, c)| c.clone())
                .unwrap_or_default();
            self.components
                .insert(name, IndexedComponent { component, controls });
        }
    }

    /// Store the control list for a component.
    pub fn set_controls(&self, component_name: &str, controls: Vec<ControlInfo>) {
        if let Some(mut entry) = self.components.get_mut(component_name) {
            entry.controls = controls;
        } else {
            // Controls observed before the component was discovered.
            self.components.insert(
                component_name.to_string(),
                IndexedComponent {
                    component: Component {
                        name: component_name.to_string(),
                        component_type: String::new(),
                        properties: Vec::new(),
                    },
                    controls,
                },
            );
        }
    }

    /// All known components, sorted by name.
    pub fn components(&self) -> Vec<Component> {
        let mut out: Vec<Component> = self
            .components
            .iter()
            .map(|e| e.value().component.clone())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Look up one component.
    pub fn component(&self, name: &str) -> Option<Component> {
        self.components.get(name).map(|e| e.value().component.clone())
    }

    /// Whether a component is known.
    #[inline]
    pub fn has_component(&self, name: &str) -> bool {
        self.components.contains_key(name)
    }

    /// The cached controls for a component, if fetched.
    pub fn controls(&self, component_name: &str) -> Option<Vec<ControlInfo>> {
        self.components.get(component_name).and_then(|e| {
            if e.value().controls.is_empty() {
                None
            } else {
                Some(e.value().controls.clone())
            }
        })
    }

    /// Metadata for one control path, if discovered.
    ///
    /// Named (global) controls carry no cached metadata.
    pub fn control_metadata(&self, path: &ControlPath) -> Option<ControlMetadata> {
        let component = path.component.as_deref()?;
        let entry = self.components.get(component)?;
        entry
            .value()
            .controls
            .iter()
            .find(|c| c.name == path.control)
            .map(|c| c.metadata.clone())
    }

    /// Whether a control path resolves against the index.
    ///
    /// Named controls and components whose controls have not been
    /// fetched yet resolve optimistically; only a known component with a
    /// fetched control list can refute a path.
    pub fn resolves(&self, path: &ControlPath) -> bool {
        let Some(component) = path.component.as_deref() else {
            return true;
        };
        let Some(entry) = self.components.get(component) else {
            return self.components.is_empty();
        };
        let controls = &entry.value().controls;
        controls.is_empty() || controls.iter().any(|c| c.name == path.control)
    }

    /// Number of indexed components.
    pub fn len(&self) -> usize {
        self.components.len()
    }

    /// Whether the index is empty (no discovery yet).
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Drop everything (used on disconnect when the design may change).
    pub fn clear(&self) {
        self.components.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_component(name: &str) -> Component {
        Component {
            name: name.to_string(),
            component_type: "mixer".to_string(),
            properties: vec![ComponentProperty {
                name: "channels".to_string(),
                value: "8".to_string(),
            }],
        }
    }

    #[test]
    fn test_replace_preserves_controls() {
        let index = ComponentIndex::new();
        index.replace_components(vec![sample_component("Mixer")]);
        index.set_controls("Mixer", vec![ControlInfo::typed("gain", ControlType::Gain)]);

        index.replace_components(vec![sample_component("Mixer"), sample_component("Amp")]);

        assert_eq!(index.len(), 2);
        assert!(index.controls("Mixer").is_some());
        assert!(index.controls("Amp").is_none());
    }

    #[test]
    fn test_metadata_lookup() {
        let index = ComponentIndex::new();
        index.replace_components(vec![sample_component("Mixer")]);
        index.set_controls(
            "Mixer",
            vec![ControlInfo::typed("gain", ControlType::Gain)
                .with_metadata(ControlMetadata::typed(ControlType::Gain).with_range(-100.0, 10.0))],
        );

        let path = ControlPath::parse("Mixer.gain").unwrap();
        let meta = index.control_metadata(&path).unwrap();
        assert_eq!(meta.max, Some(10.0));

        let missing = ControlPath::parse("Mixer.pan").unwrap();
        assert!(index.control_metadata(&missing).is_none());
    }

    #[test]
    fn test_resolution() {
        let index = ComponentIndex::new();

        // Empty index: everything resolves optimistically.
        assert!(index.resolves(&ControlPath::parse("Mixer.gain").unwrap()));

        index.replace_components(vec![sample_component("Mixer")]);
        index.set_controls("Mixer", vec![ControlInfo::named("gain")]);

        assert!(index.resolves(&ControlPath::parse("Mixer.gain").unwrap()));
        assert!(!index.resolves(&ControlPath::parse("Mixer.pan").unwrap()));
        assert!(!index.resolves(&ControlPath::parse("Ghost.gain").unwrap()));
        // Named controls always resolve.
        assert!(index.resolves(&ControlPath::parse("masterVolume").unwrap()));
    }
}

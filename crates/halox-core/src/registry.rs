// ── Entity registry ──
//
// Routing tables from controller identifiers to devices, built once per
// session from the structure file and read-only afterwards. Shared via
// Arc; rebuilt (and republished) after every reconnect.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::model::{Device, Identifier};

/// Raw structure-file control entry. Anything that fails to parse into
/// this shape is logged and skipped; the session carries on without it.
#[derive(Debug, Deserialize)]
struct ControlEntry {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "uuidAction")]
    uuid_action: String,
    #[serde(default)]
    states: HashMap<String, serde_json::Value>,
}

/// Identifier → device lookup tables.
///
/// Every device appears in the action table exactly once; every state
/// identifier a device lists appears in the state table exactly once and
/// points back to that device.
#[derive(Debug, Default)]
pub struct EntityRegistry {
    devices: Vec<Arc<Device>>,
    state_to_device: HashMap<Identifier, Arc<Device>>,
    action_to_device: HashMap<Identifier, Arc<Device>>,
}

impl EntityRegistry {
    /// Build from the structure file's top-level `controls` object.
    pub fn from_structure(structure: &serde_json::Value) -> Self {
        let mut registry = Self::default();

        let Some(controls) = structure.get("controls").and_then(|c| c.as_object()) else {
            warn!("structure file carries no controls object");
            return registry;
        };

        for (raw_id, entry) in controls {
            match parse_control(raw_id, entry) {
                Ok(device) => registry.insert(Arc::new(device)),
                Err(reason) => warn!(control = %raw_id, %reason, "skipping unparseable control"),
            }
        }

        debug!(
            devices = registry.devices.len(),
            states = registry.state_to_device.len(),
            "entity registry built"
        );
        registry
    }

    fn insert(&mut self, device: Arc<Device>) {
        for state_id in device.states.values() {
            self.state_to_device.insert(*state_id, Arc::clone(&device));
        }
        self.action_to_device
            .insert(device.action_id, Arc::clone(&device));
        self.devices.push(device);
    }

    /// Resolve an incoming state identifier. Used on every state frame.
    pub fn device_for_state(&self, id: &Identifier) -> Option<&Arc<Device>> {
        self.state_to_device.get(id)
    }

    /// Resolve a bus action identifier. Used on every inbound command.
    pub fn device_for_action(&self, id: &Identifier) -> Option<&Arc<Device>> {
        self.action_to_device.get(id)
    }

    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

fn parse_control(raw_id: &str, entry: &serde_json::Value) -> Result<Device, String> {
    let id = Identifier::parse(raw_id).map_err(|e| e.to_string())?;
    let entry: ControlEntry = serde_json::from_value(entry.clone()).map_err(|e| e.to_string())?;
    let action_id = Identifier::parse(&entry.uuid_action).map_err(|e| e.to_string())?;

    let mut states = HashMap::new();
    for (state_name, value) in entry.states {
        // Some control types reference state arrays; only scalar
        // identifiers participate in routing.
        let Some(raw) = value.as_str() else {
            debug!(state = %state_name, "ignoring non-scalar state reference");
            continue;
        };
        match Identifier::parse(raw) {
            Ok(state_id) => {
                states.insert(state_name, state_id);
            }
            Err(e) => warn!(state = %state_name, error = %e, "invalid state identifier"),
        }
    }

    Ok(Device {
        id,
        name: entry.name,
        kind: entry.kind,
        action_id,
        states,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn structure() -> serde_json::Value {
        json!({
            "controls": {
                "10000000-0000-0000-0000000000000001": {
                    "name": "Kitchen Light",
                    "type": "Switch",
                    "uuidAction": "20000000-0000-0000-0000000000000001",
                    "states": { "active": "30000000-0000-0000-0000000000000001" }
                },
                "10000000-0000-0000-0000000000000002": {
                    "name": "Hall Light",
                    "type": "Switch",
                    "uuidAction": "20000000-0000-0000-0000000000000002",
                    "states": {
                        "active": "30000000-0000-0000-0000000000000002",
                        "locked": "30000000-0000-0000-0000000000000003"
                    }
                }
            }
        })
    }

    #[test]
    fn builds_both_routing_tables() {
        let registry = EntityRegistry::from_structure(&structure());
        assert_eq!(registry.len(), 2);

        let action = Identifier::parse("20000000-0000-0000-0000000000000001").unwrap();
        let device = registry.device_for_action(&action).unwrap();
        assert_eq!(device.name, "Kitchen Light");

        let state = Identifier::parse("30000000-0000-0000-0000000000000003").unwrap();
        let device = registry.device_for_state(&state).unwrap();
        assert_eq!(device.name, "Hall Light");
    }

    #[test]
    fn every_state_points_back_to_its_device() {
        let registry = EntityRegistry::from_structure(&structure());
        for device in registry.devices() {
            for state_id in device.states.values() {
                let found = registry.device_for_state(state_id).unwrap();
                assert_eq!(found.id, device.id);
            }
            let found = registry.device_for_action(&device.action_id).unwrap();
            assert_eq!(found.id, device.id);
        }
    }

    #[test]
    fn unparseable_controls_are_skipped() {
        let structure = json!({
            "controls": {
                "not-an-identifier": {
                    "name": "Broken",
                    "type": "Switch",
                    "uuidAction": "20000000-0000-0000-0000000000000009",
                    "states": {}
                },
                "10000000-0000-0000-0000000000000001": {
                    "name": "Missing action"
                },
                "10000000-0000-0000-0000000000000002": {
                    "name": "Good",
                    "type": "Switch",
                    "uuidAction": "20000000-0000-0000-0000000000000002",
                    "states": {}
                }
            }
        });

        let registry = EntityRegistry::from_structure(&structure);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.devices()[0].name, "Good");
    }

    #[test]
    fn non_scalar_state_references_are_ignored() {
        let structure = json!({
            "controls": {
                "10000000-0000-0000-0000000000000001": {
                    "name": "Jalousie",
                    "type": "Jalousie",
                    "uuidAction": "20000000-0000-0000-0000000000000001",
                    "states": {
                        "active": "30000000-0000-0000-0000000000000001",
                        "infoText": ["not", "a", "reference"]
                    }
                }
            }
        });

        let registry = EntityRegistry::from_structure(&structure);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.devices()[0].states.len(), 1);
    }

    #[test]
    fn missing_controls_object_yields_an_empty_registry() {
        let registry = EntityRegistry::from_structure(&json!({ "rooms": {} }));
        assert!(registry.is_empty());
    }
}

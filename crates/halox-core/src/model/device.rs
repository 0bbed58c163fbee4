use std::collections::HashMap;

use crate::model::Identifier;

/// Bus payload meaning "switch on". The state parser's fixed six-digit
/// formatting guarantees these literals match.
pub const PAYLOAD_ON: &str = "1.000000";
/// Bus payload meaning "switch off".
pub const PAYLOAD_OFF: &str = "0.000000";

/// One logical device from the controller's structure file.
///
/// Immutable after construction. The action identifier is distinct from
/// the device identifier; states map channel names (e.g. `active`) to
/// their own identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: Identifier,
    pub name: String,
    pub kind: String,
    pub action_id: Identifier,
    pub states: HashMap<String, Identifier>,
}

impl Device {
    /// Translate a bus payload into the outbound control URL.
    ///
    /// Only the two switch literals are recognised; anything else is
    /// rejected rather than producing a verb-less URL.
    pub fn switch_command(&self, payload: &str) -> Option<String> {
        let verb = match payload {
            PAYLOAD_ON => "On",
            PAYLOAD_OFF => "Off",
            _ => return None,
        };
        Some(format!(
            "jdev/sps/io/{}/{verb}",
            self.action_id.to_controller_string()
        ))
    }

    /// The Home-Assistant MQTT-switch YAML block for this device, as
    /// printed by `--print-hass`.
    pub fn hass_switch_yaml(&self) -> String {
        let mut out = format!(
            "  - platform: mqtt\n    name: {}\n    command_topic: \"loxone/{}/action\"\n    unique_id: {}\n",
            self.name, self.action_id, self.id
        );
        if let Some(active) = self.states.get("active") {
            out.push_str(&format!("    state_topic: \"loxone/{active}/state\"\n"));
            out.push_str(&format!(
                "    payload_on: \"{PAYLOAD_ON}\"\n    payload_off: \"{PAYLOAD_OFF}\"\n"
            ));
        }
        out.push('\n');
        out
    }
}

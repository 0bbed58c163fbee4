// ── Binary state decoding ──
//
// Both broadcast kinds are packed streams with no per-record framing.
// Value states are fixed 24-byte records; text states are variable
// length and 4-byte aligned between records.

use tracing::{trace, warn};

use crate::model::{Identifier, PACKED_LEN};
use crate::registry::EntityRegistry;

/// One decoded, registry-matched state change, ready for the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateUpdate {
    pub id: Identifier,
    pub value: String,
}

const VALUE_RECORD_LEN: usize = 24;

/// packed identifier + icon identifier + u32 text length
const TEXT_HEADER_LEN: usize = 36;

/// Render a value with exactly six fractional digits. The switch mapping
/// compares against the literals `1.000000` and `0.000000`, so the
/// format is load-bearing.
pub fn format_value(value: f64) -> String {
    format!("{value:.6}")
}

/// Decode a value-state payload: repeated records of a packed identifier
/// followed by a little-endian IEEE-754 double.
///
/// Identifiers missing from the registry are dropped silently.
pub fn parse_value_states(payload: &[u8], registry: &EntityRegistry) -> Vec<StateUpdate> {
    let mut updates = Vec::new();
    let mut pos = 0;

    while pos + VALUE_RECORD_LEN <= payload.len() {
        let id = read_identifier(&payload[pos..]);

        let mut raw = [0u8; 8];
        raw.copy_from_slice(&payload[pos + PACKED_LEN..pos + VALUE_RECORD_LEN]);
        let value = f64::from_bits(u64::from_le_bytes(raw));
        pos += VALUE_RECORD_LEN;

        trace!(%id, value, "value state");
        if registry.device_for_state(&id).is_some() {
            updates.push(StateUpdate {
                id,
                value: format_value(value),
            });
        }
    }

    if pos != payload.len() {
        warn!(
            trailing = payload.len() - pos,
            "value-state payload ends mid-record"
        );
    }
    updates
}

/// Decode a text-state payload: packed identifier, 16 icon bytes
/// (ignored), little-endian text length, UTF-8 text, then alignment to
/// the next 4-byte boundary.
pub fn parse_text_states(payload: &[u8], registry: &EntityRegistry) -> Vec<StateUpdate> {
    let mut updates = Vec::new();
    let mut pos = 0;

    while pos + TEXT_HEADER_LEN <= payload.len() {
        let id = read_identifier(&payload[pos..]);

        let mut raw = [0u8; 4];
        raw.copy_from_slice(&payload[pos + 32..pos + TEXT_HEADER_LEN]);
        let text_len = u32::from_le_bytes(raw) as usize;
        pos += TEXT_HEADER_LEN;

        if pos + text_len > payload.len() {
            warn!(%id, text_len, "text-state record overruns the payload");
            break;
        }
        let value = String::from_utf8_lossy(&payload[pos..pos + text_len]).into_owned();
        pos += text_len;
        pos += (4 - pos % 4) % 4;

        trace!(%id, %value, "text state");
        if registry.device_for_state(&id).is_some() {
            updates.push(StateUpdate { id, value });
        }
    }
    updates
}

fn read_identifier(record: &[u8]) -> Identifier {
    let mut packed = [0u8; PACKED_LEN];
    packed.copy_from_slice(&record[..PACKED_LEN]);
    Identifier::from_packed(&packed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Registry with one device whose `active` state is the identifier
    /// that packs to `00 11 22 ... FF`.
    fn registry() -> EntityRegistry {
        EntityRegistry::from_structure(&json!({
            "controls": {
                "10000000-0000-0000-0000000000000001": {
                    "name": "Kitchen Light",
                    "type": "Switch",
                    "uuidAction": "20000000-0000-0000-0000000000000001",
                    "states": { "active": "33221100-5544-7766-8899aabbccddeeff" }
                }
            }
        }))
    }

    const PACKED_ID: [u8; 16] = [
        0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, //
        0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF,
    ];

    fn value_record(id: &[u8; 16], value: f64) -> Vec<u8> {
        let mut record = id.to_vec();
        record.extend_from_slice(&value.to_bits().to_le_bytes());
        record
    }

    fn text_record(id: &[u8; 16], text: &str) -> Vec<u8> {
        let mut record = id.to_vec();
        record.extend_from_slice(&[0u8; 16]); // icon identifier, ignored
        record.extend_from_slice(&(text.len() as u32).to_le_bytes());
        record.extend_from_slice(text.as_bytes());
        while record.len() % 4 != 0 {
            record.push(0);
        }
        record
    }

    #[test]
    fn six_digit_formatting() {
        assert_eq!(format_value(1.0), "1.000000");
        assert_eq!(format_value(0.0), "0.000000");
        assert_eq!(format_value(21.5), "21.500000");
        assert_eq!(format_value(-3.25), "-3.250000");
    }

    #[test]
    fn decodes_a_registered_value_state() {
        let payload = value_record(&PACKED_ID, 1.0);
        let updates = parse_value_states(&payload, &registry());

        assert_eq!(updates.len(), 1);
        assert_eq!(
            updates[0].id.to_string(),
            "33221100-5544-7766-8899-aabbccddeeff"
        );
        assert_eq!(updates[0].value, "1.000000");
    }

    #[test]
    fn drops_unregistered_value_states() {
        let mut unknown = PACKED_ID;
        unknown[15] = 0x00;

        let mut payload = value_record(&unknown, 1.0);
        payload.extend(value_record(&PACKED_ID, 0.0));

        let updates = parse_value_states(&payload, &registry());
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].value, "0.000000");
    }

    #[test]
    fn tolerates_a_truncated_value_record() {
        let mut payload = value_record(&PACKED_ID, 1.0);
        payload.extend_from_slice(&[0u8; 7]);

        let updates = parse_value_states(&payload, &registry());
        assert_eq!(updates.len(), 1);
    }

    #[test]
    fn text_records_align_to_four_bytes() {
        // "abc" pads one byte; a second record must parse right after.
        let mut payload = text_record(&PACKED_ID, "abc");
        assert_eq!(payload.len() % 4, 0);
        payload.extend(text_record(&PACKED_ID, "defgh"));

        let updates = parse_text_states(&payload, &registry());
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].value, "abc");
        assert_eq!(updates[1].value, "defgh");
    }

    #[test]
    fn aligned_text_needs_no_padding() {
        // A 4-byte text lands on the boundary already.
        let mut payload = text_record(&PACKED_ID, "abcd");
        payload.extend(text_record(&PACKED_ID, "x"));

        let updates = parse_text_states(&payload, &registry());
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].value, "abcd");
        assert_eq!(updates[1].value, "x");
    }

    #[test]
    fn drops_unregistered_text_states() {
        let mut unknown = PACKED_ID;
        unknown[0] = 0xEE;
        let payload = text_record(&unknown, "abc");

        assert!(parse_text_states(&payload, &registry()).is_empty());
    }

    #[test]
    fn abandons_a_text_record_that_overruns() {
        let mut payload = PACKED_ID.to_vec();
        payload.extend_from_slice(&[0u8; 16]);
        payload.extend_from_slice(&1000u32.to_le_bytes());
        payload.extend_from_slice(b"short");

        assert!(parse_text_states(&payload, &registry()).is_empty());
    }
}

//! Legacy attendance document shapes
//!
//! Older attendance documents stored PT days without an activity prefix
//! (`monday`..`friday`), a bare `lab`/`tactics` field, and a handful of status
//! spellings from earlier roster versions. Reads normalize those in memory;
//! the backing store is never rewritten.

use serde_json::Value;

use crate::model::{Fields, Slot, Status};

/// Old field name -> current slot.
const LEGACY_FIELDS: [(&str, Slot); 7] = [
    ("monday", Slot::PtMonday),
    ("tuesday", Slot::PtTuesday),
    ("wednesday", Slot::PtWednesday),
    ("thursday", Slot::PtThursday),
    ("friday", Slot::PtFriday),
    ("lab", Slot::LabThursday),
    ("tactics", Slot::TacticsTuesday),
];

/// Return a copy of `raw` with current slot fields populated from legacy
/// fields where the current field is absent. Current fields always win.
pub fn normalize_attendance(raw: &Fields) -> Fields {
    let mut fields = raw.clone();

    for (old, slot) in LEGACY_FIELDS {
        if fields.contains_key(slot.field_name()) {
            continue;
        }
        if let Some(value) = raw.get(old) {
            fields.insert(slot.field_name().to_string(), value.clone());
        }
    }

    for slot in Slot::ALL {
        if let Some(value) = fields.get_mut(slot.field_name()) {
            if let Some(status) = legacy_status(value) {
                *value = Value::String(status.as_str().to_string());
            }
        }
    }

    fields
}

/// True if the document carries any legacy slot field.
pub fn is_legacy(raw: &Fields) -> bool {
    LEGACY_FIELDS.iter().any(|(old, _)| raw.contains_key(*old))
}

/// Map legacy status encodings onto the tri-state. Canonical strings and
/// unrecognized values are left alone so the record parser can judge them.
fn legacy_status(value: &Value) -> Option<Status> {
    match value {
        Value::Null => Some(Status::Unset),
        Value::Bool(true) => Some(Status::Present),
        Value::Bool(false) => Some(Status::Unexcused),
        Value::String(s) => match s.trim() {
            "" => Some(Status::Unset),
            "P" | "p" | "Present" => Some(Status::Present),
            "E" | "e" | "Excused" => Some(Status::Excused),
            "U" | "u" | "Unexcused" | "absent" => Some(Status::Unexcused),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(v: Value) -> Fields {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_legacy_fields_renamed() {
        let raw = fields(json!({
            "cadetId": "1",
            "weekStartDate": "2026-01-19",
            "monday": "present",
            "lab": "E",
        }));
        assert!(is_legacy(&raw));

        let normalized = normalize_attendance(&raw);
        assert_eq!(normalized["ptMonday"], json!("present"));
        assert_eq!(normalized["labThursday"], json!("excused"));
        // the raw input is untouched
        assert!(!raw.contains_key("ptMonday"));
    }

    #[test]
    fn test_current_fields_win() {
        let raw = fields(json!({"friday": "present", "ptFriday": "unexcused"}));
        let normalized = normalize_attendance(&raw);
        assert_eq!(normalized["ptFriday"], json!("unexcused"));
    }

    #[test]
    fn test_legacy_status_spellings() {
        let raw = fields(json!({
            "ptMonday": null,
            "ptTuesday": "",
            "ptWednesday": true,
            "ptThursday": "U",
            "ptFriday": "late",
        }));
        let normalized = normalize_attendance(&raw);
        assert_eq!(normalized["ptMonday"], json!("unset"));
        assert_eq!(normalized["ptTuesday"], json!("unset"));
        assert_eq!(normalized["ptWednesday"], json!("present"));
        assert_eq!(normalized["ptThursday"], json!("unexcused"));
        assert_eq!(normalized["ptFriday"], json!("late"));
        assert!(!is_legacy(&raw));
    }
}

//! Attendance data model
//!
//! One [`AttendanceRecord`] exists per (week, cadet). Its identity is the
//! deterministic document key `"{weekStartDate}_{cadetId}"`, so records are
//! addressable without a lookup and a missing record simply means "all unset".
//!
//! ```text
//!            Mon        Tue             Wed        Thu           Fri
//!   PT    ptMonday   ptTuesday     ptWednesday  ptThursday    ptFriday
//!   Lab                                          labThursday
//!   Tac              tacticsTuesday
//! ```

use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, warn};

use crate::error::{Result, RosterError};
use crate::migrate;

/// Raw document body as held by the remote store and the local cache.
pub type Fields = Map<String, Value>;

/// Current (reconciled) attendance for a scope, one entry per cadet.
pub type AttendanceMap = BTreeMap<CadetId, AttendanceRecord>;

pub const FIELD_CADET_ID: &str = "cadetId";
pub const FIELD_WEEK_START: &str = "weekStartDate";
pub const FIELD_COMPANY: &str = "company";

const DATE_FORMAT: &str = "%Y-%m-%d";

// ============================================================================
// Collections and documents
// ============================================================================

/// Named collections of the remote document store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Collection {
    Attendance,
    Cadets,
    TrainingEvents,
    PtPlans,
}

impl Collection {
    pub const ALL: [Collection; 4] = [
        Collection::Attendance,
        Collection::Cadets,
        Collection::TrainingEvents,
        Collection::PtPlans,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Attendance => "attendance",
            Collection::Cadets => "cadets",
            Collection::TrainingEvents => "trainingEvents",
            Collection::PtPlans => "ptPlans",
        }
    }

    pub fn parse(name: &str) -> Option<Collection> {
        Collection::ALL.into_iter().find(|c| c.as_str() == name)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A keyed document from the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub key: String,
    pub fields: Fields,
}

impl Document {
    pub fn new(key: impl Into<String>, fields: Fields) -> Self {
        Self {
            key: key.into(),
            fields,
        }
    }
}

// ============================================================================
// Identity
// ============================================================================

/// Opaque reference to a cadet entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CadetId(pub String);

impl CadetId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CadetId {
    fn from(s: &str) -> Self {
        CadetId(s.to_string())
    }
}

impl From<String> for CadetId {
    fn from(s: String) -> Self {
        CadetId(s)
    }
}

impl fmt::Display for CadetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Document key for an attendance record.
pub fn record_key(week_start: NaiveDate, cadet_id: &CadetId) -> String {
    format!("{}_{}", format_date(week_start), cadet_id)
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, DATE_FORMAT).ok()
}

/// Monday of the week containing `date`.
pub fn week_start_of(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_monday() as i64)
}

/// Reject week buckets that do not start on a Monday.
pub fn ensure_week_start(date: NaiveDate) -> Result<NaiveDate> {
    if date.weekday() == chrono::Weekday::Mon {
        Ok(date)
    } else {
        Err(RosterError::InvalidWeek(date))
    }
}

// ============================================================================
// Slots
// ============================================================================

/// Tri-state attendance status (plus "nothing recorded yet").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Present,
    Excused,
    Unexcused,
    #[default]
    Unset,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Present => "present",
            Status::Excused => "excused",
            Status::Unexcused => "unexcused",
            Status::Unset => "unset",
        }
    }

    pub fn parse(s: &str) -> Option<Status> {
        match s {
            "present" => Some(Status::Present),
            "excused" => Some(Status::Excused),
            "unexcused" => Some(Status::Unexcused),
            "unset" => Some(Status::Unset),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Weekday {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
}

impl Weekday {
    pub const ALL: [Weekday; 5] = [
        Weekday::Monday,
        Weekday::Tuesday,
        Weekday::Wednesday,
        Weekday::Thursday,
        Weekday::Friday,
    ];

    /// Days after the week's Monday.
    pub fn offset(&self) -> i64 {
        match self {
            Weekday::Monday => 0,
            Weekday::Tuesday => 1,
            Weekday::Wednesday => 2,
            Weekday::Thursday => 3,
            Weekday::Friday => 4,
        }
    }
}

impl fmt::Display for Weekday {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityType {
    Pt,
    Lab,
    Tactics,
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActivityType::Pt => "PT",
            ActivityType::Lab => "lab",
            ActivityType::Tactics => "tactics",
        };
        f.write_str(name)
    }
}

/// One (day, activity) field of an attendance record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Slot {
    PtMonday,
    PtTuesday,
    PtWednesday,
    PtThursday,
    PtFriday,
    LabThursday,
    TacticsTuesday,
}

pub const SLOT_COUNT: usize = 7;

impl Slot {
    pub const ALL: [Slot; SLOT_COUNT] = [
        Slot::PtMonday,
        Slot::PtTuesday,
        Slot::PtWednesday,
        Slot::PtThursday,
        Slot::PtFriday,
        Slot::LabThursday,
        Slot::TacticsTuesday,
    ];

    /// Map an editor's (activity, day) selection onto a slot.
    pub fn resolve(activity: ActivityType, day: Weekday) -> Result<Slot> {
        let slot = match (activity, day) {
            (ActivityType::Pt, Weekday::Monday) => Slot::PtMonday,
            (ActivityType::Pt, Weekday::Tuesday) => Slot::PtTuesday,
            (ActivityType::Pt, Weekday::Wednesday) => Slot::PtWednesday,
            (ActivityType::Pt, Weekday::Thursday) => Slot::PtThursday,
            (ActivityType::Pt, Weekday::Friday) => Slot::PtFriday,
            (ActivityType::Lab, Weekday::Thursday) => Slot::LabThursday,
            (ActivityType::Tactics, Weekday::Tuesday) => Slot::TacticsTuesday,
            _ => return Err(RosterError::InvalidSlot { activity, day }),
        };
        Ok(slot)
    }

    pub fn field_name(&self) -> &'static str {
        match self {
            Slot::PtMonday => "ptMonday",
            Slot::PtTuesday => "ptTuesday",
            Slot::PtWednesday => "ptWednesday",
            Slot::PtThursday => "ptThursday",
            Slot::PtFriday => "ptFriday",
            Slot::LabThursday => "labThursday",
            Slot::TacticsTuesday => "tacticsTuesday",
        }
    }

    pub fn from_field(name: &str) -> Option<Slot> {
        Slot::ALL.into_iter().find(|s| s.field_name() == name)
    }

    pub fn activity(&self) -> ActivityType {
        match self {
            Slot::LabThursday => ActivityType::Lab,
            Slot::TacticsTuesday => ActivityType::Tactics,
            _ => ActivityType::Pt,
        }
    }

    pub fn weekday(&self) -> Weekday {
        match self {
            Slot::PtMonday => Weekday::Monday,
            Slot::PtTuesday | Slot::TacticsTuesday => Weekday::Tuesday,
            Slot::PtWednesday => Weekday::Wednesday,
            Slot::PtThursday | Slot::LabThursday => Weekday::Thursday,
            Slot::PtFriday => Weekday::Friday,
        }
    }

    /// Calendar date this slot refers to within the given week.
    pub fn date_in_week(&self, week_start: NaiveDate) -> NaiveDate {
        week_start + Duration::days(self.weekday().offset())
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.field_name())
    }
}

// ============================================================================
// Records
// ============================================================================

/// Attendance for one cadet in one week.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceRecord {
    pub cadet_id: CadetId,
    pub week_start: NaiveDate,
    slots: [Status; SLOT_COUNT],
}

impl AttendanceRecord {
    /// A record with every slot unset; what a missing document means.
    pub fn unset(cadet_id: CadetId, week_start: NaiveDate) -> Self {
        Self {
            cadet_id,
            week_start,
            slots: [Status::Unset; SLOT_COUNT],
        }
    }

    /// Make absence explicit: a persisted record or all-unset defaults.
    pub fn materialize(
        record: Option<AttendanceRecord>,
        cadet_id: &CadetId,
        week_start: NaiveDate,
    ) -> Self {
        record.unwrap_or_else(|| Self::unset(cadet_id.clone(), week_start))
    }

    pub fn key(&self) -> String {
        record_key(self.week_start, &self.cadet_id)
    }

    pub fn get(&self, slot: Slot) -> Status {
        self.slots[slot.index()]
    }

    pub fn set(&mut self, slot: Slot, status: Status) {
        self.slots[slot.index()] = status;
    }

    pub fn with(mut self, slot: Slot, status: Status) -> Self {
        self.set(slot, status);
        self
    }

    pub fn slots(&self) -> impl Iterator<Item = (Slot, Status)> + '_ {
        Slot::ALL.into_iter().map(move |s| (s, self.get(s)))
    }

    pub fn is_unset(&self) -> bool {
        self.slots.iter().all(|s| *s == Status::Unset)
    }

    /// Slots whose status differs from `other`.
    pub fn changed_slots(&self, other: &AttendanceRecord) -> Vec<Slot> {
        Slot::ALL
            .into_iter()
            .filter(|s| self.get(*s) != other.get(*s))
            .collect()
    }

    /// Full document body: identity fields plus every slot.
    pub fn to_fields(&self) -> Fields {
        let mut fields = Map::new();
        fields.insert(
            FIELD_CADET_ID.to_string(),
            Value::String(self.cadet_id.0.clone()),
        );
        fields.insert(
            FIELD_WEEK_START.to_string(),
            Value::String(format_date(self.week_start)),
        );
        for (slot, status) in self.slots() {
            fields.insert(
                slot.field_name().to_string(),
                Value::String(status.as_str().to_string()),
            );
        }
        fields
    }

    /// Parse a stored document, normalizing legacy field shapes first.
    pub fn from_document(doc: &Document) -> Result<Self> {
        if migrate::is_legacy(&doc.fields) {
            debug!(key = %doc.key, "Normalizing legacy attendance document");
        }
        let fields = migrate::normalize_attendance(&doc.fields);
        let invalid = |reason: String| RosterError::InvalidDocument {
            key: doc.key.clone(),
            reason,
        };

        let cadet_id = match fields.get(FIELD_CADET_ID) {
            Some(Value::String(s)) => CadetId(s.clone()),
            Some(Value::Number(n)) => CadetId(n.to_string()),
            _ => return Err(invalid("missing cadetId".to_string())),
        };
        let week_start = fields
            .get(FIELD_WEEK_START)
            .and_then(Value::as_str)
            .and_then(parse_date)
            .ok_or_else(|| invalid("missing or malformed weekStartDate".to_string()))?;

        let mut record = Self::unset(cadet_id, week_start);
        for slot in Slot::ALL {
            match fields.get(slot.field_name()) {
                None | Some(Value::Null) => {}
                Some(Value::String(s)) => {
                    let status = Status::parse(s)
                        .ok_or_else(|| invalid(format!("unknown status {:?} in {}", s, slot)))?;
                    record.set(slot, status);
                }
                Some(other) => {
                    return Err(invalid(format!("unexpected value {} in {}", other, slot)));
                }
            }
        }
        Ok(record)
    }
}

/// Build the attendance map for a set of cadets from raw week documents.
///
/// Every cadet gets an entry; cadets without a stored record are
/// materialized as all-unset. Documents for other cadets or other weeks are
/// ignored, and unparseable documents are logged and treated as absent.
pub fn materialize_week(
    cadets: &BTreeSet<CadetId>,
    week_start: NaiveDate,
    documents: &[Document],
) -> AttendanceMap {
    let mut stored: BTreeMap<CadetId, AttendanceRecord> = BTreeMap::new();
    for doc in documents {
        match AttendanceRecord::from_document(doc) {
            Ok(record) if record.week_start == week_start && cadets.contains(&record.cadet_id) => {
                stored.insert(record.cadet_id.clone(), record);
            }
            Ok(_) => {}
            Err(e) => warn!(key = %doc.key, error = %e, "Skipping malformed attendance document"),
        }
    }

    cadets
        .iter()
        .map(|id| {
            let record = AttendanceRecord::materialize(stored.remove(id), id, week_start);
            (id.clone(), record)
        })
        .collect()
}

// ============================================================================
// Cadets
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cadet {
    #[serde(skip)]
    pub id: CadetId,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub class_year: Option<u16>,
}

impl Cadet {
    /// Cadet documents are keyed by cadet id.
    pub fn from_document(doc: &Document) -> Result<Self> {
        let mut cadet: Cadet = serde_json::from_value(Value::Object(doc.fields.clone()))
            .map_err(|e| RosterError::InvalidDocument {
                key: doc.key.clone(),
                reason: e.to_string(),
            })?;
        cadet.id = CadetId(doc.key.clone());
        Ok(cadet)
    }

    pub fn to_fields(&self) -> Fields {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

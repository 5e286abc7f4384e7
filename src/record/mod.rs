//! Server side records: named values with alarm state, monitors, and scanning
//!
//! A [`Record`] holds a value of a fixed native type alongside the metadata
//! fields its [`RecordKind`] defines. Fields are reached by name (`"VAL"`,
//! `"EGU"`, `"HIHI"`, ...) through a table built once per kind.
//!
//! Writes mark the record dirty only when they change something. Processing
//! runs the pre-process hooks, evaluates alarm limits, and publishes to every
//! monitor whose mask matches what changed. When processing happens depends
//! on the [`ScanPolicy`]:
//!
//! - [`ScanPolicy::OnChange`] processes as soon as a write (or a whole
//!   [`Record::atomic`] scope) leaves the record dirty.
//! - [`ScanPolicy::Periodic`] processes on a timer, run by the server.
//! - [`ScanPolicy::Passive`] only processes when asked to, or when a client
//!   writes to `VAL`.

mod fields;

use std::{
    fmt::Display,
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant, SystemTime},
};

use thiserror::Error;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    dbr::{
        DBR_CLASS_NAME, Dbr, DbrBasicType, DbrCategory, DbrGraphics, DbrType, DbrValue, Limits,
        Status,
    },
    messages::{ErrorCondition, MonitorMask},
    providers::{MonitorReceiver, MonitorSender, monitor_channel},
};
use fields::{Accessor, FieldDef, field_table};

pub use fields::STATE_FIELDS;

/// The record types that can be created
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Ai = 0,
    Ao = 1,
    Longin = 2,
    Longout = 3,
    Mbbi = 4,
    Stringin = 5,
    Waveform = 6,
}

impl RecordKind {
    pub const ALL: [RecordKind; 7] = [
        RecordKind::Ai,
        RecordKind::Ao,
        RecordKind::Longin,
        RecordKind::Longout,
        RecordKind::Mbbi,
        RecordKind::Stringin,
        RecordKind::Waveform,
    ];

    /// The record type name, as returned to `DBR_CLASS_NAME` requests
    pub fn name(&self) -> &'static str {
        match self {
            RecordKind::Ai => "ai",
            RecordKind::Ao => "ao",
            RecordKind::Longin => "longin",
            RecordKind::Longout => "longout",
            RecordKind::Mbbi => "mbbi",
            RecordKind::Stringin => "stringin",
            RecordKind::Waveform => "waveform",
        }
    }

    /// The type that VAL holds. Waveforms choose theirs on creation.
    pub fn native_type(&self) -> DbrBasicType {
        match self {
            RecordKind::Ai | RecordKind::Ao | RecordKind::Waveform => DbrBasicType::Double,
            RecordKind::Longin | RecordKind::Longout => DbrBasicType::Long,
            RecordKind::Mbbi => DbrBasicType::Enum,
            RecordKind::Stringin => DbrBasicType::String,
        }
    }

    fn is_numeric(&self) -> bool {
        !matches!(self, RecordKind::Mbbi | RecordKind::Stringin)
    }
    fn has_alarm_limits(&self) -> bool {
        matches!(
            self,
            RecordKind::Ai | RecordKind::Ao | RecordKind::Longin | RecordKind::Longout
        )
    }
    fn is_output(&self) -> bool {
        matches!(self, RecordKind::Ao | RecordKind::Longout)
    }
}

impl Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RecordKind {
    type Err = RecordError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecordKind::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| RecordError::UnknownKind(s.to_owned()))
    }
}

/// When a record processes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ScanPolicy {
    /// Only when processed explicitly, or written to by a client
    Passive,
    /// Whenever a write changes the record
    #[default]
    OnChange,
    /// At a fixed period
    Periodic(Duration),
}

/// Alarm conditions, as reported in the STAT field
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i16)]
pub enum AlarmStatus {
    NoAlarm = 0,
    Read = 1,
    Write = 2,
    HiHi = 3,
    High = 4,
    LoLo = 5,
    Low = 6,
    State = 7,
    Comm = 9,
    Timeout = 10,
    Soft = 15,
    Udf = 17,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i16)]
pub enum AlarmSeverity {
    NoAlarm = 0,
    Minor = 1,
    Major = 2,
    Invalid = 3,
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Unknown record type '{0}'")]
    UnknownKind(String),
    #[error("Record {record} has no field {field}")]
    UnknownField { record: String, field: String },
    #[error("Field {record}.{field} is read-only")]
    ReadOnly { record: String, field: String },
    #[error("A record named {0} already exists")]
    AlreadyExists(String),
    #[error("{0}")]
    Value(#[from] ErrorCondition),
}

impl From<RecordError> for ErrorCondition {
    fn from(value: RecordError) -> Self {
        match value {
            RecordError::UnknownField { .. } => ErrorCondition::BadChId,
            RecordError::ReadOnly { .. } => ErrorCondition::NoWtAccess,
            RecordError::Value(condition) => condition,
            RecordError::UnknownKind(_) | RecordError::AlreadyExists(_) => ErrorCondition::Internal,
        }
    }
}

type PreProcessHook = Box<dyn FnMut(&mut RecordUpdate<'_>) + Send>;
type PostProcessHook = Box<dyn FnMut(&RecordUpdate<'_>) + Send>;

struct Monitor {
    accessor: Accessor,
    data_type: DbrType,
    mask: MonitorMask,
    sender: MonitorSender,
}

const NO_EVENTS: MonitorMask = MonitorMask {
    value: false,
    log: false,
    alarm: false,
    property: false,
};

/// Field storage for a record
pub(crate) struct RecordData {
    name: String,
    kind: RecordKind,
    value: DbrValue,
    alarm: Status,
    /// Alarm raised by a hook during this processing pass
    raised: Option<Status>,
    timestamp: SystemTime,
    desc: String,
    egu: String,
    prec: i16,
    hopr: f64,
    lopr: f64,
    /// Alarm limits are only checked when set
    hihi: Option<f64>,
    high: Option<f64>,
    low: Option<f64>,
    lolo: Option<f64>,
    drvh: f64,
    drvl: f64,
    states: Vec<String>,
    nelm: usize,
    scan: ScanPolicy,
    dirty: bool,
    /// Changes since the last publish
    pending: MonitorMask,
    last_processed: Option<Instant>,
    monitors: Vec<Monitor>,
}

impl RecordData {
    fn new(name: &str, kind: RecordKind, value: DbrValue, nelm: usize) -> Self {
        RecordData {
            name: name.to_owned(),
            kind,
            value,
            alarm: Status::default(),
            raised: None,
            timestamp: SystemTime::now(),
            desc: String::new(),
            egu: String::new(),
            prec: 0,
            hopr: 0.0,
            lopr: 0.0,
            hihi: None,
            high: None,
            low: None,
            lolo: None,
            drvh: 0.0,
            drvl: 0.0,
            states: if kind == RecordKind::Mbbi {
                vec![String::new(); STATE_FIELDS.len()]
            } else {
                Vec::new()
            },
            nelm,
            scan: ScanPolicy::default(),
            dirty: false,
            pending: NO_EVENTS,
            last_processed: None,
            monitors: Vec::new(),
        }
    }

    fn field(&self, name: &str) -> Result<&'static FieldDef, RecordError> {
        field_table(self.kind)
            .get(name)
            .ok_or_else(|| RecordError::UnknownField {
                record: self.name.clone(),
                field: name.to_owned(),
            })
    }

    fn write(&mut self, field: &FieldDef, value: &DbrValue) -> Result<(), RecordError> {
        if !field.writable {
            return Err(RecordError::ReadOnly {
                record: self.name.clone(),
                field: field.name.to_owned(),
            });
        }
        if field.accessor.set(self, value)? {
            trace!("{}.{} changed", self.name, field.name);
            self.dirty = true;
            self.pending = self.pending.union(&field.event_mask());
        }
        Ok(())
    }

    fn graphics(&self) -> DbrGraphics {
        match self.kind {
            RecordKind::Mbbi => {
                let used = self
                    .states
                    .iter()
                    .rposition(|s| !s.is_empty())
                    .map_or(0, |i| i + 1);
                DbrGraphics::Enum {
                    labels: self.states[..used].to_vec(),
                }
            }
            RecordKind::Stringin => DbrGraphics::String,
            _ if self.value.get_type() == DbrBasicType::String => DbrGraphics::String,
            _ => DbrGraphics::Numeric {
                units: self.egu.clone(),
                precision: Some(self.prec),
                limits: Limits {
                    display: (self.lopr, self.hopr),
                    alarm: (self.lolo.unwrap_or(0.0), self.hihi.unwrap_or(0.0)),
                    warning: (self.low.unwrap_or(0.0), self.high.unwrap_or(0.0)),
                },
            },
        }
    }

    /// A field value with the metadata a request asks for
    fn snapshot(&self, accessor: Accessor, requested: DbrType) -> Result<Dbr, ErrorCondition> {
        if requested == DBR_CLASS_NAME {
            return Ok(Dbr::ClassName(DbrValue::String(vec![
                self.kind.name().to_owned(),
            ])));
        }
        let value = accessor.get(self);
        let graphics = || {
            if accessor == Accessor::Val {
                self.graphics()
            } else {
                DbrGraphics::default_for(value.get_type())
            }
        };
        let status = self.alarm;
        let native = match requested.category {
            DbrCategory::Basic => Dbr::Basic(value.clone()),
            DbrCategory::Status => Dbr::Status {
                status,
                value: value.clone(),
            },
            DbrCategory::Time | DbrCategory::ClassName => Dbr::Time {
                status,
                timestamp: self.timestamp,
                value: value.clone(),
            },
            DbrCategory::Graphics => Dbr::Graphics {
                status,
                graphics: graphics(),
                value: value.clone(),
            },
            DbrCategory::Control => Dbr::Control {
                status,
                graphics: graphics(),
                control: if self.kind.is_output() {
                    (self.drvl, self.drvh)
                } else {
                    (self.lopr, self.hopr)
                },
                value: value.clone(),
            },
        };
        native.convert_to(requested)
    }

    fn evaluate_alarms(&mut self) {
        let mut alarm = self.raised.take().unwrap_or_default();
        if self.kind.has_alarm_limits()
            && let Some(v) = self.value.as_f64()
        {
            let checks = [
                (self.hihi.is_some_and(|l| v >= l), AlarmStatus::HiHi, AlarmSeverity::Major),
                (self.lolo.is_some_and(|l| v <= l), AlarmStatus::LoLo, AlarmSeverity::Major),
                (self.high.is_some_and(|l| v >= l), AlarmStatus::High, AlarmSeverity::Minor),
                (self.low.is_some_and(|l| v <= l), AlarmStatus::Low, AlarmSeverity::Minor),
            ];
            if let Some((_, status, severity)) = checks.into_iter().find(|(hit, _, _)| *hit)
                && severity as i16 > alarm.severity
            {
                alarm = Status {
                    status: status as i16,
                    severity: severity as i16,
                };
            }
        }
        if alarm != self.alarm {
            debug!(
                "{} alarm: status {} severity {}",
                self.name, alarm.status, alarm.severity
            );
            self.alarm = alarm;
            self.pending = self.pending.union(&MonitorMask::ALARM);
        }
    }

    /// Send the pending changes to every monitor that wants them
    fn publish(&mut self) {
        let events = std::mem::replace(&mut self.pending, NO_EVENTS);
        let mut monitors = std::mem::take(&mut self.monitors);
        monitors.retain(|monitor| {
            if monitor.sender.is_closed() {
                return false;
            }
            if !monitor.mask.intersects(&events) {
                return true;
            }
            match self.snapshot(monitor.accessor, monitor.data_type) {
                Ok(dbr) => monitor.sender.send(dbr),
                Err(e) => {
                    debug!("Could not convert {} for a monitor: {e}", self.name);
                    true
                }
            }
        });
        self.monitors = monitors;
    }
}

struct RecordState {
    data: RecordData,
    pre_process: Vec<PreProcessHook>,
    post_process: Vec<PostProcessHook>,
}

impl RecordState {
    fn process(&mut self) {
        let mut hooks = std::mem::take(&mut self.pre_process);
        for hook in hooks.iter_mut() {
            hook(&mut RecordUpdate {
                data: &mut self.data,
            });
        }
        self.pre_process = hooks;

        self.data.evaluate_alarms();
        self.data.timestamp = SystemTime::now();
        self.data.publish();
        self.data.dirty = false;
        self.data.last_processed = Some(Instant::now());

        let mut hooks = std::mem::take(&mut self.post_process);
        for hook in hooks.iter_mut() {
            hook(&RecordUpdate {
                data: &mut self.data,
            });
        }
        self.post_process = hooks;
    }
}

/// Access to a locked record, inside [`Record::atomic`] or a hook
///
/// Writes here never process the record by themselves.
pub struct RecordUpdate<'a> {
    data: &'a mut RecordData,
}

impl RecordUpdate<'_> {
    pub fn name(&self) -> &str {
        &self.data.name
    }
    pub fn kind(&self) -> RecordKind {
        self.data.kind
    }
    pub fn value(&self) -> &DbrValue {
        &self.data.value
    }
    pub fn set_value(&mut self, value: impl Into<DbrValue>) -> Result<(), RecordError> {
        self.set_field("VAL", value)
    }
    pub fn get_field(&self, field: &str) -> Result<DbrValue, RecordError> {
        Ok(self.data.field(field)?.accessor.get(&*self.data))
    }
    pub fn set_field(
        &mut self,
        field: &str,
        value: impl Into<DbrValue>,
    ) -> Result<(), RecordError> {
        let field = self.data.field(field)?;
        self.data.write(field, &value.into())
    }
    pub fn alarm(&self) -> Status {
        self.data.alarm
    }
    /// Raise an alarm for the next processing pass
    ///
    /// Limit alarms of higher severity still win.
    pub fn raise_alarm(&mut self, status: AlarmStatus, severity: AlarmSeverity) {
        let current = self.data.raised.unwrap_or_default();
        if severity as i16 >= current.severity {
            self.data.raised = Some(Status {
                status: status as i16,
                severity: severity as i16,
            });
            self.data.dirty = true;
        }
    }
}

/// A named process variable, shared between the application and the server
#[derive(Clone)]
pub struct Record {
    name: Arc<str>,
    kind: RecordKind,
    inner: Arc<Mutex<RecordState>>,
}

impl std::fmt::Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Record")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl Record {
    pub fn new(name: &str, kind: RecordKind) -> Record {
        let value = match kind.native_type() {
            DbrBasicType::String => DbrValue::String(vec![String::new()]),
            DbrBasicType::Enum => DbrValue::Enum(0),
            DbrBasicType::Long => DbrValue::Long(vec![0]),
            _ => DbrValue::Double(vec![0.0]),
        };
        Self::with_value(name, kind, value, 1)
    }

    /// A waveform holding up to `length` elements of `element` type
    pub fn new_waveform(name: &str, element: DbrBasicType, length: usize) -> Record {
        let value = DbrValue::Double(Vec::new())
            .convert_to(element)
            .unwrap_or(DbrValue::Double(Vec::new()));
        Self::with_value(name, RecordKind::Waveform, value, length.max(1))
    }

    fn with_value(name: &str, kind: RecordKind, value: DbrValue, nelm: usize) -> Record {
        Record {
            name: name.into(),
            kind,
            inner: Arc::new(Mutex::new(RecordState {
                data: RecordData::new(name, kind, value, nelm),
                pre_process: Vec::new(),
                post_process: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RecordState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_scan(self, scan: ScanPolicy) -> Self {
        self.set_scan(scan);
        self
    }
    pub fn set_scan(&self, scan: ScanPolicy) {
        self.lock().data.scan = scan;
    }
    pub fn scan(&self) -> ScanPolicy {
        self.lock().data.scan
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn kind(&self) -> RecordKind {
        self.kind
    }
    pub fn has_field(&self, field: &str) -> bool {
        field_table(self.kind).contains_key(field)
    }
    pub fn is_writable(&self, field: &str) -> bool {
        field_table(self.kind).get(field).is_some_and(|f| f.writable)
    }

    pub fn value(&self) -> DbrValue {
        self.lock().data.value.clone()
    }
    pub fn set_value(&self, value: impl Into<DbrValue>) -> Result<(), RecordError> {
        self.set_field("VAL", value)
    }
    pub fn get_field(&self, field: &str) -> Result<DbrValue, RecordError> {
        self.atomic(|update| update.get_field(field))
    }
    pub fn set_field(&self, field: &str, value: impl Into<DbrValue>) -> Result<(), RecordError> {
        self.atomic(|update| update.set_field(field, value))
    }
    pub fn alarm(&self) -> Status {
        self.lock().data.alarm
    }
    pub fn is_dirty(&self) -> bool {
        self.lock().data.dirty
    }
    pub fn last_processed(&self) -> Option<Instant> {
        self.lock().data.last_processed
    }

    /// Run `f` before alarms are evaluated, every time the record processes
    pub fn on_pre_process(&self, f: impl FnMut(&mut RecordUpdate<'_>) + Send + 'static) {
        self.lock().pre_process.push(Box::new(f));
    }
    /// Run `f` after monitors have been sent, every time the record processes
    pub fn on_post_process(&self, f: impl FnMut(&RecordUpdate<'_>) + Send + 'static) {
        self.lock().post_process.push(Box::new(f));
    }

    /// Make several changes under one lock, processing at most once
    ///
    /// The record is locked for the duration of `f`; calling methods on this
    /// same record from inside it will deadlock.
    pub fn atomic<R>(&self, f: impl FnOnce(&mut RecordUpdate<'_>) -> R) -> R {
        let mut state = self.lock();
        let result = f(&mut RecordUpdate {
            data: &mut state.data,
        });
        if state.data.dirty && state.data.scan == ScanPolicy::OnChange {
            state.process();
        }
        result
    }

    /// Process now, regardless of scan policy
    pub fn process(&self) {
        self.lock().process();
    }

    /// Read a field with the metadata category requested
    ///
    /// With no requested type, VAL comes back in its native type with a
    /// timestamp; waveforms are padded to their maximum length.
    pub fn read(&self, field: &str, requested: Option<DbrType>) -> Result<Dbr, RecordError> {
        let state = self.lock();
        let data = &state.data;
        let accessor = data.field(field)?.accessor;
        match requested {
            Some(requested) => Ok(data.snapshot(accessor, requested)?),
            None => {
                let mut value = accessor.get(data);
                if accessor == Accessor::Val && data.kind == RecordKind::Waveform {
                    let _ = value.resize(data.nelm);
                }
                Ok(Dbr::Time {
                    status: data.alarm,
                    timestamp: data.timestamp,
                    value,
                })
            }
        }
    }

    /// A write arriving from a client
    ///
    /// Passive records process on every write to VAL.
    pub fn put(&self, field: &str, value: &DbrValue) -> Result<(), RecordError> {
        let mut state = self.lock();
        let def = state.data.field(field)?;
        state.data.write(def, value)?;
        let process = match state.data.scan {
            ScanPolicy::OnChange => state.data.dirty,
            ScanPolicy::Passive => def.accessor == Accessor::Val,
            ScanPolicy::Periodic(_) => false,
        };
        if process {
            state.process();
        }
        Ok(())
    }

    /// Receive a field every time processing changes something in `mask`
    ///
    /// A receiver that falls behind gets the latest updates, not all of them.
    pub fn subscribe(
        &self,
        field: &str,
        data_type: DbrType,
        mask: MonitorMask,
    ) -> Result<MonitorReceiver, RecordError> {
        let mut state = self.lock();
        let accessor = state.data.field(field)?.accessor;
        let (sender, receiver) = monitor_channel();
        state.data.monitors.push(Monitor {
            accessor,
            data_type,
            mask,
            sender,
        });
        Ok(receiver)
    }

    /// Process on a timer until stopped, if the scan policy is periodic
    pub fn spawn_scanner(&self, stop: CancellationToken) -> Option<JoinHandle<()>> {
        let ScanPolicy::Periodic(period) = self.scan() else {
            return None;
        };
        let record = self.clone();
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => record.process(),
                }
            }
            trace!("Stopped scanning {}", record.name);
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::providers::MONITOR_QUEUE_DEPTH;

    fn time_double() -> DbrType {
        DbrType::new(DbrBasicType::Double, DbrCategory::Time)
    }

    #[test]
    fn atomic_batch_publishes_once() {
        let record = Record::new("TEMP", RecordKind::Ai);
        let mut updates = record
            .subscribe("VAL", time_double(), MonitorMask::default())
            .unwrap();
        record.atomic(|r| {
            for i in 1..=5 {
                r.set_value(i as f64).unwrap();
            }
            r.set_field("EGU", "degC").unwrap();
        });
        let dbr = updates.try_recv().unwrap();
        assert_eq!(dbr.value(), &DbrValue::Double(vec![5.0]));
        assert!(updates.try_recv().is_err());
        assert!(!record.is_dirty());
    }

    #[test]
    fn unchanged_writes_do_not_dirty() {
        let record = Record::new("COUNT", RecordKind::Longin).with_scan(ScanPolicy::Passive);
        record.set_value(0i32).unwrap();
        assert!(!record.is_dirty());
        record.set_value(3i32).unwrap();
        assert!(record.is_dirty());
        assert_eq!(record.last_processed(), None);
        record.process();
        assert!(!record.is_dirty());
        assert!(record.last_processed().is_some());
    }

    #[test]
    fn on_change_processes_each_write() {
        let record = Record::new("OUT", RecordKind::Ao);
        let processed = Arc::new(AtomicUsize::new(0));
        let counter = processed.clone();
        record.on_post_process(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        record.set_value(1.0).unwrap();
        record.set_value(2.0).unwrap();
        record.set_value(2.0).unwrap();
        assert_eq!(processed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn alarm_limits() {
        let record = Record::new("LEVEL", RecordKind::Ai);
        record.atomic(|r| {
            r.set_field("HIHI", 90.0).unwrap();
            r.set_field("HIGH", 70.0).unwrap();
            r.set_field("LOW", 20.0).unwrap();
            r.set_field("LOLO", 5.0).unwrap();
            r.set_value(50.0).unwrap();
        });
        assert_eq!(record.alarm(), Status::default());

        let mut alarms = record
            .subscribe("VAL", time_double(), MonitorMask::ALARM)
            .unwrap();
        record.set_value(75.0).unwrap();
        assert_eq!(record.alarm().severity, AlarmSeverity::Minor as i16);
        assert_eq!(record.alarm().status, AlarmStatus::High as i16);
        record.set_value(95.0).unwrap();
        assert_eq!(record.alarm().severity, AlarmSeverity::Major as i16);
        record.set_value(1.0).unwrap();
        assert_eq!(record.alarm().status, AlarmStatus::LoLo as i16);
        // Moving within the same alarm band raises no alarm event
        record.set_value(2.0).unwrap();
        record.set_value(50.0).unwrap();
        let mut severities = Vec::new();
        while let Ok(dbr) = alarms.try_recv() {
            severities.push(dbr.status().unwrap_or_default().severity);
        }
        assert_eq!(severities, vec![1, 2, 2, 0]);
        assert_eq!(record.get_field("SEVR").unwrap(), DbrValue::Enum(0));
    }

    #[test]
    fn hooks_can_raise_alarms_and_change_values() {
        let record = Record::new("SENSOR", RecordKind::Ai).with_scan(ScanPolicy::Passive);
        record.on_pre_process(|r| {
            r.set_value(12.5).unwrap();
            r.raise_alarm(AlarmStatus::Comm, AlarmSeverity::Invalid);
        });
        record.process();
        assert_eq!(record.value(), DbrValue::Double(vec![12.5]));
        assert_eq!(record.alarm().severity, AlarmSeverity::Invalid as i16);
    }

    #[test]
    fn unread_monitors_stay_bounded() {
        let record = Record::new("FAST", RecordKind::Ai);
        let mut values = record
            .subscribe("VAL", time_double(), MonitorMask::VALUE)
            .unwrap();
        for step in 0..1000 {
            record.set_value(step as f64).unwrap();
        }
        assert_eq!(values.len(), MONITOR_QUEUE_DEPTH);
        let mut last = None;
        while let Ok(dbr) = values.try_recv() {
            last = Some(dbr.value().clone());
        }
        assert_eq!(last, Some(DbrValue::Double(vec![999.0])));
    }

    #[test]
    fn monitor_masks_filter_events() {
        let record = Record::new("NAME", RecordKind::Ai);
        let mut properties = record
            .subscribe(
                "EGU",
                DbrType::new(DbrBasicType::String, DbrCategory::Basic),
                MonitorMask::PROPERTY,
            )
            .unwrap();
        let mut values = record
            .subscribe("VAL", time_double(), MonitorMask::VALUE)
            .unwrap();
        record.set_field("EGU", "mm").unwrap();
        assert!(values.try_recv().is_err());
        assert_eq!(
            properties.try_recv().unwrap().value(),
            &DbrValue::String(vec!["mm".to_string()])
        );
        record.set_value(4.0).unwrap();
        assert!(values.try_recv().is_ok());
        assert!(properties.try_recv().is_err());
    }

    #[test]
    fn client_writes() {
        let record = Record::new("SETPOINT", RecordKind::Ao).with_scan(ScanPolicy::Passive);
        record.set_field("DRVH", 10.0).unwrap();
        record.set_field("DRVL", -10.0).unwrap();
        let mut values = record
            .subscribe("VAL", time_double(), MonitorMask::VALUE)
            .unwrap();
        record
            .put("VAL", &DbrValue::String(vec!["25".to_string()]))
            .unwrap();
        assert_eq!(record.value(), DbrValue::Double(vec![10.0]));
        assert!(values.try_recv().is_ok());
        assert!(matches!(
            record.put("STAT", &DbrValue::Enum(1)),
            Err(RecordError::ReadOnly { .. })
        ));
        assert!(matches!(
            record.put("NOPE", &DbrValue::Enum(1)),
            Err(RecordError::UnknownField { .. })
        ));
    }

    #[test]
    fn mbbi_labels() {
        let record = Record::new("MODE", RecordKind::Mbbi);
        record.set_field("ZRST", "Off").unwrap();
        record.set_field("ONST", "On").unwrap();
        record
            .put("VAL", &DbrValue::String(vec!["On".to_string()]))
            .unwrap();
        assert_eq!(record.value(), DbrValue::Enum(1));
        let dbr = record
            .read("VAL", Some(DbrType::new(DbrBasicType::Enum, DbrCategory::Graphics)))
            .unwrap();
        let Some(DbrGraphics::Enum { labels }) = dbr.graphics() else {
            panic!("Expected enum labels, got {dbr:?}");
        };
        assert_eq!(labels, &vec!["Off".to_string(), "On".to_string()]);
    }

    #[test]
    fn class_name_and_waveforms() {
        let record = Record::new_waveform("TRACE", DbrBasicType::Long, 4);
        assert_eq!(
            record.read("VAL", Some(DBR_CLASS_NAME)).unwrap(),
            Dbr::ClassName(DbrValue::String(vec!["waveform".to_string()]))
        );
        record.set_value(vec![1i32, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(record.value(), DbrValue::Long(vec![1, 2, 3, 4]));
        record.set_value(vec![7i32]).unwrap();
        assert_eq!(record.get_field("NORD").unwrap(), DbrValue::Long(vec![1]));
        let native = record.read("VAL", None).unwrap();
        assert_eq!(native.value().get_count(), 4);
        assert_eq!("waveform".parse::<RecordKind>().unwrap(), RecordKind::Waveform);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_scanning() {
        let record = Record::new("TICK", RecordKind::Longin)
            .with_scan(ScanPolicy::Periodic(Duration::from_millis(100)));
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        record.on_pre_process(move |r| {
            let n = counter.fetch_add(1, Ordering::SeqCst) as i32;
            r.set_value(n).unwrap();
        });
        let stop = CancellationToken::new();
        let scanner = record.spawn_scanner(stop.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;
        stop.cancel();
        scanner.await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 4);
        assert!(Record::new("QUIET", RecordKind::Ai).spawn_scanner(stop).is_none());
    }
}

//! Named field accessors, one table per record kind

use std::{collections::HashMap, sync::LazyLock};

use crate::{
    dbr::{DbrBasicType, DbrValue},
    messages::{ErrorCondition, MonitorMask},
};

use super::{RecordData, RecordKind};

/// Names of the sixteen `mbbi` state strings, in state order
pub const STATE_FIELDS: [&str; 16] = [
    "ZRST", "ONST", "TWST", "THST", "FRST", "FVST", "SXST", "SVST", "EIST", "NIST", "TEST",
    "ELST", "TVST", "TTST", "FTST", "FFST",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Limit {
    Hopr,
    Lopr,
    Hihi,
    High,
    Low,
    Lolo,
    Drvh,
    Drvl,
}

/// How to reach one field of a record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Accessor {
    Val,
    Stat,
    Sevr,
    Desc,
    Egu,
    Prec,
    Limit(Limit),
    State(usize),
    /// Maximum number of elements
    Nelm,
    /// Current number of elements
    Nord,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct FieldDef {
    pub name: &'static str,
    pub accessor: Accessor,
    pub writable: bool,
}

impl FieldDef {
    const fn new(name: &'static str, accessor: Accessor, writable: bool) -> Self {
        FieldDef {
            name,
            accessor,
            writable,
        }
    }

    /// The kind of monitor event a change to this field raises
    pub fn event_mask(&self) -> MonitorMask {
        match self.accessor {
            Accessor::Val => MonitorMask::VALUE.union(&MonitorMask::LOG),
            Accessor::Stat | Accessor::Sevr => MonitorMask::ALARM,
            _ => MonitorMask::PROPERTY,
        }
    }
}

pub(crate) type FieldTable = HashMap<&'static str, FieldDef>;

static TABLES: LazyLock<[FieldTable; 7]> = LazyLock::new(|| RecordKind::ALL.map(build_table));

/// The fields that a kind of record has
pub(crate) fn field_table(kind: RecordKind) -> &'static FieldTable {
    &TABLES[kind as usize]
}

fn build_table(kind: RecordKind) -> FieldTable {
    let mut fields = vec![
        FieldDef::new("VAL", Accessor::Val, true),
        FieldDef::new("STAT", Accessor::Stat, false),
        FieldDef::new("SEVR", Accessor::Sevr, false),
        FieldDef::new("DESC", Accessor::Desc, true),
    ];
    if kind.is_numeric() {
        fields.extend([
            FieldDef::new("EGU", Accessor::Egu, true),
            FieldDef::new("HOPR", Accessor::Limit(Limit::Hopr), true),
            FieldDef::new("LOPR", Accessor::Limit(Limit::Lopr), true),
        ]);
    }
    if kind.has_alarm_limits() {
        fields.extend([
            FieldDef::new("HIHI", Accessor::Limit(Limit::Hihi), true),
            FieldDef::new("HIGH", Accessor::Limit(Limit::High), true),
            FieldDef::new("LOW", Accessor::Limit(Limit::Low), true),
            FieldDef::new("LOLO", Accessor::Limit(Limit::Lolo), true),
        ]);
    }
    if matches!(kind, RecordKind::Ai | RecordKind::Ao | RecordKind::Waveform) {
        fields.push(FieldDef::new("PREC", Accessor::Prec, true));
    }
    if kind.is_output() {
        fields.extend([
            FieldDef::new("DRVH", Accessor::Limit(Limit::Drvh), true),
            FieldDef::new("DRVL", Accessor::Limit(Limit::Drvl), true),
        ]);
    }
    match kind {
        RecordKind::Mbbi => fields.extend(
            STATE_FIELDS
                .into_iter()
                .enumerate()
                .map(|(i, name)| FieldDef::new(name, Accessor::State(i), true)),
        ),
        RecordKind::Waveform => fields.extend([
            FieldDef::new("NELM", Accessor::Nelm, false),
            FieldDef::new("NORD", Accessor::Nord, false),
        ]),
        _ => (),
    }
    fields.into_iter().map(|f| (f.name, f)).collect()
}

fn first_string(value: &DbrValue) -> Result<String, ErrorCondition> {
    match value.convert_to(DbrBasicType::String)? {
        DbrValue::String(mut strings) if !strings.is_empty() => Ok(strings.swap_remove(0)),
        _ => Ok(String::new()),
    }
}

fn first_number(value: &DbrValue) -> Result<f64, ErrorCondition> {
    let number = match value {
        DbrValue::String(_) => value
            .parse_into(DbrBasicType::Double)
            .map_err(|_| ErrorCondition::NoConvert)?,
        _ => value.clone(),
    };
    number.as_f64().ok_or(ErrorCondition::BadCount)
}

/// Convert a value written to VAL into the native type of the record
fn coerce_value(data: &RecordData, value: &DbrValue) -> Result<DbrValue, ErrorCondition> {
    let native = data.value.get_type();
    let mut converted = match value {
        DbrValue::String(strings) if native == DbrBasicType::Enum => {
            let text = strings.first().map(|s| s.trim()).unwrap_or("");
            match data.states.iter().position(|s| !s.is_empty() && s == text) {
                Some(index) => DbrValue::Enum(index as u16),
                None => value
                    .parse_into(native)
                    .map_err(|_| ErrorCondition::NoConvert)?,
            }
        }
        DbrValue::String(_) if !matches!(native, DbrBasicType::String | DbrBasicType::Char) => value
            .parse_into(native)
            .map_err(|_| ErrorCondition::NoConvert)?,
        _ => value.convert_to(native)?,
    };
    if data.kind == RecordKind::Waveform {
        if converted.get_count() > data.nelm {
            let _ = converted.resize(data.nelm);
        }
    } else if converted.get_count() == 0 {
        return Err(ErrorCondition::BadCount);
    } else if converted.get_count() > 1 {
        let _ = converted.resize(1);
    }
    if data.kind.is_output()
        && data.drvh > data.drvl
        && let Some(v) = converted.as_f64()
    {
        let clamped = v.clamp(data.drvl, data.drvh);
        if clamped != v {
            converted = DbrValue::Double(vec![clamped]).convert_to(native)?;
        }
    }
    Ok(converted)
}

fn optional_limit(value: f64) -> Option<f64> {
    if value.is_nan() { None } else { Some(value) }
}

impl Accessor {
    pub fn get(&self, data: &RecordData) -> DbrValue {
        match self {
            Accessor::Val => data.value.clone(),
            Accessor::Stat => DbrValue::Enum(data.alarm.status as u16),
            Accessor::Sevr => DbrValue::Enum(data.alarm.severity as u16),
            Accessor::Desc => DbrValue::String(vec![data.desc.clone()]),
            Accessor::Egu => DbrValue::String(vec![data.egu.clone()]),
            Accessor::Prec => DbrValue::Int(vec![data.prec]),
            Accessor::Limit(limit) => DbrValue::Double(vec![match limit {
                Limit::Hopr => data.hopr,
                Limit::Lopr => data.lopr,
                Limit::Hihi => data.hihi.unwrap_or(0.0),
                Limit::High => data.high.unwrap_or(0.0),
                Limit::Low => data.low.unwrap_or(0.0),
                Limit::Lolo => data.lolo.unwrap_or(0.0),
                Limit::Drvh => data.drvh,
                Limit::Drvl => data.drvl,
            }]),
            Accessor::State(i) => {
                DbrValue::String(vec![data.states.get(*i).cloned().unwrap_or_default()])
            }
            Accessor::Nelm => DbrValue::Long(vec![data.nelm as i32]),
            Accessor::Nord => DbrValue::Long(vec![data.value.get_count() as i32]),
        }
    }

    /// Write a field, returning whether it changed
    pub fn set(&self, data: &mut RecordData, value: &DbrValue) -> Result<bool, ErrorCondition> {
        fn replace<T: PartialEq>(slot: &mut T, new: T) -> bool {
            if *slot == new {
                false
            } else {
                *slot = new;
                true
            }
        }
        Ok(match self {
            Accessor::Val => {
                let new = coerce_value(data, value)?;
                replace(&mut data.value, new)
            }
            Accessor::Desc => replace(&mut data.desc, first_string(value)?),
            Accessor::Egu => replace(&mut data.egu, first_string(value)?),
            Accessor::Prec => replace(&mut data.prec, first_number(value)? as i16),
            Accessor::Limit(limit) => {
                let v = first_number(value)?;
                match limit {
                    Limit::Hopr => replace(&mut data.hopr, v),
                    Limit::Lopr => replace(&mut data.lopr, v),
                    Limit::Hihi => replace(&mut data.hihi, optional_limit(v)),
                    Limit::High => replace(&mut data.high, optional_limit(v)),
                    Limit::Low => replace(&mut data.low, optional_limit(v)),
                    Limit::Lolo => replace(&mut data.lolo, optional_limit(v)),
                    Limit::Drvh => replace(&mut data.drvh, v),
                    Limit::Drvl => replace(&mut data.drvl, v),
                }
            }
            Accessor::State(i) => {
                let text = first_string(value)?;
                match data.states.get_mut(*i) {
                    Some(slot) => replace(slot, text),
                    None => return Err(ErrorCondition::BadCount),
                }
            }
            Accessor::Stat | Accessor::Sevr | Accessor::Nelm | Accessor::Nord => {
                return Err(ErrorCondition::NoWtAccess);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_match_kinds() {
        let ai = field_table(RecordKind::Ai);
        for name in ["VAL", "EGU", "PREC", "HIHI", "LOLO"] {
            assert!(ai.contains_key(name), "ai should have {name}");
        }
        assert!(!ai.contains_key("DRVH"));
        assert!(field_table(RecordKind::Ao).contains_key("DRVH"));
        assert!(field_table(RecordKind::Longout).contains_key("DRVL"));
        assert!(!field_table(RecordKind::Longin).contains_key("PREC"));
        assert!(field_table(RecordKind::Mbbi).contains_key("FFST"));
        assert!(!field_table(RecordKind::Stringin).contains_key("EGU"));
        assert!(!field_table(RecordKind::Waveform)["NORD"].writable);
    }

    #[test]
    fn event_masks() {
        let table = field_table(RecordKind::Ai);
        assert!(table["VAL"].event_mask().intersects(&MonitorMask::VALUE));
        assert!(table["VAL"].event_mask().intersects(&MonitorMask::LOG));
        assert_eq!(table["STAT"].event_mask(), MonitorMask::ALARM);
        assert_eq!(table["EGU"].event_mask(), MonitorMask::PROPERTY);
    }
}

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    Provider,
    dbr::{Dbr, DbrType},
    messages::{self, ErrorCondition, MonitorMask},
    providers::MonitorReceiver,
    record::{Record, RecordError, RecordKind},
};

/// Serves a set of [`Record`]s by name
///
/// A PV name is either a record name, meaning its VAL field, or
/// `RECORD.FIELD` to reach any other field. Writable fields are served
/// read-write and everything else read-only.
#[derive(Clone, Default)]
pub struct RecordProvider {
    records: Arc<Mutex<HashMap<String, Record>>>,
    /// Set once the server has started, so later periodic records scan too
    scan_stop: Arc<Mutex<Option<CancellationToken>>>,
}

impl RecordProvider {
    pub fn new() -> RecordProvider {
        RecordProvider::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, Record>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a record of the given kind and serve it
    pub fn add_record(&self, name: &str, kind: RecordKind) -> Result<Record, RecordError> {
        self.insert(Record::new(name, kind))
    }

    /// Serve an already-built record
    pub fn insert(&self, record: Record) -> Result<Record, RecordError> {
        {
            let mut records = self.records();
            if records.contains_key(record.name()) {
                return Err(RecordError::AlreadyExists(record.name().to_owned()));
            }
            records.insert(record.name().to_owned(), record.clone());
        }
        debug!("Serving {} record {}", record.kind(), record.name());
        if let Some(stop) = self
            .scan_stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            record.spawn_scanner(stop.clone());
        }
        Ok(record)
    }

    pub fn get(&self, name: &str) -> Option<Record> {
        self.records().get(name).cloned()
    }

    /// Find the record and field that a PV name refers to
    fn resolve<'a>(&self, pv_name: &'a str) -> Option<(Record, &'a str)> {
        let (record_name, field) = pv_name.split_once('.').unwrap_or((pv_name, "VAL"));
        let record = self.get(record_name)?;
        record.has_field(field).then_some((record, field))
    }

    fn resolve_or_fail<'a>(&self, pv_name: &'a str) -> Result<(Record, &'a str), ErrorCondition> {
        self.resolve(pv_name).ok_or(ErrorCondition::UnavailInServ)
    }
}

impl Provider for RecordProvider {
    fn provides(&self, pv_name: &str) -> bool {
        self.resolve(pv_name).is_some()
    }

    fn read_value(
        &self,
        pv_name: &str,
        requested_type: Option<DbrType>,
    ) -> Result<Dbr, ErrorCondition> {
        let (record, field) = self.resolve_or_fail(pv_name)?;
        Ok(record.read(field, requested_type)?)
    }

    fn get_access_right(
        &self,
        pv_name: &str,
        _client_user_name: Option<&str>,
        _client_host_name: Option<&str>,
    ) -> messages::Access {
        match self.resolve(pv_name) {
            Some((record, field)) if record.is_writable(field) => messages::Access::ReadWrite,
            Some(_) => messages::Access::Read,
            None => messages::Access::None,
        }
    }

    fn write_value(&mut self, pv_name: &str, value: Dbr) -> Result<(), ErrorCondition> {
        let (record, field) = self.resolve_or_fail(pv_name)?;
        debug!("Provider: Processing write to {pv_name}: {value:?}");
        record.put(field, value.value()).map_err(|e| {
            warn!("Write to {pv_name} failed: {e}");
            e.into()
        })
    }

    fn monitor_value(
        &mut self,
        pv_name: &str,
        data_type: DbrType,
        mask: MonitorMask,
    ) -> Result<MonitorReceiver, ErrorCondition> {
        let (record, field) = self.resolve_or_fail(pv_name)?;
        Ok(record.subscribe(field, data_type, mask)?)
    }

    fn start(&self, stop: CancellationToken) {
        *self
            .scan_stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(stop.clone());
        let records: Vec<Record> = self.records().values().cloned().collect();
        for record in records {
            record.spawn_scanner(stop.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbr::{DbrBasicType, DbrCategory, DbrValue};

    #[test]
    fn field_addressing() {
        let provider = RecordProvider::new();
        let record = provider.add_record("TEMP", RecordKind::Ai).unwrap();
        record.set_field("EGU", "K").unwrap();
        assert!(provider.provides("TEMP"));
        assert!(provider.provides("TEMP.EGU"));
        assert!(!provider.provides("TEMP.NOTAFIELD"));
        assert!(!provider.provides("OTHER"));
        assert_eq!(
            provider
                .read_value("TEMP.EGU", None)
                .unwrap()
                .value(),
            &DbrValue::String(vec!["K".to_string()])
        );
        assert_eq!(
            provider.get_access_right("TEMP", None, None),
            messages::Access::ReadWrite
        );
        assert_eq!(
            provider.get_access_right("TEMP.SEVR", None, None),
            messages::Access::Read
        );
        assert!(matches!(
            provider.add_record("TEMP", RecordKind::Ao),
            Err(RecordError::AlreadyExists(_))
        ));
    }

    #[test]
    fn writes_reach_records() {
        let mut provider = RecordProvider::new();
        let record = provider.add_record("COUNT", RecordKind::Longout).unwrap();
        provider
            .write_value("COUNT", Dbr::Basic(DbrValue::String(vec!["12".into()])))
            .unwrap();
        assert_eq!(record.value(), DbrValue::Long(vec![12]));
        assert_eq!(
            provider.write_value("COUNT.STAT", Dbr::Basic(DbrValue::Enum(1))),
            Err(ErrorCondition::NoWtAccess)
        );
        let mut updates = provider
            .monitor_value(
                "COUNT",
                DbrType::new(DbrBasicType::Double, DbrCategory::Time),
                MonitorMask::default(),
            )
            .unwrap();
        record.set_value(13i32).unwrap();
        assert_eq!(
            updates.try_recv().unwrap().value(),
            &DbrValue::Double(vec![13.0])
        );
    }
}

//! Interface between the CA Server and rust code

mod monitor;
pub mod records;
pub use monitor::{MONITOR_QUEUE_DEPTH, MonitorReceiver, MonitorSender, monitor_channel};
pub use records::RecordProvider;

use tokio_util::sync::CancellationToken;

use crate::{
    dbr::{Dbr, DbrType},
    messages::{self, ErrorCondition, MonitorMask},
};

/// Provides PV values for a CAServer
pub trait Provider: Sync + Send + Clone + 'static {
    /// Does this provider control the given PV name?
    fn provides(&self, pv_name: &str) -> bool;

    /// Fetch a single PV value.
    ///
    /// The type requested by the caller is provided, but this is only
    /// a request - you can return any type you wish from this function,
    /// and it will be automatically converted to the target type (if
    /// such a safe conversion exists).
    ///
    /// The record that you return with no requested_type is used for
    /// the native type and data count that is reported to new channels.
    fn read_value(
        &self,
        pv_name: &str,
        requested_type: Option<DbrType>,
    ) -> Result<Dbr, ErrorCondition>;

    #[allow(unused_variables)]
    fn get_access_right(
        &self,
        pv_name: &str,
        client_user_name: Option<&str>,
        client_host_name: Option<&str>,
    ) -> messages::Access {
        messages::Access::Read
    }

    /// Write a value sent by a client to a PV
    #[allow(unused_variables)]
    fn write_value(&mut self, pv_name: &str, value: Dbr) -> Result<(), ErrorCondition> {
        Err(ErrorCondition::NoWtAccess)
    }

    /// Request a stream of updates to a PV
    ///
    /// Each update should already be in `data_type`. The subscription ends
    /// when the receiver is dropped. Updates should be sent without waiting,
    /// see [`monitor_channel`].
    #[allow(unused_variables)]
    fn monitor_value(
        &mut self,
        pv_name: &str,
        data_type: DbrType,
        mask: MonitorMask,
    ) -> Result<MonitorReceiver, ErrorCondition> {
        Err(ErrorCondition::UnavailInServ)
    }

    /// Start any background work, such as periodic scanning, until `stop`
    #[allow(unused_variables)]
    fn start(&self, stop: CancellationToken) {}
}

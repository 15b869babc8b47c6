//! NV200 note acceptor: SSP codec, transport, device primitives and the
//! acceptance session built on top of them.

pub mod denomination;
pub mod device;
pub mod event;
pub mod handler;
pub mod ledger;
pub mod manager;
pub mod recovery;
pub mod session;
pub mod ssp;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use denomination::{Denomination, DenominationCatalog, NoteSpec};
pub use event::{DeviceEvent, EventName, Severity};
pub use ledger::{LedgerEntry, LedgerSnapshot};
pub use manager::{SessionManager, TransportFactory};
pub use session::{
    NoteInventory, RouteState, Session, SessionHandle, SessionState, SessionStatus, SessionSummary,
};
pub use transport::{create_serial_transport, NoteRoute, SspSerialTransport, Transport};

//! Client side of the local updater agent protocol.
//!
//! [`AgentDriver`] is the entry point: it finds the agent, negotiates control
//! and runs one operation at a time against it.

pub mod codec;
pub mod driver;
pub mod error;
pub mod key_store;
pub mod model;
pub mod negotiator;
pub mod poll;
pub mod requests;
pub mod transport;

#[cfg(test)]
mod testing;

pub use driver::{AgentDriver, DriverSettings, Pending};
pub use error::DriverError;
pub use key_store::{FileKeyStore, KeyStore, MemoryKeyStore};
pub use model::{
    ActionHistoryRecord, ActionKind, ActionOutcome, ActionRequest, ActionResult, CatalogEntry,
    CatalogPage, CatalogQuery, CatalogSort, HybridInfo, RollbackTarget, SearchResult,
};
pub use negotiator::NegotiationState;
pub use transport::{AgentConnection, ReqwestTransport, Transport};

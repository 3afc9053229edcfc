//! Service layer: the storage ledger, the tape coordinator, and the
//! notification sinks.

pub mod ledger;
pub mod notify;
pub mod tape;

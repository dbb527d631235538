//! Service logger: call records, pending confirmations and the serialized
//! write path to the log.

pub mod confirmations;
pub mod queue;
pub mod records;

pub use confirmations::PendingConfirmations;
pub use queue::{LogWriter, WriteQueue};
pub use records::{
    ActivityLog, CallPayload, CallSpec, ClientRequest, HostResponse, LogActivity, PendingCall,
    ServiceLogWriter, ServiceRequest, digest,
};

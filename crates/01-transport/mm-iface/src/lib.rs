//! FIFO transport interface over shared memory.
//!
//! An [`MmIface`] owns a receive FIFO and a pool of receive descriptors and
//! dispatches incoming active messages to per-tag handlers. Peers reach it
//! through an [`MmEp`] built from the interface's [`MmIfaceAddr`].

mod am;
mod config;
mod ep;
mod error;
mod iface;

pub use am::{AmCallback, AmHandler, AmStatus, AM_ID_MAX};
pub use config::MmIfaceConfig;
pub use ep::{FlushStatus, MmEp, SendStatus};
pub use error::{MmError, MmResult};
pub use iface::{IfaceId, MmIface, MmIfaceAddr, PollOutcome, RecvDesc};

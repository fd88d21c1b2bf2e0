//! Change detection over a stateless "list current notifications" primitive.
//!
//! [`CommandSource`] turns one run of the external listing command into
//! validated records; [`Monitor`] polls a [`SnapshotSource`] and broadcasts a
//! [`MonitorEvent`] for every notification key it has not seen before.

mod monitor;
mod source;

pub use monitor::{Monitor, MonitorConfig, MonitorEvent};
pub use source::{CommandSource, DEFAULT_LIST_COMMAND, SnapshotSource, SourceError, parse_snapshot};

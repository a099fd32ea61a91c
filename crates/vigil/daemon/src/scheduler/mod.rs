//! Background loops driving the monitoring core.

mod poller;

pub use poller::{PollSummary, Poller};

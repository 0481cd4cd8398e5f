/// Home Assistant WebSocket event stream
pub mod event_stream;

#[cfg(test)]
pub(crate) mod test_server;

pub use event_stream::{EventOutcome, EventSink, EventStreamCollector};

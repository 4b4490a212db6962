//! Test support: a call-recording backend, seeded databases, and log setup.

mod fixtures;
mod recording;

pub use fixtures::TestDb;
pub use recording::{BackendCall, RecordingStorage};

/// Route `tracing` output through the test harness. Safe to call from every
/// test; only the first call installs a subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing_subscriber::filter::LevelFilter::DEBUG)
        .with_test_writer()
        .try_init();
}

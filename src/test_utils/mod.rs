//! Test helpers. Enabled by the `test-utils` feature.

pub mod mock;

pub use mock::{MockConnector, MockCursor, MockDatabase, MockEvent, MockResponse, MockSession};

/// Path of a database file named `name` inside `dir`.
#[cfg(feature = "sqlite")]
#[must_use]
pub fn temp_sqlite_path(dir: &std::path::Path, name: &str) -> String {
    dir.join(format!("{name}.db")).to_string_lossy().into_owned()
}

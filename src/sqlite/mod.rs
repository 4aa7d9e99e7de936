// SQLite reference driver.
//
// - config: options, builder and connector
// - worker: the thread that owns each rusqlite connection
// - session: the `Session` and `Cursor` implementations
// - params / query: value conversion in each direction
// - errors: rusqlite error classification

pub mod config;
mod errors;
pub mod params;
mod query;
mod session;
mod worker;

pub use config::{SqliteConnector, SqliteOptions, SqliteOptionsBuilder, new_sqlite};
pub use params::{SqliteParamChecker, convert_params, to_sqlite_value};
pub use session::SqliteSession;

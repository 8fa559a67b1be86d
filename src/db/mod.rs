pub mod sqlite;
pub mod time;

pub use sqlite::{init_sqlite_pool, run_sqlite_migrations, SqliteInitError};
pub use time::{format_timestamp, parse_timestamp, parse_timestamp_opt};

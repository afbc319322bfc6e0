mod sqlite;
pub mod tables;

pub use sqlite::Database;
pub(crate) use sqlite::parse_ts;
#[cfg(test)]
pub(crate) use sqlite::temp_db;

pub mod postgres;
pub mod sqlite;
pub mod traits;

pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;
pub use traits::Store;

pub mod blob;
pub mod postgres_store;
pub mod sqlite_store;
pub mod store;
pub mod table;

pub use blob::{BlobStore, FsBlobStore};
pub use postgres_store::PostgresStore;
pub use sqlite_store::SqliteStore;
pub use store::MetadataStore;
pub use table::{SqliteTableHandle, TableHandle, TableRegistry};

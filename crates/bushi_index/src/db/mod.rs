mod repo;
mod schema;
mod store;

pub use repo::{CommitRecord, IndexDb, ReferenceRecord, RepositoryStats};
pub use schema::{MIN_SQLITE_VERSION, init_database};
pub use store::{CommitId, IndexStore, RepoId, StoreError, StoredRepository};

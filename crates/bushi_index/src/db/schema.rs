use rusqlite::Connection;

use super::store::StoreError;

/// Oldest SQLite with `ON CONFLICT DO UPDATE` and `RETURNING`.
pub const MIN_SQLITE_VERSION: i32 = 3_035_000;

/// SQL schema for the index
const SCHEMA: &str = r#"
-- Configured repositories, keyed by display name
CREATE TABLE IF NOT EXISTS repositories (
    id INTEGER PRIMARY KEY,
    name TEXT UNIQUE NOT NULL,
    path TEXT NOT NULL,
    head TEXT NOT NULL DEFAULT '',
    description TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

-- Commits; mark is only meaningful against the repository's mark file
CREATE TABLE IF NOT EXISTS commits (
    id INTEGER PRIMARY KEY,
    repo_id INTEGER NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
    oid TEXT NOT NULL,
    mark INTEGER,
    parent_id INTEGER REFERENCES commits(id) ON DELETE SET NULL,
    depth INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    UNIQUE (repo_id, oid),
    UNIQUE (repo_id, mark)
);

CREATE INDEX IF NOT EXISTS idx_commits_parent ON commits(parent_id);

-- Skip list over first parents: level k points 2^k commits up
CREATE TABLE IF NOT EXISTS ancestors (
    commit_id INTEGER NOT NULL REFERENCES commits(id) ON DELETE CASCADE,
    level INTEGER NOT NULL,
    ancestor_id INTEGER NOT NULL REFERENCES commits(id) ON DELETE CASCADE,
    PRIMARY KEY (commit_id, level)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_ancestors_ancestor ON ancestors(ancestor_id);

-- File paths, shared by every repository
CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY,
    name TEXT UNIQUE NOT NULL
);

CREATE TABLE IF NOT EXISTS commit_files (
    commit_id INTEGER NOT NULL REFERENCES commits(id) ON DELETE CASCADE,
    file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
    PRIMARY KEY (commit_id, file_id)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_commit_files_file ON commit_files(file_id);

-- Branches and tags, always pointing at a commit
CREATE TABLE IF NOT EXISTS refs (
    id INTEGER PRIMARY KEY,
    repo_id INTEGER NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
    full_name TEXT NOT NULL,
    short_name TEXT NOT NULL,
    is_tag INTEGER NOT NULL DEFAULT 0,
    commit_id INTEGER NOT NULL REFERENCES commits(id) ON DELETE CASCADE,
    timestamp INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE (repo_id, full_name)
);

CREATE INDEX IF NOT EXISTS idx_refs_commit ON refs(commit_id);
"#;

/// Prepare a connection and create the schema if it is missing.
pub fn init_database(conn: &Connection) -> Result<(), StoreError> {
    let version = rusqlite::version_number();
    if version < MIN_SQLITE_VERSION {
        return Err(StoreError::UnsupportedSqlite(rusqlite::version().to_string()));
    }

    conn.pragma_update(None, "foreign_keys", true)?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_repeatable() {
        let conn = Connection::open_in_memory().unwrap();
        init_database(&conn).unwrap();
        init_database(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        for table in ["ancestors", "commit_files", "commits", "files", "refs", "repositories"] {
            assert!(tables.iter().any(|t| t == table), "missing table {table}");
        }
    }

    #[test]
    fn test_commits_carry_depth() {
        let conn = Connection::open_in_memory().unwrap();
        init_database(&conn).unwrap();
        let columns: Vec<String> = conn
            .prepare("PRAGMA table_info(commits)")
            .unwrap()
            .query_map([], |row| row.get(1))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        for column in ["repo_id", "oid", "mark", "parent_id", "depth"] {
            assert!(columns.iter().any(|c| c == column), "missing column {column}");
        }
    }

    #[test]
    fn test_foreign_keys_enabled() {
        let conn = Connection::open_in_memory().unwrap();
        init_database(&conn).unwrap();
        let enabled: bool = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert!(enabled);
    }

    #[test]
    fn test_bundled_sqlite_is_new_enough() {
        assert!(rusqlite::version_number() >= MIN_SQLITE_VERSION);
    }
}

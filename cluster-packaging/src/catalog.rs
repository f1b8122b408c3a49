// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The package catalog.

Repository and envelope records are persisted in an embedded SQLite
database. The catalog is opened in single-writer mode: an exclusive
advisory lock is taken next to the database file and a second opener
fails instead of blocking.
*/

use {
    crate::{
        envelope::{Envelope, Repository, RuntimeLabels},
        error::{ClusterPackagingError, Result},
        locator::Locator,
    },
    chrono::{DateTime, Utc},
    fs2::FileExt,
    indoc::indoc,
    rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row},
    std::{
        path::{Path, PathBuf},
        sync::Mutex,
    },
};

const SCHEMA: &[&str] = &[
    indoc! {"
        CREATE TABLE repository (
            name TEXT PRIMARY KEY,
            expires TEXT
        )"},
    indoc! {"
        CREATE TABLE package (
            id INTEGER PRIMARY KEY,
            repository TEXT NOT NULL,
            name TEXT NOT NULL,
            version TEXT NOT NULL,
            size INTEGER NOT NULL,
            sha512 TEXT NOT NULL,
            labels TEXT NOT NULL,
            hidden INTEGER NOT NULL,
            encrypted INTEGER NOT NULL,
            package_type TEXT,
            manifest BLOB,
            created TEXT NOT NULL,
            created_by TEXT NOT NULL
        )"},
    "CREATE UNIQUE INDEX package_locator ON package(repository, name, version)",
    "CREATE INDEX package_digest ON package(sha512)",
];

const SCHEMA_VERSION: i64 = 1;

/// Embedded database of repositories and package envelopes.
pub struct Catalog {
    conn: Mutex<Connection>,
    path: PathBuf,

    // Held for the lifetime of a writable catalog.
    _lock: Option<std::fs::File>,
}

impl Catalog {
    /// Open a writable catalog, creating the database if missing.
    ///
    /// Fails with `AlreadyInUse` when another process holds the
    /// catalog open for writing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ClusterPackagingError::IoPath(format!("{}", parent.display()), e))?;
        }

        let lock_path = path.with_extension("lock");
        let lock = std::fs::File::create(&lock_path)
            .map_err(|e| ClusterPackagingError::IoPath(format!("{}", lock_path.display()), e))?;

        lock.try_lock_exclusive()
            .map_err(|_| ClusterPackagingError::AlreadyInUse(path.clone()))?;

        let conn = Connection::open(&path)?;
        let catalog = Self {
            conn: Mutex::new(conn),
            path,
            _lock: Some(lock),
        };

        catalog.ensure_schema()?;

        Ok(catalog)
    }

    /// Open an existing catalog read-only, without taking the writer lock.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let conn = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
            _lock: None,
        })
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("catalog lock poisoned");

        let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version == 0 {
            for statement in SCHEMA {
                conn.execute(statement, params![])?;
            }

            conn.pragma_update(None, "user_version", &SCHEMA_VERSION)?;
        }

        Ok(())
    }

    pub fn upsert_repository(&self, name: &str, expires: Option<DateTime<Utc>>) -> Result<()> {
        let conn = self.conn.lock().expect("catalog lock poisoned");

        conn.execute(
            "INSERT OR IGNORE INTO repository (name, expires) VALUES (?1, ?2)",
            params![name, expires.map(|t| t.to_rfc3339())],
        )?;

        Ok(())
    }

    pub fn get_repositories(&self) -> Result<Vec<Repository>> {
        let conn = self.conn.lock().expect("catalog lock poisoned");

        let mut statement =
            conn.prepare("SELECT name, expires FROM repository ORDER BY name")?;

        let repositories = statement
            .query_map(params![], repository_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        repositories.into_iter().collect()
    }

    pub fn get_repository(&self, name: &str) -> Result<Repository> {
        let conn = self.conn.lock().expect("catalog lock poisoned");

        conn.query_row(
            "SELECT name, expires FROM repository WHERE name = ?1",
            params![name],
            repository_from_row,
        )
        .optional()?
        .ok_or_else(|| ClusterPackagingError::RepositoryNotFound(name.to_string()))?
    }

    /// Delete a repository and all its packages.
    ///
    /// Returns the envelopes of the deleted packages so callers can
    /// release their blobs.
    pub fn delete_repository(&self, name: &str) -> Result<Vec<Envelope>> {
        let envelopes = self.get_packages(name)?;

        let conn = self.conn.lock().expect("catalog lock poisoned");

        conn.execute("DELETE FROM package WHERE repository = ?1", params![name])?;

        let deleted = conn.execute("DELETE FROM repository WHERE name = ?1", params![name])?;

        if deleted == 0 {
            return Err(ClusterPackagingError::RepositoryNotFound(name.to_string()));
        }

        Ok(envelopes)
    }

    /// Record an envelope.
    ///
    /// With `replace` unset an existing `(repository, name, version)`
    /// fails with `PackageExists`.
    pub fn insert_package(&self, envelope: &Envelope, replace: bool) -> Result<()> {
        let conn = self.conn.lock().expect("catalog lock poisoned");

        let sql = if replace {
            indoc! {"
                INSERT OR REPLACE INTO package
                (repository, name, version, size, sha512, labels, hidden, encrypted,
                 package_type, manifest, created, created_by)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "}
        } else {
            indoc! {"
                INSERT INTO package
                (repository, name, version, size, sha512, labels, hidden, encrypted,
                 package_type, manifest, created, created_by)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "}
        };

        let result = conn.execute(
            sql,
            params![
                envelope.locator.repository,
                envelope.locator.name,
                envelope.locator.version,
                envelope.size_bytes as i64,
                envelope.sha512,
                serde_json::to_string(&envelope.runtime_labels)?,
                envelope.hidden,
                envelope.encrypted,
                envelope.package_type,
                envelope.manifest,
                envelope.created.to_rfc3339(),
                envelope.created_by,
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(ClusterPackagingError::PackageExists(
                    envelope.locator.clone(),
                ))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_package(&self, locator: &Locator) -> Result<Option<Envelope>> {
        let conn = self.conn.lock().expect("catalog lock poisoned");

        conn.query_row(
            indoc! {"
                SELECT repository, name, version, size, sha512, labels, hidden,
                       encrypted, package_type, manifest, created, created_by
                FROM package
                WHERE repository = ?1 AND name = ?2 AND version = ?3
            "},
            params![locator.repository, locator.name, locator.version],
            envelope_from_row,
        )
        .optional()?
        .transpose()
    }

    pub fn get_packages(&self, repository: &str) -> Result<Vec<Envelope>> {
        let conn = self.conn.lock().expect("catalog lock poisoned");

        let mut statement = conn.prepare(indoc! {"
            SELECT repository, name, version, size, sha512, labels, hidden,
                   encrypted, package_type, manifest, created, created_by
            FROM package
            WHERE repository = ?1
            ORDER BY name, version
        "})?;

        let envelopes = statement
            .query_map(params![repository], envelope_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        envelopes.into_iter().collect()
    }

    /// Delete an envelope, returning it for blob cleanup.
    pub fn delete_package(&self, locator: &Locator) -> Result<Envelope> {
        let envelope = self
            .get_package(locator)?
            .ok_or_else(|| ClusterPackagingError::PackageNotFound(locator.clone()))?;

        let conn = self.conn.lock().expect("catalog lock poisoned");

        conn.execute(
            "DELETE FROM package WHERE repository = ?1 AND name = ?2 AND version = ?3",
            params![locator.repository, locator.name, locator.version],
        )?;

        Ok(envelope)
    }

    /// Merge label changes into an envelope.
    pub fn update_labels(
        &self,
        locator: &Locator,
        add: &RuntimeLabels,
        remove: &[String],
    ) -> Result<()> {
        let envelope = self
            .get_package(locator)?
            .ok_or_else(|| ClusterPackagingError::PackageNotFound(locator.clone()))?;

        let mut labels = envelope.runtime_labels;

        for key in remove {
            labels.remove(key);
        }

        for (key, value) in add {
            labels.insert(key.clone(), value.clone());
        }

        let conn = self.conn.lock().expect("catalog lock poisoned");

        conn.execute(
            "UPDATE package SET labels = ?1 WHERE repository = ?2 AND name = ?3 AND version = ?4",
            params![
                serde_json::to_string(&labels)?,
                locator.repository,
                locator.name,
                locator.version,
            ],
        )?;

        Ok(())
    }

    /// Count envelopes across all repositories referencing a digest.
    pub fn count_digest_references(&self, sha512: &str) -> Result<u64> {
        let conn = self.conn.lock().expect("catalog lock poisoned");

        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM package WHERE sha512 = ?1",
            params![sha512],
            |row| row.get(0),
        )?;

        Ok(count as u64)
    }
}

fn repository_from_row(row: &Row<'_>) -> rusqlite::Result<Result<Repository>> {
    let name: String = row.get(0)?;
    let expires: Option<String> = row.get(1)?;

    Ok(parse_repository(name, expires))
}

fn parse_repository(name: String, expires: Option<String>) -> Result<Repository> {
    let expires = match expires {
        Some(value) => Some(
            DateTime::parse_from_rfc3339(&value)
                .map_err(|e| {
                    ClusterPackagingError::Internal(format!(
                        "malformed repository expiry {}: {}",
                        value, e
                    ))
                })?
                .with_timezone(&Utc),
        ),
        None => None,
    };

    Ok(Repository { name, expires })
}

fn envelope_from_row(row: &Row<'_>) -> rusqlite::Result<Result<Envelope>> {
    let repository: String = row.get(0)?;
    let name: String = row.get(1)?;
    let version: String = row.get(2)?;
    let size: i64 = row.get(3)?;
    let sha512: String = row.get(4)?;
    let labels: String = row.get(5)?;
    let hidden: bool = row.get(6)?;
    let encrypted: bool = row.get(7)?;
    let package_type: Option<String> = row.get(8)?;
    let manifest: Option<Vec<u8>> = row.get(9)?;
    let created: String = row.get(10)?;
    let created_by: String = row.get(11)?;

    Ok(parse_envelope(
        repository,
        name,
        version,
        size,
        sha512,
        labels,
        hidden,
        encrypted,
        package_type,
        manifest,
        created,
        created_by,
    ))
}

#[allow(clippy::too_many_arguments)]
fn parse_envelope(
    repository: String,
    name: String,
    version: String,
    size: i64,
    sha512: String,
    labels: String,
    hidden: bool,
    encrypted: bool,
    package_type: Option<String>,
    manifest: Option<Vec<u8>>,
    created: String,
    created_by: String,
) -> Result<Envelope> {
    Ok(Envelope {
        locator: Locator::new(&repository, &name, &version)?,
        size_bytes: size as u64,
        sha512,
        runtime_labels: serde_json::from_str(&labels)?,
        hidden,
        encrypted,
        package_type,
        manifest,
        created: DateTime::parse_from_rfc3339(&created)
            .map_err(|e| {
                ClusterPackagingError::Internal(format!(
                    "malformed envelope timestamp {}: {}",
                    created, e
                ))
            })?
            .with_timezone(&Utc),
        created_by,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn envelope(locator: &str, payload: &[u8]) -> Envelope {
        Envelope {
            locator: Locator::parse(locator).unwrap(),
            size_bytes: payload.len() as u64,
            sha512: crate::io::ContentDigest::of(payload).digest_hex(),
            runtime_labels: RuntimeLabels::new(),
            hidden: false,
            encrypted: false,
            package_type: None,
            manifest: None,
            created: Utc::now(),
            created_by: "test".to_string(),
        }
    }

    fn open_catalog(dir: &Path) -> Result<Catalog> {
        Catalog::open(dir.join(crate::CATALOG_FILE_NAME))
    }

    #[test]
    fn repository_lifecycle() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let catalog = open_catalog(dir.path())?;

        catalog.upsert_repository("example.com", None)?;
        catalog.upsert_repository("example.com", None)?;

        assert_eq!(catalog.get_repositories()?.len(), 1);
        assert_eq!(catalog.get_repository("example.com")?.name, "example.com");
        assert!(matches!(
            catalog.get_repository("missing.io"),
            Err(ClusterPackagingError::RepositoryNotFound(_))
        ));

        catalog.delete_repository("example.com")?;
        assert!(catalog.get_repositories()?.is_empty());

        Ok(())
    }

    #[test]
    fn duplicate_insert_fails_without_replace() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let catalog = open_catalog(dir.path())?;

        catalog.upsert_repository("example.com", None)?;

        let e = envelope("example.com/app:1.0.0", b"one");
        catalog.insert_package(&e, false)?;

        assert!(matches!(
            catalog.insert_package(&e, false),
            Err(ClusterPackagingError::PackageExists(_))
        ));

        // Replacement overwrites in place.
        let replacement = envelope("example.com/app:1.0.0", b"two");
        catalog.insert_package(&replacement, true)?;

        let read = catalog
            .get_package(&e.locator)?
            .expect("package should exist");
        assert_eq!(read.sha512, replacement.sha512);

        Ok(())
    }

    #[test]
    fn label_updates_merge() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let catalog = open_catalog(dir.path())?;

        catalog.upsert_repository("example.com", None)?;

        let mut e = envelope("example.com/app:1.0.0", b"data");
        e.runtime_labels
            .insert("stale".to_string(), "yes".to_string());
        catalog.insert_package(&e, false)?;

        let mut add = RuntimeLabels::new();
        add.insert("purpose".to_string(), "runtime".to_string());

        catalog.update_labels(&e.locator, &add, &["stale".to_string()])?;

        let read = catalog.get_package(&e.locator)?.expect("package exists");
        assert_eq!(read.label("purpose"), Some("runtime"));
        assert_eq!(read.label("stale"), None);

        Ok(())
    }

    #[test]
    fn digest_reference_counting() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let catalog = open_catalog(dir.path())?;

        catalog.upsert_repository("example.com", None)?;

        let a = envelope("example.com/app:1.0.0", b"shared");
        let b = envelope("example.com/other:1.0.0", b"shared");
        catalog.insert_package(&a, false)?;
        catalog.insert_package(&b, false)?;

        assert_eq!(catalog.count_digest_references(&a.sha512)?, 2);

        catalog.delete_package(&a.locator)?;
        assert_eq!(catalog.count_digest_references(&a.sha512)?, 1);

        Ok(())
    }

    #[test]
    fn second_writer_fails() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let _first = open_catalog(dir.path())?;

        assert!(matches!(
            open_catalog(dir.path()),
            Err(ClusterPackagingError::AlreadyInUse(_))
        ));

        Ok(())
    }
}

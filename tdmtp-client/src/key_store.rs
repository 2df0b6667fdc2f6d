//! Pluggable persistence for auth keys.
//!
//! The [`KeyStore`] trait abstracts over where the permanent keys live so
//! callers can swap in a file, an in-memory store, SQLite, or anything else.
//!
//! Built-in stores:
//! * [`BinaryFileStore`]: compact binary file (default).
//! * [`InMemoryStore`]: nothing touches the disk.
//! * [`SqliteStore`]: SQLite (requires the `sqlite` Cargo feature).

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tdmtp_crypto::AuthKey;

// ─── Persisted data ───────────────────────────────────────────────────────────

/// A permanent key and what was last known about its DC.
#[derive(Clone, Debug, PartialEq)]
pub struct DcKey {
    pub dc_id:       i32,
    pub auth_key:    [u8; 256],
    pub salt:        i64,
    pub time_offset: i32,
}

impl DcKey {
    pub fn to_auth_key(&self) -> AuthKey { AuthKey::from_bytes(self.auth_key).with_dc(self.dc_id) }
}

/// Everything a [`KeyStore`] keeps.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PersistedKeys {
    pub home_dc_id: i32,
    pub dcs:        Vec<DcKey>,
}

impl PersistedKeys {
    pub fn get(&self, dc_id: i32) -> Option<&DcKey> { self.dcs.iter().find(|k| k.dc_id == dc_id) }

    /// Insert or replace the key of `key.dc_id`.
    pub fn upsert(&mut self, key: DcKey) {
        match self.dcs.iter_mut().find(|k| k.dc_id == key.dc_id) {
            Some(slot) => *slot = key,
            None       => self.dcs.push(key),
        }
    }

    pub fn remove(&mut self, dc_id: i32) { self.dcs.retain(|k| k.dc_id != dc_id) }

    /// Binary layout: home dc, count, then per DC its id, key, salt and offset.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(5 + self.dcs.len() * 272);
        b.extend_from_slice(&self.home_dc_id.to_le_bytes());
        b.push(self.dcs.len().min(u8::MAX as usize) as u8);
        for d in self.dcs.iter().take(u8::MAX as usize) {
            b.extend_from_slice(&d.dc_id.to_le_bytes());
            b.extend_from_slice(&d.auth_key);
            b.extend_from_slice(&d.salt.to_le_bytes());
            b.extend_from_slice(&d.time_offset.to_le_bytes());
        }
        b
    }

    pub fn from_bytes(buf: &[u8]) -> io::Result<Self> {
        let mut r = Reader { buf, pos: 0 };
        let home_dc_id = i32::from_le_bytes(r.array()?);
        let count = r.array::<1>()?[0] as usize;
        let mut dcs = Vec::with_capacity(count);
        for _ in 0..count {
            dcs.push(DcKey {
                dc_id:       i32::from_le_bytes(r.array()?),
                auth_key:    r.array()?,
                salt:        i64::from_le_bytes(r.array()?),
                time_offset: i32::from_le_bytes(r.array()?),
            });
        }
        Ok(Self { home_dc_id, dcs })
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn array<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        let end = self.pos + N;
        let bytes = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "truncated key file"))?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        self.pos = end;
        Ok(out)
    }
}

// ─── Trait ────────────────────────────────────────────────────────────────────

/// An abstraction over where and how auth keys are persisted.
pub trait KeyStore: Send + Sync {
    fn save(&self, keys: &PersistedKeys) -> io::Result<()>;

    /// Previously saved keys, or `None` if nothing was stored yet.
    fn load(&self) -> io::Result<Option<PersistedKeys>>;

    /// Remove everything (e.g. on log-out).
    fn delete(&self) -> io::Result<()>;

    /// Human-readable name of this store (for log messages).
    fn name(&self) -> &str;
}

// ─── BinaryFileStore ──────────────────────────────────────────────────────────

/// The default store: one compact binary file.
pub struct BinaryFileStore {
    path: PathBuf,
}

impl BinaryFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self { Self { path: path.into() } }
}

impl KeyStore for BinaryFileStore {
    fn save(&self, keys: &PersistedKeys) -> io::Result<()> {
        // Write-then-rename so a crash never leaves half a key behind.
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, keys.to_bytes())?;
        std::fs::rename(&tmp, &self.path)
    }

    fn load(&self) -> io::Result<Option<PersistedKeys>> {
        match std::fs::read(&self.path) {
            Ok(buf) => PersistedKeys::from_bytes(&buf).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn delete(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    fn name(&self) -> &str { "binary-file" }
}

// ─── InMemoryStore ────────────────────────────────────────────────────────────

/// An ephemeral store; keys live as long as the process.
///
/// Useful for tests, or to seed a client with a key obtained elsewhere.
#[derive(Default)]
pub struct InMemoryStore {
    data: Mutex<Option<PersistedKeys>>,
}

impl InMemoryStore {
    pub fn new() -> Self { Self::default() }

    pub fn with_keys(keys: PersistedKeys) -> Self { Self { data: Mutex::new(Some(keys)) } }
}

impl KeyStore for InMemoryStore {
    fn save(&self, keys: &PersistedKeys) -> io::Result<()> {
        *self.data.lock() = Some(keys.clone());
        Ok(())
    }

    fn load(&self) -> io::Result<Option<PersistedKeys>> { Ok(self.data.lock().clone()) }

    fn delete(&self) -> io::Result<()> {
        *self.data.lock() = None;
        Ok(())
    }

    fn name(&self) -> &str { "in-memory" }
}

// ─── SqliteStore ──────────────────────────────────────────────────────────────

#[cfg(feature = "sqlite")]
pub use sqlite_store::SqliteStore;

#[cfg(feature = "sqlite")]
mod sqlite_store {
    use super::*;
    use rusqlite::{params, Connection, OptionalExtension};

    fn to_io(e: rusqlite::Error) -> io::Error { io::Error::other(e) }

    /// SQLite-backed key store.
    ///
    /// Creates two tables (`meta` and `dc_keys`) if they do not exist.
    ///
    /// Enable with the `sqlite` Cargo feature:
    /// ```toml
    /// [dependencies]
    /// tdmtp-client = { version = "*", features = ["sqlite"] }
    /// ```
    pub struct SqliteStore {
        path: PathBuf,
    }

    impl SqliteStore {
        pub fn new(path: impl Into<PathBuf>) -> io::Result<Self> {
            let path = path.into();
            // Open and initialise the schema immediately so errors surface early.
            let conn = Connection::open(&path).map_err(to_io)?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS meta (
                    key   TEXT PRIMARY KEY,
                    value INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS dc_keys (
                    dc_id       INTEGER PRIMARY KEY,
                    auth_key    BLOB    NOT NULL,
                    salt        INTEGER NOT NULL DEFAULT 0,
                    time_offset INTEGER NOT NULL DEFAULT 0
                );",
            )
            .map_err(to_io)?;
            Ok(Self { path })
        }
    }

    impl KeyStore for SqliteStore {
        fn save(&self, keys: &PersistedKeys) -> io::Result<()> {
            let mut conn = Connection::open(&self.path).map_err(to_io)?;
            let tx = conn.transaction().map_err(to_io)?;
            tx.execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES ('home_dc_id', ?1)",
                params![keys.home_dc_id],
            )
            .map_err(to_io)?;
            tx.execute("DELETE FROM dc_keys", []).map_err(to_io)?;
            for dc in &keys.dcs {
                tx.execute(
                    "INSERT INTO dc_keys (dc_id, auth_key, salt, time_offset) VALUES (?1, ?2, ?3, ?4)",
                    params![dc.dc_id, dc.auth_key.to_vec(), dc.salt, dc.time_offset],
                )
                .map_err(to_io)?;
            }
            tx.commit().map_err(to_io)
        }

        fn load(&self) -> io::Result<Option<PersistedKeys>> {
            let conn = Connection::open(&self.path).map_err(to_io)?;
            let home_dc_id: Option<i32> = conn
                .query_row("SELECT value FROM meta WHERE key = 'home_dc_id'", [], |row| row.get(0))
                .optional()
                .map_err(to_io)?;
            let Some(home_dc_id) = home_dc_id else {
                return Ok(None);
            };

            let mut stmt = conn
                .prepare("SELECT dc_id, auth_key, salt, time_offset FROM dc_keys ORDER BY dc_id")
                .map_err(to_io)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i32>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i32>(3)?,
                    ))
                })
                .map_err(to_io)?;

            let mut dcs = Vec::new();
            for row in rows {
                let (dc_id, blob, salt, time_offset) = row.map_err(to_io)?;
                let auth_key: [u8; 256] = blob.try_into().map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidData, format!("auth key of dc {dc_id} is not 256 bytes"))
                })?;
                dcs.push(DcKey { dc_id, auth_key, salt, time_offset });
            }
            Ok(Some(PersistedKeys { home_dc_id, dcs }))
        }

        fn delete(&self) -> io::Result<()> {
            let conn = Connection::open(&self.path).map_err(to_io)?;
            conn.execute_batch("DELETE FROM dc_keys; DELETE FROM meta;").map_err(to_io)
        }

        fn name(&self) -> &str { "sqlite" }
    }
}

// ─── KeyBook ──────────────────────────────────────────────────────────────────

/// Serializes read-modify-write cycles on a shared [`KeyStore`].
///
/// Every connection worker saves through the same book, so two DCs getting
/// keys at once never overwrite each other.
pub(crate) struct KeyBook {
    store: Arc<dyn KeyStore>,
    lock:  Mutex<()>,
}

impl KeyBook {
    pub(crate) fn new(store: Arc<dyn KeyStore>) -> Self { Self { store, lock: Mutex::new(()) } }

    pub(crate) fn name(&self) -> &str { self.store.name() }

    pub(crate) fn load(&self) -> io::Result<PersistedKeys> {
        Ok(self.store.load()?.unwrap_or_default())
    }

    pub(crate) fn key_for(&self, dc_id: i32) -> io::Result<Option<DcKey>> {
        Ok(self.load()?.get(dc_id).cloned())
    }

    pub(crate) fn remember(&self, key: DcKey) -> io::Result<()> {
        self.update(|keys| keys.upsert(key))
    }

    pub(crate) fn forget(&self, dc_id: i32) -> io::Result<()> {
        self.update(|keys| keys.remove(dc_id))
    }

    pub(crate) fn set_home_dc(&self, dc_id: i32) -> io::Result<()> {
        self.update(|keys| keys.home_dc_id = dc_id)
    }

    fn update(&self, f: impl FnOnce(&mut PersistedKeys)) -> io::Result<()> {
        let _guard = self.lock.lock();
        let mut keys = self.load()?;
        f(&mut keys);
        self.store.save(&keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(dc_id: i32, fill: u8) -> DcKey {
        DcKey { dc_id, auth_key: [fill; 256], salt: i64::from(fill) << 40, time_offset: -i32::from(fill) }
    }

    #[test]
    fn binary_layout_survives_a_reload() {
        let keys = PersistedKeys { home_dc_id: 2, dcs: vec![key(2, 7), key(4, 9)] };
        let bytes = keys.to_bytes();
        assert_eq!(bytes.len(), 5 + 2 * (4 + 256 + 8 + 4));
        assert_eq!(PersistedKeys::from_bytes(&bytes).unwrap(), keys);
        let err = PersistedKeys::from_bytes(&bytes[..bytes.len() - 1]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn file_store_round_trips_and_deletes() {
        let path = std::env::temp_dir().join(format!("tdmtp-keys-{}.bin", std::process::id()));
        let store = BinaryFileStore::new(&path);
        assert_eq!(store.load().unwrap(), None);
        let keys = PersistedKeys { home_dc_id: 4, dcs: vec![key(4, 1)] };
        store.save(&keys).unwrap();
        assert_eq!(store.load().unwrap(), Some(keys));
        store.delete().unwrap();
        store.delete().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn book_updates_one_dc_at_a_time() {
        let book = KeyBook::new(Arc::new(InMemoryStore::new()));
        book.remember(key(2, 1)).unwrap();
        book.remember(key(4, 2)).unwrap();
        book.remember(key(2, 3)).unwrap();
        book.set_home_dc(4).unwrap();
        let keys = book.load().unwrap();
        assert_eq!(keys.home_dc_id, 4);
        assert_eq!(keys.dcs, [key(2, 3), key(4, 2)]);

        book.forget(2).unwrap();
        assert_eq!(book.key_for(2).unwrap(), None);
        assert_eq!(book.key_for(4).unwrap(), Some(key(4, 2)));
    }
}

//! Bigram store: previous-token -> single-gram image, layered system/user.
//!
//! Each store is one redb database with a single table mapping a 4-byte
//! little-endian token key to the raw byte image of a [`SingleGram`]. A
//! reserved key of two zero tokens (8 zero bytes) holds a 4-byte magic
//! number identifying the file family; it is written on create and verified
//! on every open. The decoder consumes two stores, a read-only system layer
//! and a read-write user layer, merging their rows per previous token.
//!
//! `load_db`/`save_db` support the in-memory companion: a database copied
//! into an `InMemoryBackend` for fast user updates, written back atomically
//! (temp file + rename).

use std::path::{Path, PathBuf};

use redb::backends::InMemoryBackend;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::phrase_index::PhraseToken;
use crate::single_gram::SingleGram;

const BIGRAM_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("bigram");

/// Magic value stored under the reserved key.
pub const BIGRAM_MAGIC: [u8; 4] = *b"HYBG";
/// Two zero tokens; no real entry can use this key.
const MAGIC_KEY: [u8; 8] = [0; 8];

/// How to attach a persistent store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachMode {
    /// Open an existing database; refuse all writes.
    ReadOnly,
    /// Open an existing database for reading and writing.
    ReadWrite,
    /// Open or create; implies read-write. A fresh database is stamped with
    /// the magic entry.
    Create,
}

#[derive(Debug)]
pub struct Bigram {
    db: Option<Database>,
    writable: bool,
}

impl Default for Bigram {
    fn default() -> Self {
        Self::new()
    }
}

impl Bigram {
    /// A detached store; attach or load before use.
    pub fn new() -> Self {
        Bigram {
            db: None,
            writable: false,
        }
    }

    /// A fresh writable in-memory store, already stamped with the magic
    /// entry. This is what the user layer starts from before any
    /// persistence exists.
    pub fn in_memory() -> Result<Self> {
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        stamp_magic(&db)?;
        Ok(Bigram {
            db: Some(db),
            writable: true,
        })
    }

    pub fn is_attached(&self) -> bool {
        self.db.is_some()
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    fn db(&self) -> Result<&Database> {
        self.db
            .as_ref()
            .ok_or_else(|| CoreError::Logic("bigram store is not attached".into()))
    }

    fn writable_db(&self) -> Result<&Database> {
        if !self.writable {
            return Err(CoreError::Logic(
                "write on a read-only bigram store".into(),
            ));
        }
        self.db()
    }

    /// Attach a persistent database, verifying (or, with `Create`, stamping)
    /// the magic entry.
    pub fn attach<P: AsRef<Path>>(&mut self, path: P, mode: AttachMode) -> Result<()> {
        let path = path.as_ref();
        let db = match mode {
            AttachMode::Create => {
                let db = Database::create(path)?;
                if !has_magic(&db)? {
                    stamp_magic(&db)?;
                }
                verify_magic(&db, path)?;
                db
            }
            AttachMode::ReadOnly | AttachMode::ReadWrite => {
                let db = Database::open(path)?;
                verify_magic(&db, path)?;
                db
            }
        };
        debug!(path = %path.display(), ?mode, "attached bigram store");
        self.db = Some(db);
        self.writable = mode != AttachMode::ReadOnly;
        Ok(())
    }

    /// Copy a persistent database into a fresh in-memory companion.
    pub fn load_db<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let src = Database::open(path)?;
        verify_magic(&src, path)?;
        let mem = Database::builder().create_with_backend(InMemoryBackend::new())?;
        copy_all(&src, &mem)?;
        debug!(path = %path.display(), "loaded bigram store into memory");
        self.db = Some(mem);
        self.writable = true;
        Ok(())
    }

    /// Write the store out atomically: copy into a temp database next to the
    /// target, then rename over it.
    pub fn save_db<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let db = self.db()?;
        let path = path.as_ref();
        let mut tmp: PathBuf = path.to_path_buf();
        tmp.set_extension("tmp");
        if tmp.exists() {
            std::fs::remove_file(&tmp)?;
        }
        {
            let dst = Database::create(&tmp)?;
            copy_all(db, &dst)?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Load the single-gram for one previous token. The returned value owns
    /// its bytes.
    pub fn load(&self, token: PhraseToken) -> Result<Option<SingleGram>> {
        let db = self.db()?;
        let txn = db.begin_read()?;
        let table = match txn.open_table(BIGRAM_TABLE) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let key = token.to_le_bytes();
        match table.get(&key[..])? {
            Some(value) => Ok(Some(SingleGram::from_bytes(value.value().to_vec())?)),
            None => Ok(None),
        }
    }

    /// Overwrite the single-gram for one previous token.
    pub fn store(&self, token: PhraseToken, gram: &SingleGram) -> Result<()> {
        let db = self.writable_db()?;
        let txn = db.begin_write()?;
        {
            let mut table = txn.open_table(BIGRAM_TABLE)?;
            let key = token.to_le_bytes();
            table.insert(&key[..], gram.as_bytes())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Remove one entry; returns whether it existed.
    pub fn remove(&self, token: PhraseToken) -> Result<bool> {
        let db = self.writable_db()?;
        let txn = db.begin_write()?;
        let existed;
        {
            let mut table = txn.open_table(BIGRAM_TABLE)?;
            let key = token.to_le_bytes();
            existed = table.remove(&key[..])?.is_some();
        }
        txn.commit()?;
        Ok(existed)
    }

    /// Every real previous-token key, ascending. The magic sentinel is
    /// skipped.
    pub fn get_all_items(&self) -> Result<Vec<PhraseToken>> {
        let db = self.db()?;
        let txn = db.begin_read()?;
        let table = match txn.open_table(BIGRAM_TABLE) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for item in table.iter()? {
            let (key, _) = item?;
            let key = key.value();
            if key.len() != 4 {
                continue;
            }
            out.push(u32::from_le_bytes([key[0], key[1], key[2], key[3]]));
        }
        out.sort_unstable();
        Ok(out)
    }

    /// Drop every entry whose key matches `(key & mask) == value` and scrub
    /// matching successors out of the remaining rows, removing rows that
    /// become empty.
    pub fn mask_out(&self, mask: PhraseToken, value: PhraseToken) -> Result<()> {
        for token in self.get_all_items()? {
            if (token & mask) == value {
                self.remove(token)?;
                continue;
            }
            let Some(mut gram) = self.load(token)? else {
                continue;
            };
            if gram.mask_out(mask, value) == 0 {
                continue;
            }
            if gram.get_length() == 0 {
                self.remove(token)?;
            } else {
                self.store(token, &gram)?;
            }
        }
        Ok(())
    }
}

fn has_magic(db: &Database) -> Result<bool> {
    let txn = db.begin_read()?;
    let table = match txn.open_table(BIGRAM_TABLE) {
        Ok(t) => t,
        Err(redb::TableError::TableDoesNotExist(_)) => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    Ok(table.get(&MAGIC_KEY[..])?.is_some())
}

fn stamp_magic(db: &Database) -> Result<()> {
    let txn = db.begin_write()?;
    {
        let mut table = txn.open_table(BIGRAM_TABLE)?;
        table.insert(&MAGIC_KEY[..], &BIGRAM_MAGIC[..])?;
    }
    txn.commit()?;
    Ok(())
}

fn verify_magic(db: &Database, path: &Path) -> Result<()> {
    let txn = db.begin_read()?;
    let table = match txn.open_table(BIGRAM_TABLE) {
        Ok(t) => t,
        Err(redb::TableError::TableDoesNotExist(_)) => {
            return Err(CoreError::Format(format!(
                "{}: not a bigram database",
                path.display()
            )))
        }
        Err(e) => return Err(e.into()),
    };
    match table.get(&MAGIC_KEY[..])? {
        Some(v) if v.value() == BIGRAM_MAGIC => Ok(()),
        _ => Err(CoreError::Format(format!(
            "{}: wrong magic, not a bigram database",
            path.display()
        ))),
    }
}

fn copy_all(src: &Database, dst: &Database) -> Result<()> {
    let read = src.begin_read()?;
    let write = dst.begin_write()?;
    {
        let mut out = write.open_table(BIGRAM_TABLE)?;
        match read.open_table(BIGRAM_TABLE) {
            Ok(table) => {
                for item in table.iter()? {
                    let (key, value) = item?;
                    out.insert(key.value(), value.value())?;
                }
            }
            Err(redb::TableError::TableDoesNotExist(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }
    write.commit()?;
    Ok(())
}

//! Sharded document archive.
//!
//! Documents live in zip shards of [`SHARD_CAPACITY`] entries. A shard file is
//! named by the six-digit shard number; entries inside it by the three-digit
//! slot. Shards are append-only: a slot is written once, and every `add`
//! rewrites the central directory before returning.
//!
//! A shard whose central directory is missing (a process killed mid-append)
//! is rebuilt from its local entry headers the next time it is opened. The
//! damaged file is kept alongside as `NNNNNN.damaged`.

use std::collections::HashSet;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tempfile::NamedTempFile;
use zip::read::read_zipfile_from_stream;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::constants::{SHARD_CAPACITY, SHARD_DIGITS, SLOT_DIGITS};
use crate::error::{Result, TrawlError};
use crate::types::DocumentId;
use crate::types::ids::parse_fixed_digits;

const DAMAGED_SUFFIX: &str = "damaged";

/// Slot names of the shard most recently written.
struct ShardSlots {
    shard: u64,
    slots: HashSet<String>,
}

pub struct DocumentArchive {
    dir: PathBuf,
    current: Option<ShardSlots>,
}

fn entry_options() -> SimpleFileOptions {
    SimpleFileOptions::default().compression_method(CompressionMethod::Deflated)
}

impl DocumentArchive {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs_err::create_dir_all(&dir)?;
        Ok(Self { dir, current: None })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn shard_path(&self, id: DocumentId) -> PathBuf {
        self.dir.join(id.shard_name())
    }

    /// Stores `bytes` under `id`. Fails with [`TrawlError::DuplicateEntry`]
    /// if the slot is already taken. The shard is complete and synced when
    /// this returns.
    pub fn add(&mut self, id: DocumentId, bytes: &[u8]) -> Result<()> {
        let result = self.append(id, bytes);
        if result.as_ref().is_err_and(|err| !matches!(err, TrawlError::DuplicateEntry { .. })) {
            // the file may not match the cached slots any more
            self.current = None;
        }
        result
    }

    fn append(&mut self, id: DocumentId, bytes: &[u8]) -> Result<()> {
        if self.current.as_ref().is_some_and(|current| current.shard != id.shard()) {
            self.current = None;
        }
        let path = self.shard_path(id);
        let current = match self.current.take() {
            Some(current) => current,
            None => ShardSlots {
                shard: id.shard(),
                slots: read_slots(&path)?,
            },
        };
        let current = self.current.insert(current);

        let slot = id.slot_name();
        if current.slots.contains(&slot) {
            return Err(TrawlError::DuplicateEntry { id });
        }

        let file = fs_err::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let mut writer = if file.metadata()?.len() == 0 {
            tracing::debug!(shard = %path.display(), "starting shard");
            ZipWriter::new(file)
        } else {
            ZipWriter::new_append(file)?
        };
        writer.start_file(slot.as_str(), entry_options())?;
        writer.write_all(bytes)?;
        writer.finish()?.sync_all()?;

        current.slots.insert(slot);
        tracing::debug!(doc.id = %id, bytes = bytes.len(), "archived document");
        Ok(())
    }

    /// Reads the document stored under `id`.
    pub fn get(&mut self, id: DocumentId) -> Result<Vec<u8>> {
        let path = self.shard_path(id);
        let mut archive = match open_shard(&path)? {
            Some(archive) => archive,
            None => return Err(TrawlError::NotFound { id }),
        };
        let mut entry = match archive.by_name(&id.slot_name()) {
            Ok(entry) => entry,
            Err(zip::result::ZipError::FileNotFound) => return Err(TrawlError::NotFound { id }),
            Err(err) => return Err(err.into()),
        };
        let mut bytes = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or(0));
        entry.read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    /// Forgets the cached slot list. Written documents are already durable.
    pub fn close(&mut self) {
        if let Some(current) = self.current.take() {
            tracing::debug!(shard = current.shard, entries = current.slots.len(), "shard released");
        }
    }
}

/// Opens a shard for reading, rebuilding it first when its central directory
/// cannot be read. `None` when the file is missing or empty.
fn open_shard(path: &Path) -> Result<Option<ZipArchive<fs_err::File>>> {
    let len = match fs_err::metadata(path) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if len == 0 {
        return Ok(None);
    }
    match ZipArchive::new(fs_err::File::open(path)?) {
        Ok(archive) => Ok(Some(archive)),
        Err(err) => {
            tracing::warn!(shard = %path.display(), error = %err, "shard unreadable; rebuilding");
            let recovered = rebuild_shard(path)?;
            tracing::warn!(shard = %path.display(), recovered, "shard rebuilt");
            Ok(Some(ZipArchive::new(fs_err::File::open(path)?)?))
        }
    }
}

fn read_slots(path: &Path) -> Result<HashSet<String>> {
    Ok(open_shard(path)?
        .map(|archive| archive.file_names().map(str::to_string).collect())
        .unwrap_or_default())
}

/// Copies every intact entry, read front to back from local headers, into a
/// fresh shard that replaces `path`. Returns the number of entries kept.
fn rebuild_shard(path: &Path) -> Result<usize> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut source = BufReader::new(fs_err::File::open(path)?);
    let mut writer = ZipWriter::new(NamedTempFile::new_in(dir)?);
    let mut recovered = 0;
    loop {
        let mut entry = match read_zipfile_from_stream(&mut source) {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(shard = %path.display(), error = %err, "stopped at damaged entry");
                break;
            }
        };
        let name = entry.name().to_string();
        let mut bytes = Vec::new();
        if let Err(err) = entry.read_to_end(&mut bytes) {
            tracing::debug!(shard = %path.display(), entry = %name, error = %err, "dropped truncated entry");
            break;
        }
        writer.start_file(name, entry_options())?;
        writer.write_all(&bytes)?;
        recovered += 1;
    }
    let rebuilt = writer.finish()?;
    rebuilt.as_file().sync_all()?;

    let mut damaged = path.as_os_str().to_owned();
    damaged.push(format!(".{DAMAGED_SUFFIX}"));
    fs_err::rename(path, PathBuf::from(damaged))?;
    rebuilt.persist(path).map_err(|err| err.error)?;
    Ok(recovered)
}

/// Hands out document ids, resuming after the highest archived one.
#[derive(Debug)]
pub struct IdAllocator {
    dir: PathBuf,
    next: Mutex<Option<u64>>,
}

impl IdAllocator {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            next: Mutex::new(None),
        }
    }

    pub fn new_id(&self) -> Result<DocumentId> {
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        let id = match *next {
            Some(id) => id,
            None => {
                let id = scan_next_id(&self.dir)?;
                tracing::debug!(next = id, dir = %self.dir.display(), "document ids initialised");
                id
            }
        };
        *next = Some(id + 1);
        Ok(DocumentId(id))
    }
}

fn scan_next_id(dir: &Path) -> Result<u64> {
    let entries = match fs_err::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };
    let mut highest: Option<u64> = None;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(shard) = name.to_str().and_then(|n| parse_fixed_digits(n, SHARD_DIGITS)) {
            highest = highest.max(Some(shard));
        }
    }
    let Some(shard) = highest else {
        return Ok(0);
    };

    // a shard with no recoverable slots counts as holding slot 000
    let path = dir.join(DocumentId::from_parts(shard, 0).shard_name());
    let slot = match highest_slot(&path) {
        Ok(Some(slot)) => slot,
        Ok(None) => 0,
        Err(err) => {
            tracing::warn!(shard = %path.display(), error = %err, "unreadable shard; assuming slot 000");
            0
        }
    };
    Ok(shard * SHARD_CAPACITY + slot + 1)
}

fn highest_slot(path: &Path) -> Result<Option<u64>> {
    Ok(read_slots(path)?
        .iter()
        .filter_map(|name| parse_fixed_digits(name, SLOT_DIGITS))
        .max())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn add_then_get_across_shards() {
        let dir = TempDir::new().unwrap();
        let mut archive = DocumentArchive::open(dir.path()).unwrap();
        archive.add(DocumentId(998), b"first").unwrap();
        archive.add(DocumentId(999), b"second").unwrap();
        archive.add(DocumentId(1000), b"third").unwrap();

        assert!(dir.path().join("000000").exists());
        assert!(dir.path().join("000001").exists());
        assert_eq!(archive.get(DocumentId(998)).unwrap(), b"first");
        assert_eq!(archive.get(DocumentId(1000)).unwrap(), b"third");
    }

    #[test]
    fn duplicate_slot_is_rejected_even_after_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut archive = DocumentArchive::open(dir.path()).unwrap();
            archive.add(DocumentId(5), b"v1").unwrap();
            assert!(matches!(
                archive.add(DocumentId(5), b"v2"),
                Err(TrawlError::DuplicateEntry { id: DocumentId(5) })
            ));
        }
        let mut archive = DocumentArchive::open(dir.path()).unwrap();
        assert!(matches!(
            archive.add(DocumentId(5), b"v3"),
            Err(TrawlError::DuplicateEntry { .. })
        ));
        archive.add(DocumentId(6), b"v1").unwrap();
        assert_eq!(archive.get(DocumentId(5)).unwrap(), b"v1");
        assert_eq!(archive.get(DocumentId(6)).unwrap(), b"v1");
    }

    #[test]
    fn missing_shard_or_slot_is_not_found() {
        let dir = TempDir::new().unwrap();
        let mut archive = DocumentArchive::open(dir.path()).unwrap();
        assert!(matches!(
            archive.get(DocumentId(42)),
            Err(TrawlError::NotFound { .. })
        ));
        archive.add(DocumentId(1), b"x").unwrap();
        assert!(matches!(
            archive.get(DocumentId(2)),
            Err(TrawlError::NotFound { .. })
        ));
    }

    #[test]
    fn allocator_counts_from_zero_and_resumes() {
        let dir = TempDir::new().unwrap();
        let allocator = IdAllocator::new(dir.path());
        let mut archive = DocumentArchive::open(dir.path()).unwrap();
        for expected in 0..3 {
            let id = allocator.new_id().unwrap();
            assert_eq!(id, DocumentId(expected));
            archive.add(id, b"doc").unwrap();
        }
        assert_eq!(allocator.new_id().unwrap(), DocumentId(3));
        archive.close();

        // restart: slot 3 was issued but never written
        let restarted = IdAllocator::new(dir.path());
        assert_eq!(restarted.new_id().unwrap(), DocumentId(3));
    }

    #[test]
    fn empty_shard_counts_as_slot_zero() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("000004"), b"").unwrap();
        std::fs::write(dir.path().join("notashard"), b"").unwrap();
        let allocator = IdAllocator::new(dir.path());
        assert_eq!(allocator.new_id().unwrap(), DocumentId(4001));

        // the floor id is still writable into the empty shard
        let mut archive = DocumentArchive::open(dir.path()).unwrap();
        archive.add(DocumentId(4001), b"doc").unwrap();
        assert_eq!(archive.get(DocumentId(4001)).unwrap(), b"doc");
    }

    #[test]
    fn documents_survive_a_killed_run() {
        let dir = TempDir::new().unwrap();
        {
            let mut archive = DocumentArchive::open(dir.path()).unwrap();
            archive.add(DocumentId(0), b"earlier run").unwrap();
            archive.close();
        }
        let mut archive = DocumentArchive::open(dir.path()).unwrap();
        archive.add(DocumentId(1), b"interrupted run").unwrap();
        // no close, no drop
        std::mem::forget(archive);

        let mut archive = DocumentArchive::open(dir.path()).unwrap();
        assert_eq!(archive.get(DocumentId(0)).unwrap(), b"earlier run");
        assert_eq!(archive.get(DocumentId(1)).unwrap(), b"interrupted run");
        assert_eq!(IdAllocator::new(dir.path()).new_id().unwrap(), DocumentId(2));
    }

    #[test]
    fn shard_without_central_directory_is_rebuilt() {
        let dir = TempDir::new().unwrap();
        let mut archive = DocumentArchive::open(dir.path()).unwrap();
        for id in 0..3 {
            archive.add(DocumentId(id), format!("doc {id}").as_bytes()).unwrap();
        }
        let shard = dir.path().join("000000");
        let len = std::fs::metadata(&shard).unwrap().len();
        std::fs::OpenOptions::new()
            .write(true)
            .open(&shard)
            .unwrap()
            .set_len(len - 10)
            .unwrap();
        assert!(ZipArchive::new(std::fs::File::open(&shard).unwrap()).is_err());

        assert_eq!(IdAllocator::new(dir.path()).new_id().unwrap(), DocumentId(3));
        assert!(dir.path().join("000000.damaged").exists());

        let mut archive = DocumentArchive::open(dir.path()).unwrap();
        assert_eq!(archive.get(DocumentId(2)).unwrap(), b"doc 2");
        archive.add(DocumentId(3), b"doc 3").unwrap();
        assert_eq!(archive.get(DocumentId(0)).unwrap(), b"doc 0");
        assert_eq!(archive.get(DocumentId(3)).unwrap(), b"doc 3");
    }

    #[test]
    fn unrecoverable_shard_restarts_at_floor() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("000003"), b"these bytes were never a zip file").unwrap();

        assert_eq!(IdAllocator::new(dir.path()).new_id().unwrap(), DocumentId(3001));
        let mut archive = DocumentArchive::open(dir.path()).unwrap();
        archive.add(DocumentId(3001), b"doc").unwrap();
        assert_eq!(archive.get(DocumentId(3001)).unwrap(), b"doc");
        assert_eq!(
            std::fs::read(dir.path().join("000003.damaged")).unwrap(),
            b"these bytes were never a zip file"
        );
    }
}

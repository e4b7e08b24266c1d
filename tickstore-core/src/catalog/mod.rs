//! Bucket catalog
//!
//! The catalog mirrors the on-disk directory tree: each bucket key
//! `Symbol/Timeframe/RecordType` maps to a directory holding a `header`
//! file (schema, timeframe, record kind) and one `<YYYY>.bin` segment per
//! year. Buckets are discovered by a startup scan and lazily on reference;
//! year segments are opened (or created zero-filled) on demand and memoized.

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::segment::{SegmentFile, SEGMENT_MAGIC, SEGMENT_VERSION};
use crate::types::{BucketMeta, RecordKind, Schema, Timeframe, NANOS_COLUMN};
use crate::{Result, TickError};

/// Per-bucket metadata file name
pub const HEADER_FILE: &str = "header";

/// A catalog leaf: one bucket with its schema and year→segment map
pub struct Bucket {
    key: String,
    dir: PathBuf,
    meta: BucketMeta,
    years: RwLock<BTreeMap<i32, Arc<SegmentFile>>>,
    readers: AtomicUsize,
    writers: AtomicUsize,
}

impl Bucket {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn meta(&self) -> &BucketMeta {
        &self.meta
    }

    pub fn schema(&self) -> &Schema {
        &self.meta.schema
    }

    pub fn timeframe(&self) -> Timeframe {
        self.meta.timeframe
    }

    pub fn record_kind(&self) -> RecordKind {
        self.meta.record_kind
    }

    /// Open (or create zero-filled) the segment for `year`; memoized
    pub fn get_or_open_year(&self, year: i32) -> Result<Arc<SegmentFile>> {
        if let Some(seg) = self.years.read().get(&year) {
            return Ok(seg.clone());
        }
        let mut years = self.years.write();
        if let Some(seg) = years.get(&year) {
            return Ok(seg.clone());
        }
        let path = self.dir.join(format!("{:04}.bin", year));
        let seg = if path.exists() {
            SegmentFile::open(&path)?
        } else {
            SegmentFile::create(&path, year, &self.meta)?
        };
        let seg = Arc::new(seg);
        years.insert(year, seg.clone());
        Ok(seg)
    }

    /// Years present on disk or already open, ascending
    pub fn years(&self) -> Result<Vec<i32>> {
        let mut years: Vec<i32> = self.years.read().keys().copied().collect();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(year) = name
                    .strip_suffix(".bin")
                    .and_then(|y| y.parse::<i32>().ok())
                {
                    years.push(year);
                }
            }
        }
        years.sort_unstable();
        years.dedup();
        Ok(years)
    }

    /// Borrow a shared read view; blocks destroy while held
    pub fn read_view(self: &Arc<Self>) -> BucketReadView {
        self.readers.fetch_add(1, Ordering::SeqCst);
        BucketReadView {
            bucket: self.clone(),
        }
    }

    /// Borrow an exclusive-use write view; blocks destroy while held
    pub fn write_view(self: &Arc<Self>) -> BucketWriteView {
        self.writers.fetch_add(1, Ordering::SeqCst);
        BucketWriteView {
            bucket: self.clone(),
        }
    }

    fn in_use(&self) -> bool {
        self.readers.load(Ordering::SeqCst) > 0 || self.writers.load(Ordering::SeqCst) > 0
    }
}

/// RAII read borrow of a bucket
pub struct BucketReadView {
    bucket: Arc<Bucket>,
}

impl Deref for BucketReadView {
    type Target = Bucket;

    fn deref(&self) -> &Bucket {
        &self.bucket
    }
}

impl Drop for BucketReadView {
    fn drop(&mut self) {
        self.bucket.readers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// RAII write borrow of a bucket
pub struct BucketWriteView {
    bucket: Arc<Bucket>,
}

impl Deref for BucketWriteView {
    type Target = Bucket;

    fn deref(&self) -> &Bucket {
        &self.bucket
    }
}

impl Drop for BucketWriteView {
    fn drop(&mut self) {
        self.bucket.writers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The bucket catalog rooted at the data directory
pub struct Catalog {
    root: PathBuf,
    buckets: RwLock<BTreeMap<String, Arc<Bucket>>>,
    create_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl Catalog {
    /// Open the catalog, scanning the root directory for existing buckets
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let catalog = Self {
            root,
            buckets: RwLock::new(BTreeMap::new()),
            create_locks: Mutex::new(HashMap::new()),
        };
        let found = catalog.scan()?;
        info!(root = ?catalog.root, buckets = found, "catalog opened");
        Ok(catalog)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Look up a bucket, falling back to the directory tree for buckets
    /// created since the startup scan
    pub fn resolve(&self, key: &str) -> Result<Arc<Bucket>> {
        if let Some(bucket) = self.buckets.read().get(key) {
            return Ok(bucket.clone());
        }
        let dir = self.bucket_dir(key)?;
        if dir.join(HEADER_FILE).exists() {
            let meta = read_bucket_header(&dir.join(HEADER_FILE))?;
            let bucket = Arc::new(Bucket {
                key: key.to_string(),
                dir,
                meta,
                years: RwLock::new(BTreeMap::new()),
                readers: AtomicUsize::new(0),
                writers: AtomicUsize::new(0),
            });
            self.buckets
                .write()
                .insert(key.to_string(), bucket.clone());
            return Ok(bucket);
        }
        Err(TickError::BucketNotFound(key.to_string()))
    }

    /// Create a bucket. Re-creating with the identical schema is a no-op;
    /// any conflicting schema fails. Concurrent creates under the same
    /// parent directory are serialized.
    pub fn create(&self, key: &str, meta: BucketMeta) -> Result<Arc<Bucket>> {
        meta.schema.validate()?;
        if meta.record_kind == RecordKind::Variable
            && meta.schema.column_index(NANOS_COLUMN).is_none()
        {
            return Err(TickError::InvalidFormat(format!(
                "variable bucket schema must carry a {} column",
                NANOS_COLUMN
            )));
        }
        let dir = self.bucket_dir(key)?;
        let parent = dir.parent().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone());
        let lock = self.parent_lock(parent);
        let _guard = lock.lock();

        match self.resolve(key) {
            Ok(existing) => {
                if existing.meta == meta {
                    return Ok(existing);
                }
                return Err(TickError::SchemaMismatch {
                    bucket: key.to_string(),
                    reason: "bucket already exists with a different schema".into(),
                });
            }
            Err(TickError::BucketNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        fs::create_dir_all(&dir)?;
        write_bucket_header(&dir.join(HEADER_FILE), &meta)?;
        let bucket = Arc::new(Bucket {
            key: key.to_string(),
            dir,
            meta,
            years: RwLock::new(BTreeMap::new()),
            readers: AtomicUsize::new(0),
            writers: AtomicUsize::new(0),
        });
        self.buckets
            .write()
            .insert(key.to_string(), bucket.clone());
        info!(bucket = key, "created bucket");
        Ok(bucket)
    }

    /// Remove a bucket and its files. Refused while any read or write view
    /// is outstanding.
    pub fn destroy(&self, key: &str) -> Result<()> {
        let bucket = self.resolve(key)?;
        if bucket.in_use() {
            return Err(TickError::BucketBusy(key.to_string()));
        }
        self.buckets.write().remove(key);
        fs::remove_dir_all(&bucket.dir)?;
        info!(bucket = key, "destroyed bucket");
        Ok(())
    }

    /// All known bucket keys, sorted
    pub fn list(&self) -> Vec<String> {
        self.buckets.read().keys().cloned().collect()
    }

    fn bucket_dir(&self, key: &str) -> Result<PathBuf> {
        let parts: Vec<&str> = key.split('/').collect();
        if parts.len() != 3 || parts.iter().any(|p| p.is_empty() || p.contains("..")) {
            return Err(TickError::InvalidFormat(format!(
                "bucket key must be Symbol/Timeframe/RecordType: {}",
                key
            )));
        }
        Ok(self.root.join(parts[0]).join(parts[1]).join(parts[2]))
    }

    fn parent_lock(&self, parent: PathBuf) -> Arc<Mutex<()>> {
        self.create_locks
            .lock()
            .entry(parent)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn scan(&self) -> Result<usize> {
        let mut found = 0;
        for symbol in read_subdirs(&self.root)? {
            for timeframe in read_subdirs(&symbol)? {
                for record_type in read_subdirs(&timeframe)? {
                    let header = record_type.join(HEADER_FILE);
                    if !header.exists() {
                        continue;
                    }
                    let key = match record_type.strip_prefix(&self.root) {
                        Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
                        Err(_) => continue,
                    };
                    match read_bucket_header(&header) {
                        Ok(meta) => {
                            self.buckets.write().insert(
                                key.clone(),
                                Arc::new(Bucket {
                                    key,
                                    dir: record_type,
                                    meta,
                                    years: RwLock::new(BTreeMap::new()),
                                    readers: AtomicUsize::new(0),
                                    writers: AtomicUsize::new(0),
                                }),
                            );
                            found += 1;
                        }
                        Err(e) => {
                            // quarantine: leave the bucket unresolvable
                            warn!(bucket = %key, error = %e, "skipping bucket with bad header");
                        }
                    }
                }
            }
        }
        Ok(found)
    }
}

fn read_subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            out.push(entry.path());
        }
    }
    out.sort();
    Ok(out)
}

/// Header file: magic | version | bincode(BucketMeta) | crc32
fn write_bucket_header(path: &Path, meta: &BucketMeta) -> Result<()> {
    let body = bincode::serialize(meta).map_err(|e| TickError::InvalidFormat(e.to_string()))?;
    let mut buf = BytesMut::with_capacity(body.len() + 12);
    buf.put_u32_le(SEGMENT_MAGIC);
    buf.put_u16_le(SEGMENT_VERSION);
    buf.put_slice(&body);
    buf.put_u32_le(crc32fast::hash(&body));

    // atomic create: write a sibling temp file, then rename into place
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &buf)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_bucket_header(path: &Path) -> Result<BucketMeta> {
    let data = fs::read(path)?;
    if data.len() < 10 {
        return Err(TickError::Corruption("bucket header too short".into()));
    }
    let mut cursor = std::io::Cursor::new(&data[..]);
    let magic = cursor.get_u32_le();
    if magic != SEGMENT_MAGIC {
        return Err(TickError::Corruption(format!(
            "bad bucket header magic: {:#010x}",
            magic
        )));
    }
    let version = cursor.get_u16_le();
    if version != SEGMENT_VERSION {
        return Err(TickError::Corruption(format!(
            "unsupported bucket header version: {}",
            version
        )));
    }
    let body = &data[6..data.len() - 4];
    let expected = u32::from_le_bytes([
        data[data.len() - 4],
        data[data.len() - 3],
        data[data.len() - 2],
        data[data.len() - 1],
    ]);
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(TickError::ChecksumMismatch { expected, actual });
    }
    bincode::deserialize(body).map_err(|e| TickError::Corruption(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Column, ElementType};
    use tempfile::TempDir;

    fn ohlcv_meta() -> BucketMeta {
        BucketMeta {
            schema: Schema::new(vec![
                Column::new("Epoch", ElementType::Int64),
                Column::new("Open", ElementType::Float32),
                Column::new("High", ElementType::Float32),
                Column::new("Low", ElementType::Float32),
                Column::new("Close", ElementType::Float32),
            ])
            .unwrap(),
            timeframe: "1Min".parse().unwrap(),
            record_kind: RecordKind::Fixed,
        }
    }

    #[test]
    fn test_create_resolve_list() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();

        catalog.create("AAPL/1Min/OHLCV", ohlcv_meta()).unwrap();
        catalog.create("MSFT/1Min/OHLCV", ohlcv_meta()).unwrap();

        let bucket = catalog.resolve("AAPL/1Min/OHLCV").unwrap();
        assert_eq!(bucket.key(), "AAPL/1Min/OHLCV");
        assert_eq!(bucket.timeframe().step_seconds(), 60);

        assert_eq!(
            catalog.list(),
            vec!["AAPL/1Min/OHLCV".to_string(), "MSFT/1Min/OHLCV".to_string()]
        );
        assert!(matches!(
            catalog.resolve("TSLA/1Min/OHLCV"),
            Err(TickError::BucketNotFound(_))
        ));
    }

    #[test]
    fn test_create_is_idempotent_for_equal_schema() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        catalog.create("AAPL/1Min/OHLCV", ohlcv_meta()).unwrap();
        catalog.create("AAPL/1Min/OHLCV", ohlcv_meta()).unwrap();

        let mut other = ohlcv_meta();
        other.schema.columns[1].elem = ElementType::Float64;
        assert!(matches!(
            catalog.create("AAPL/1Min/OHLCV", other),
            Err(TickError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn test_rescan_discovers_buckets() {
        let dir = TempDir::new().unwrap();
        {
            let catalog = Catalog::open(dir.path()).unwrap();
            let bucket = catalog.create("AAPL/1Min/OHLCV", ohlcv_meta()).unwrap();
            bucket.get_or_open_year(2000).unwrap();
        }
        let catalog = Catalog::open(dir.path()).unwrap();
        let bucket = catalog.resolve("AAPL/1Min/OHLCV").unwrap();
        assert_eq!(bucket.meta(), &ohlcv_meta());
        assert_eq!(bucket.years().unwrap(), vec![2000]);
    }

    #[test]
    fn test_destroy_refuses_while_viewed() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        let bucket = catalog.create("AAPL/1Min/OHLCV", ohlcv_meta()).unwrap();

        let view = bucket.read_view();
        assert!(matches!(
            catalog.destroy("AAPL/1Min/OHLCV"),
            Err(TickError::BucketBusy(_))
        ));
        drop(view);

        catalog.destroy("AAPL/1Min/OHLCV").unwrap();
        assert!(matches!(
            catalog.resolve("AAPL/1Min/OHLCV"),
            Err(TickError::BucketNotFound(_))
        ));
    }

    #[test]
    fn test_bad_keys_rejected() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        for key in ["AAPL", "AAPL/1Min", "AAPL//OHLCV", "a/b/c/d", "../x/y"] {
            assert!(catalog.create(key, ohlcv_meta()).is_err(), "key {}", key);
        }
    }
}

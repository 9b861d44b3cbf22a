//! Month-partitioned, append-only table storage on the local filesystem.
//!
//! Layout under a dataset directory:
//!
//! ```text
//! <dataset>/DATASET.bin            dataset metadata (location)
//! <dataset>/<table>/TABLE.bin      table metadata (schema, partitioning, clustering, expiration)
//! <dataset>/<table>/p_YYYYMM.rows  one append-only file per calendar month (UTC)
//! <dataset>/<table>/TABLE.lock     advisory lock plus the partition rewrite generation
//! ```
//!
//! Metadata files are framed as `magic | version u32 | len u64 | crc32 u32 | bincode payload` and
//! replaced atomically (tmp file, fsync, rename, fsync dir). Partition files start with
//! `magic | version u32` followed by `[len u32][crc32 u32][bincode Row]` frames.
//!
//! Every process opening the same table coordinates through `TABLE.lock`: mutations hold it
//! exclusively, scans hold it shared. Mutations that replace or unlink partition files bump the
//! generation stored in it, which invalidates the verified partition lengths other handles cached.

use crate::error::IngestError;
use crate::schema::{FieldMode, FieldType, FieldValue, Row, SchemaField, TableSchema};
use crate::telemetry::{PipelineEvent, PipelineEventListener};
use crate::types::Timestamp;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use crc32fast::Hasher as Crc32;
use fs2::FileExt;
use rayon::prelude::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::collections::HashMap;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

const DATASET_MAGIC: &[u8; 8] = b"THMDST01";
const TABLE_MAGIC: &[u8; 8] = b"THMTBL01";
const PARTITION_MAGIC: &[u8; 8] = b"THMPRT01";

const DATASET_VERSION: u32 = 1;
const TABLE_VERSION: u32 = 1;
const PARTITION_VERSION: u32 = 1;

const DATASET_FILE: &str = "DATASET.bin";
const TABLE_FILE: &str = "TABLE.bin";
const LOCK_FILE: &str = "TABLE.lock";

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

const PARTITION_HEADER_LEN: usize = 8 + 4;
const FRAME_HEADER_LEN: usize = 4 + 4; // len + crc32

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DatasetMeta {
    location: String,
}

/// A directory of tables sharing one location.
#[derive(Debug, Clone)]
pub struct Dataset {
    dir: PathBuf,
    location: String,
}

impl Dataset {
    /// Opens the dataset at `dir`, creating it if needed.
    ///
    /// An existing dataset keeps the location it was created with; asking for another one is a
    /// configuration error.
    pub fn create<P: AsRef<Path>>(dir: P, location: &str) -> Result<Self, IngestError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let meta_path = dir.join(DATASET_FILE);
        if meta_path.exists() {
            let meta: DatasetMeta = read_framed(&meta_path, DATASET_MAGIC, DATASET_VERSION)?;
            if meta.location != location {
                return Err(IngestError::ConfigError(format!(
                    "dataset {:?} is in location {:?}, not {:?}",
                    dir, meta.location, location
                )));
            }
        } else {
            let meta = DatasetMeta {
                location: location.to_string(),
            };
            write_framed_atomic(&meta_path, DATASET_MAGIC, DATASET_VERSION, &meta)?;
        }
        Ok(Self {
            dir,
            location: location.to_string(),
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn table_dir(&self, table: &str) -> PathBuf {
        self.dir.join(table)
    }
}

/// Creation options for a [`PartitionedTable`].
#[derive(Debug, Clone)]
pub struct TableSpec {
    pub schema: TableSchema,
    /// REQUIRED TIMESTAMP column rows are partitioned by (monthly).
    pub partition_field: String,
    /// Columns rows are ordered by when a partition is rewritten.
    pub clustering: Vec<String>,
    /// Partitions whose upper bound is older than this are dropped.
    pub partition_expiration: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMeta {
    pub schema: TableSchema,
    pub partition_field: String,
    pub clustering: Vec<String>,
    partition_expiration_ms: Option<i64>,
}

impl TableMeta {
    pub fn partition_expiration(&self) -> Option<Duration> {
        self.partition_expiration_ms.map(Duration::milliseconds)
    }
}

/// One calendar month (UTC) of rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionId {
    year: i32,
    month: u32,
}

impl PartitionId {
    pub fn of(ts: Timestamp) -> Self {
        Self {
            year: ts.year(),
            month: ts.month(),
        }
    }

    /// First instant of the month.
    pub fn start(&self) -> Timestamp {
        month_start(self.year, self.month).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// First instant of the following month (exclusive upper bound).
    pub fn end(&self) -> Timestamp {
        let (y, m) = if self.month == 12 {
            (self.year + 1, 1)
        } else {
            (self.year, self.month + 1)
        };
        month_start(y, m).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// `YYYYMM`, the partition's display name.
    pub fn name(&self) -> String {
        format!("{:04}{:02}", self.year, self.month)
    }

    fn file_name(&self) -> String {
        format!("p_{}.rows", self.name())
    }

    fn parse_file_name(name: &str) -> Option<Self> {
        let id = name.strip_prefix("p_")?.strip_suffix(".rows")?;
        if id.len() != 6 {
            return None;
        }
        let year: i32 = id[..4].parse().ok()?;
        let month: u32 = id[4..].parse().ok()?;
        if !(1..=12).contains(&month) {
            return None;
        }
        Some(Self { year, month })
    }

    fn is_expired(&self, expiration: Option<Duration>, now: Timestamp) -> bool {
        match expiration {
            Some(exp) => self
                .end()
                .checked_add_signed(exp)
                .map(|deadline| deadline <= now)
                .unwrap_or(false),
            None => false,
        }
    }
}

fn month_start(year: i32, month: u32) -> Option<Timestamp> {
    NaiveDate::from_ymd_opt(year, month, 1)?
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
}

pub fn micros_to_timestamp(micros: i64) -> Option<Timestamp> {
    DateTime::from_timestamp_micros(micros)
}

/// Append-only table partitioned by calendar month on a timestamp column.
///
/// Inserts are validated against the persisted schema and appended as a single framed write.
/// Scans prune partitions by month, read the survivors in parallel and return rows in ascending
/// partition-column order (ties keep append order).
#[derive(Debug)]
pub struct PartitionedTable {
    name: String,
    dir: PathBuf,
    meta: RwLock<TableMeta>,
    // Partition lengths known to end on a valid frame, as of a lock generation.
    verified: Mutex<VerifiedTails>,
    events: Arc<dyn PipelineEventListener>,
}

#[derive(Debug, Default)]
struct VerifiedTails {
    generation: u64,
    lens: HashMap<PartitionId, VerifiedLen>,
}

#[derive(Debug, Clone, Copy)]
struct VerifiedLen {
    len: u64,
    modified: Option<SystemTime>,
}

/// Advisory lock on `TABLE.lock`, released on drop.
#[derive(Debug)]
struct TableLock {
    file: File,
}

impl TableLock {
    fn open(dir: &Path) -> Result<File, IngestError> {
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))?)
    }

    fn exclusive(dir: &Path) -> Result<Self, IngestError> {
        let file = Self::open(dir)?;
        FileExt::lock_exclusive(&file)?;
        Ok(Self { file })
    }

    fn shared(dir: &Path) -> Result<Self, IngestError> {
        let file = Self::open(dir)?;
        FileExt::lock_shared(&file)?;
        Ok(Self { file })
    }

    fn generation(&mut self) -> Result<u64, IngestError> {
        let mut bytes = Vec::with_capacity(8);
        self.file.seek(SeekFrom::Start(0))?;
        (&mut self.file).take(8).read_to_end(&mut bytes)?;
        Ok(match <[u8; 8]>::try_from(bytes.as_slice()) {
            Ok(b) => u64::from_le_bytes(b),
            Err(_) => 0,
        })
    }

    /// Marks partition files as replaced; only valid while held exclusively.
    fn bump_generation(&mut self) -> Result<(), IngestError> {
        let next = self.generation()?.wrapping_add(1);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&next.to_le_bytes())?;
        self.file.flush()?;
        Ok(())
    }
}

impl Drop for TableLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl PartitionedTable {
    /// Opens the table at `dir`, creating it from `spec` when absent.
    ///
    /// An existing table keeps its persisted metadata; `spec` is ignored in that case.
    pub fn create<P: AsRef<Path>>(
        dir: P,
        name: impl Into<String>,
        spec: TableSpec,
        events: Arc<dyn PipelineEventListener>,
    ) -> Result<Self, IngestError> {
        let dir = dir.as_ref().to_path_buf();
        let name = name.into();
        fs::create_dir_all(&dir)?;
        let meta_path = dir.join(TABLE_FILE);

        let meta = if meta_path.exists() {
            read_framed(&meta_path, TABLE_MAGIC, TABLE_VERSION)?
        } else {
            check_partition_field(&spec.schema, &spec.partition_field)?;
            let meta = TableMeta {
                schema: spec.schema,
                partition_field: spec.partition_field,
                clustering: spec.clustering,
                partition_expiration_ms: spec.partition_expiration.map(|d| d.num_milliseconds()),
            };
            write_framed_atomic(&meta_path, TABLE_MAGIC, TABLE_VERSION, &meta)?;
            events.on_event(PipelineEvent::TableCreated { table: name.clone() });
            meta
        };

        Ok(Self {
            name,
            dir,
            meta: RwLock::new(meta),
            verified: Mutex::new(VerifiedTails::default()),
            events,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn meta(&self) -> Result<TableMeta, IngestError> {
        Ok(self.meta.read()?.clone())
    }

    pub fn schema(&self) -> Result<TableSchema, IngestError> {
        Ok(self.meta.read()?.schema.clone())
    }

    /// Adds every field of `desired` missing from the schema and returns the added names.
    ///
    /// The persisted metadata is re-read first so fields added by another process are kept.
    pub fn update_schema(&self, desired: &[SchemaField]) -> Result<Vec<String>, IngestError> {
        let mut guard = self.meta.write()?;
        let _lock = TableLock::exclusive(&self.dir)?;
        let meta_path = self.dir.join(TABLE_FILE);
        let mut on_disk: TableMeta = read_framed(&meta_path, TABLE_MAGIC, TABLE_VERSION)?;
        let (schema, added) = on_disk.schema.with_missing_fields(desired);
        if !added.is_empty() {
            on_disk.schema = schema;
            write_framed_atomic(&meta_path, TABLE_MAGIC, TABLE_VERSION, &on_disk)
                .map_err(|e| IngestError::Schema(format!("persisting {}: {}", self.name, e)))?;
            self.events.on_event(PipelineEvent::SchemaFieldsAdded {
                table: self.name.clone(),
                fields: added.clone(),
            });
        }
        *guard = on_disk;
        Ok(added)
    }

    /// Changes the partition expiration of an existing table.
    pub fn set_partition_expiration(&self, expiration: Option<Duration>) -> Result<(), IngestError> {
        let mut guard = self.meta.write()?;
        let _lock = TableLock::exclusive(&self.dir)?;
        let meta_path = self.dir.join(TABLE_FILE);
        let mut on_disk: TableMeta = read_framed(&meta_path, TABLE_MAGIC, TABLE_VERSION)?;
        on_disk.partition_expiration_ms = expiration.map(|d| d.num_milliseconds());
        write_framed_atomic(&meta_path, TABLE_MAGIC, TABLE_VERSION, &on_disk)?;
        *guard = on_disk;
        Ok(())
    }

    /// Validates and appends one row.
    ///
    /// Before appending, any bytes past the last verified frame are checked: an incomplete trailing
    /// frame (a write that never finished) is truncated away, while a complete frame failing its
    /// CRC rejects the insert so no row is acknowledged into a partition scans cannot read.
    pub fn insert(&self, row: &Row) -> Result<(), IngestError> {
        let meta = self.meta.read()?;
        meta.schema.validate_row(row)?;
        let ts = row_timestamp(row, &meta.partition_field).map_err(IngestError::Rejected)?;
        let partition = PartitionId::of(ts);
        if partition.is_expired(meta.partition_expiration(), Utc::now()) {
            return Err(IngestError::Rejected(format!(
                "partition {} of {} has expired",
                partition.name(),
                self.name
            )));
        }

        let payload = bincode::serialize(row)?;
        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        push_frame(&mut buf, &payload);

        let mut lock = TableLock::exclusive(&self.dir)?;
        let generation = lock.generation()?;
        let path = self.dir.join(partition.file_name());
        let (mut f, created) = open_partition_for_append(&path)?;
        let valid_len = if created {
            PARTITION_HEADER_LEN as u64
        } else {
            self.verify_tail(partition, &mut f, generation)?
        };
        f.write_all(&buf)?;
        f.sync_data()?;
        if created {
            sync_parent_dir(&path)?;
        }

        let mut verified = self.verified.lock()?;
        if verified.generation != generation {
            verified.lens.clear();
            verified.generation = generation;
        }
        let modified = f.metadata()?.modified().ok();
        verified.lens.insert(
            partition,
            VerifiedLen {
                len: valid_len + buf.len() as u64,
                modified,
            },
        );
        drop(verified);
        drop(lock);
        Ok(())
    }

    /// Rows with partition-column value `>= cutoff`, ascending.
    pub fn scan_since(&self, cutoff: Timestamp) -> Result<Vec<Row>, IngestError> {
        let meta = self.meta.read()?;
        let now = Utc::now();
        let expiration = meta.partition_expiration();
        let field = meta.partition_field.as_str();

        let _lock = TableLock::shared(&self.dir)?;
        let partitions: Vec<PartitionId> = self
            .partitions()?
            .into_iter()
            .filter(|p| p.end() > cutoff && !p.is_expired(expiration, now))
            .collect();

        let chunks = partitions
            .par_iter()
            .map(|p| -> Result<Vec<(Timestamp, Row)>, IngestError> {
                let rows = self.read_partition(*p, field)?;
                Ok(rows.into_iter().filter(|(ts, _)| *ts >= cutoff).collect())
            })
            .collect::<Result<Vec<_>, IngestError>>()?;

        let mut rows: Vec<(Timestamp, Row)> = chunks.into_iter().flatten().collect();
        rows.sort_by_key(|(ts, _)| *ts);
        Ok(rows.into_iter().map(|(_, r)| r).collect())
    }

    /// Rows carrying the largest partition-column value in the table.
    pub fn scan_latest(&self) -> Result<Vec<Row>, IngestError> {
        let meta = self.meta.read()?;
        let now = Utc::now();
        let expiration = meta.partition_expiration();

        let _lock = TableLock::shared(&self.dir)?;
        for p in self.partitions()?.into_iter().rev() {
            if p.is_expired(expiration, now) {
                continue;
            }
            let rows = self.read_partition(p, &meta.partition_field)?;
            let Some(latest) = rows.iter().map(|(ts, _)| *ts).max() else {
                continue;
            };
            return Ok(rows
                .into_iter()
                .filter(|(ts, _)| *ts == latest)
                .map(|(_, r)| r)
                .collect());
        }
        Ok(Vec::new())
    }

    /// Deletes rows with partition-column value `< cutoff` and returns how many were removed.
    ///
    /// Partitions entirely below the cutoff are unlinked; a partition straddling it is rewritten
    /// atomically with the surviving rows in clustering order.
    pub fn delete_where_before(&self, cutoff: Timestamp) -> Result<usize, IngestError> {
        let meta = self.meta.read()?;
        let now = Utc::now();
        let expiration = meta.partition_expiration();

        let mut lock = TableLock::exclusive(&self.dir)?;
        let mut removed = 0usize;
        let mut replaced = false;
        for p in self.partitions()? {
            if p.start() >= cutoff {
                break;
            }
            if p.is_expired(expiration, now) {
                continue;
            }
            let rows = self.read_partition(p, &meta.partition_field)?;
            let before = rows.len();
            let mut kept: Vec<(Timestamp, Row)> =
                rows.into_iter().filter(|(ts, _)| *ts >= cutoff).collect();
            removed += before - kept.len();

            let path = self.dir.join(p.file_name());
            if kept.len() == before && before > 0 {
                continue;
            }
            if !replaced {
                lock.bump_generation()?;
                replaced = true;
            }
            if kept.is_empty() {
                fs::remove_file(&path)?;
                sync_parent_dir(&path)?;
            } else {
                if meta.clustering.iter().any(|c| c == &meta.partition_field) {
                    kept.sort_by_key(|(ts, _)| *ts);
                }
                self.rewrite_partition(p, kept.iter().map(|(_, r)| r))?;
            }
        }
        drop(lock);

        self.events.on_event(PipelineEvent::RetentionApplied {
            table: self.name.clone(),
            delete_before: cutoff,
            removed,
        });
        Ok(removed)
    }

    /// Removes partitions past their expiration and returns their names.
    pub fn expire_partitions(&self, now: Timestamp) -> Result<Vec<String>, IngestError> {
        let meta = self.meta.read()?;
        let expiration = meta.partition_expiration();
        if expiration.is_none() {
            return Ok(Vec::new());
        }

        let mut lock = TableLock::exclusive(&self.dir)?;
        let mut expired = Vec::new();
        for p in self.partitions()? {
            if !p.is_expired(expiration, now) {
                continue;
            }
            if expired.is_empty() {
                lock.bump_generation()?;
            }
            let path = self.dir.join(p.file_name());
            fs::remove_file(&path)?;
            sync_parent_dir(&path)?;
            expired.push(p.name());
        }
        drop(lock);
        if !expired.is_empty() {
            self.events.on_event(PipelineEvent::PartitionsExpired {
                table: self.name.clone(),
                partitions: expired.clone(),
            });
        }
        Ok(expired)
    }

    /// Partitions present on disk, ascending (expired ones included until removed).
    pub fn partitions(&self) -> Result<Vec<PartitionId>, IngestError> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(p) = entry.file_name().to_str().and_then(PartitionId::parse_file_name) {
                out.push(p);
            }
        }
        out.sort();
        Ok(out)
    }

    /// Number of rows visible to scans.
    pub fn row_count(&self) -> Result<usize, IngestError> {
        Ok(self.scan_since(DateTime::<Utc>::MIN_UTC)?.len())
    }

    fn read_partition(
        &self,
        partition: PartitionId,
        field: &str,
    ) -> Result<Vec<(Timestamp, Row)>, IngestError> {
        let name = partition.name();
        let mut bytes = Vec::new();
        File::open(self.dir.join(partition.file_name()))?.read_to_end(&mut bytes)?;
        let rows = decode_partition(&bytes, &name)?;
        rows.into_iter()
            .enumerate()
            .map(|(i, row)| {
                let ts = row_timestamp(&row, field).map_err(|details| IngestError::Corruption {
                    details: format!("row {} of partition {}: {}", i, name, details),
                    partition: Some(name.clone()),
                    offset: None,
                })?;
                Ok((ts, row))
            })
            .collect()
    }

    /// Length of `f` after checking the frames not yet verified under `generation`.
    fn verify_tail(
        &self,
        partition: PartitionId,
        f: &mut File,
        generation: u64,
    ) -> Result<u64, IngestError> {
        let name = partition.name();
        let metadata = f.metadata()?;
        let len = metadata.len();
        let modified = metadata.modified().ok();
        // Growth past the known length is checked incrementally; anything else that touched the
        // file since our last append forces a full check.
        let cached = {
            let verified = self.verified.lock()?;
            match verified.lens.get(&partition) {
                Some(known)
                    if verified.generation == generation
                        && (known.len < len || (known.len == len && known.modified == modified)) =>
                {
                    Some(known.len)
                }
                _ => None,
            }
        };

        let start = match cached {
            Some(known) => known,
            None => {
                let mut header = Vec::with_capacity(PARTITION_HEADER_LEN);
                f.seek(SeekFrom::Start(0))?;
                (&mut *f)
                    .take(PARTITION_HEADER_LEN as u64)
                    .read_to_end(&mut header)?;
                let expected = partition_header();
                if header.len() < PARTITION_HEADER_LEN && expected.starts_with(&header) {
                    // Creation was interrupted before the header was complete.
                    f.set_len(0)?;
                    f.write_all(&expected)?;
                    f.sync_data()?;
                    self.repaired(&name, len);
                    return Ok(PARTITION_HEADER_LEN as u64);
                }
                if header != expected {
                    return Err(IngestError::Rejected(format!(
                        "partition {} of {} has a bad header",
                        name, self.name
                    )));
                }
                PARTITION_HEADER_LEN as u64
            }
        };
        if start == len {
            return Ok(len);
        }

        let mut tail = Vec::new();
        f.seek(SeekFrom::Start(start))?;
        f.read_to_end(&mut tail)?;
        let valid = start + valid_frames_len(&tail, &name, start, &self.name)? as u64;
        if valid < len {
            f.set_len(valid)?;
            f.sync_data()?;
            self.repaired(&name, len - valid);
        }
        Ok(valid)
    }

    fn repaired(&self, partition: &str, truncated_bytes: u64) {
        self.events.on_event(PipelineEvent::PartitionRepaired {
            table: self.name.clone(),
            partition: partition.to_string(),
            truncated_bytes,
        });
    }

    fn rewrite_partition<'a>(
        &self,
        partition: PartitionId,
        rows: impl Iterator<Item = &'a Row>,
    ) -> Result<(), IngestError> {
        let mut buf = partition_header();
        for row in rows {
            let payload = bincode::serialize(row)?;
            push_frame(&mut buf, &payload);
        }

        let final_path = self.dir.join(partition.file_name());
        let tmp_path = self.dir.join(format!("{}.tmp", partition.file_name()));
        let mut w = BufWriter::new(
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?,
        );
        w.write_all(&buf)?;
        w.flush()?;
        w.get_ref().sync_data()?;
        drop(w);

        fs::rename(&tmp_path, &final_path)?;
        sync_parent_dir(&final_path)?;
        Ok(())
    }
}

/// Opens a partition file for appending, creating it with its header when absent.
fn open_partition_for_append(path: &Path) -> Result<(File, bool), IngestError> {
    match OpenOptions::new()
        .read(true)
        .append(true)
        .create_new(true)
        .open(path)
    {
        Ok(mut f) => {
            f.write_all(&partition_header())?;
            Ok((f, true))
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            Ok((OpenOptions::new().read(true).append(true).open(path)?, false))
        }
        Err(e) => Err(e.into()),
    }
}

/// Bytes of `tail` made of complete frames whose CRC checks out.
///
/// An incomplete trailing frame ends the valid prefix; a complete frame with a bad CRC is an error.
fn valid_frames_len(
    tail: &[u8],
    partition: &str,
    base: u64,
    table: &str,
) -> Result<usize, IngestError> {
    let mut off = 0usize;
    while tail.len() - off >= FRAME_HEADER_LEN {
        let len = le_u32(&tail[off..off + 4]) as usize;
        let expected_crc = le_u32(&tail[off + 4..off + 8]);
        let start = off + FRAME_HEADER_LEN;
        let end = match start.checked_add(len) {
            Some(end) if end <= tail.len() => end,
            _ => break,
        };
        let mut hasher = Crc32::new();
        hasher.update(&tail[start..end]);
        if hasher.finalize() != expected_crc {
            return Err(IngestError::Rejected(format!(
                "partition {} of {} is damaged at offset {}",
                partition,
                table,
                base + off as u64
            )));
        }
        off = end;
    }
    Ok(off)
}

fn check_partition_field(schema: &TableSchema, field: &str) -> Result<(), IngestError> {
    match schema.field(field) {
        Some(SchemaField {
            field_type: FieldType::Timestamp,
            mode: FieldMode::Required,
            ..
        }) => Ok(()),
        Some(_) => Err(IngestError::ConfigError(format!(
            "partition column {} must be a REQUIRED TIMESTAMP",
            field
        ))),
        None => Err(IngestError::ConfigError(format!(
            "partition column {} is not in the schema",
            field
        ))),
    }
}

fn row_timestamp(row: &Row, field: &str) -> Result<Timestamp, String> {
    match row.get(field) {
        Some(FieldValue::Timestamp(us)) => {
            micros_to_timestamp(*us).ok_or_else(|| format!("{} out of range: {}", field, us))
        }
        _ => Err(format!("row has no {} timestamp", field)),
    }
}

fn partition_header() -> Vec<u8> {
    let mut buf = Vec::with_capacity(PARTITION_HEADER_LEN);
    buf.extend_from_slice(PARTITION_MAGIC);
    buf.extend_from_slice(&PARTITION_VERSION.to_le_bytes());
    buf
}

fn push_frame(buf: &mut Vec<u8>, payload: &[u8]) {
    let mut hasher = Crc32::new();
    hasher.update(payload);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&hasher.finalize().to_le_bytes());
    buf.extend_from_slice(payload);
}

fn le_u32(b: &[u8]) -> u32 {
    let mut a = [0u8; 4];
    a.copy_from_slice(&b[..4]);
    u32::from_le_bytes(a)
}

fn decode_partition(bytes: &[u8], partition: &str) -> Result<Vec<Row>, IngestError> {
    let corruption = |details: String, offset: usize| IngestError::Corruption {
        details,
        partition: Some(partition.to_string()),
        offset: Some(offset as u64),
    };

    if bytes.len() < PARTITION_HEADER_LEN || &bytes[..8] != PARTITION_MAGIC {
        return Err(corruption(
            format!("bad header in partition {}", partition),
            0,
        ));
    }
    let version = le_u32(&bytes[8..12]);
    if version != PARTITION_VERSION {
        return Err(corruption(
            format!("unsupported version {} in partition {}", version, partition),
            8,
        ));
    }

    let mut rows = Vec::new();
    let mut off = PARTITION_HEADER_LEN;
    while off < bytes.len() {
        if bytes.len() - off < FRAME_HEADER_LEN {
            return Err(corruption(
                format!("torn frame header in partition {} at offset {}", partition, off),
                off,
            ));
        }
        let len = le_u32(&bytes[off..]) as usize;
        let expected_crc = le_u32(&bytes[off + 4..]);
        let start = off + FRAME_HEADER_LEN;
        let end = start
            .checked_add(len)
            .filter(|&e| e <= bytes.len())
            .ok_or_else(|| {
                corruption(
                    format!("truncated frame in partition {} at offset {}", partition, off),
                    off,
                )
            })?;

        let payload = &bytes[start..end];
        let mut hasher = Crc32::new();
        hasher.update(payload);
        if hasher.finalize() != expected_crc {
            return Err(corruption(
                format!("row CRC mismatch in partition {} at offset {}", partition, off),
                off,
            ));
        }
        let row: Row = bincode::deserialize(payload).map_err(|e| {
            corruption(
                format!(
                    "row decode failed in partition {} at offset {}: {}",
                    partition, off, e
                ),
                off,
            )
        })?;
        rows.push(row);
        off = end;
    }
    Ok(rows)
}

fn read_framed<T: DeserializeOwned>(
    path: &Path,
    magic: &[u8; 8],
    version: u32,
) -> Result<T, IngestError> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    let corruption = |details: String| IngestError::Corruption {
        details,
        partition: None,
        offset: None,
    };

    let header = 8 + 4 + 8 + 4;
    if bytes.len() < header || &bytes[..8] != magic {
        return Err(corruption(format!("Bad metadata header in {:?}", path)));
    }
    let found = le_u32(&bytes[8..12]);
    if found != version {
        return Err(corruption(format!(
            "Unsupported metadata version {} in {:?}",
            found, path
        )));
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&bytes[12..20]);
    let len = u64::from_le_bytes(len_bytes) as usize;
    let crc = le_u32(&bytes[20..24]);
    let payload = bytes
        .get(header..)
        .filter(|p| p.len() == len)
        .ok_or_else(|| corruption(format!("Truncated metadata in {:?}", path)))?;

    let mut hasher = Crc32::new();
    hasher.update(payload);
    if hasher.finalize() != crc {
        return Err(corruption(format!("Metadata CRC mismatch in {:?}", path)));
    }
    Ok(bincode::deserialize(payload)?)
}

fn write_framed_atomic<T: Serialize>(
    path: &Path,
    magic: &[u8; 8],
    version: u32,
    value: &T,
) -> Result<(), IngestError> {
    let bytes = bincode::serialize(value)?;
    let mut hasher = Crc32::new();
    hasher.update(&bytes);
    let crc = hasher.finalize();

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| IngestError::Internal(format!("Bad metadata path {:?}", path)))?;
    // Unique per writer: several instances may evolve the same table concurrently.
    let tmp_path = path.with_file_name(format!(
        "{}.{}-{}.tmp",
        file_name,
        std::process::id(),
        TMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    let mut w = BufWriter::new(
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?,
    );
    w.write_all(magic)?;
    w.write_all(&version.to_le_bytes())?;
    w.write_all(&(bytes.len() as u64).to_le_bytes())?;
    w.write_all(&crc.to_le_bytes())?;
    w.write_all(&bytes)?;
    w.flush()?;
    w.get_ref().sync_data()?;
    drop(w);

    fs::rename(&tmp_path, path)?;
    sync_parent_dir(path)?;
    Ok(())
}

fn sync_parent_dir(path: &Path) -> Result<(), IngestError> {
    let parent = path
        .parent()
        .ok_or_else(|| IngestError::Internal("Missing parent dir".to_string()))?;
    let dir = File::open(parent)?;
    dir.sync_data()?;
    Ok(())
}

//! Persistent ordered engine backed by an append-only commit log.

use crate::engine::{bounds_overlap, BatchOp, KvEngine};
use crate::error::{StorageError, StorageResult};
use crate::memory::apply_batch_to_map;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};

/// Magic bytes identifying a commit log record.
const LOG_MAGIC: [u8; 4] = *b"SKVL";

/// Current commit log format version.
const LOG_VERSION: u16 = 1;

/// Record header size: magic (4) + version (2) + type (1) + length (4).
const HEADER_SIZE: usize = 11;

/// CRC trailer size.
const CRC_SIZE: usize = 4;

/// A batch of operations appended by `apply`.
const RECORD_BATCH: u8 = 1;

/// A full-state snapshot written by compaction. Replay clears the map
/// before applying its operations.
const RECORD_SNAPSHOT: u8 = 2;

/// Op tags inside a record payload.
const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;
const OP_DELETE_PREFIX: u8 = 3;

/// Computes a CRC32 checksum (IEEE polynomial) of the given data.
#[must_use]
pub(crate) fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    crc ^ 0xFFFF_FFFF
}

/// Configuration for [`LogEngine`].
#[derive(Debug, Clone)]
pub struct LogEngineConfig {
    /// Whether to fsync the log after every applied batch (safer but slower).
    pub sync_on_apply: bool,

    /// Compact the log once it grows past this many bytes (0 = never).
    pub compact_threshold: u64,
}

impl Default for LogEngineConfig {
    fn default() -> Self {
        Self {
            sync_on_apply: true,
            compact_threshold: 64 * 1024 * 1024, // 64 MB
        }
    }
}

impl LogEngineConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to fsync after every batch.
    #[must_use]
    pub const fn sync_on_apply(mut self, value: bool) -> Self {
        self.sync_on_apply = value;
        self
    }

    /// Sets the compaction threshold in bytes.
    #[must_use]
    pub const fn compact_threshold(mut self, bytes: u64) -> Self {
        self.compact_threshold = bytes;
        self
    }
}

struct LogFile {
    file: File,
    len: u64,
}

/// A persistent ordered engine.
///
/// The full key space lives in memory; durability comes from an append-only
/// commit log holding one framed record per applied batch. On open the log
/// is replayed in order; a torn or corrupt tail is truncated at the last
/// valid record. Once the log exceeds its compaction threshold it is
/// rewritten as a single snapshot record via a temp file and atomic rename.
pub struct LogEngine {
    path: PathBuf,
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    log: Mutex<LogFile>,
    config: LogEngineConfig,
}

impl LogEngine {
    /// Opens or creates a commit log at `path` with default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or an already-replayed
    /// region of the log is corrupt.
    pub fn open(path: &Path) -> StorageResult<Self> {
        Self::open_with_config(path, LogEngineConfig::default())
    }

    /// Opens or creates a commit log at `path`.
    pub fn open_with_config(path: &Path, config: LogEngineConfig) -> StorageResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let (data, valid_len) = Self::replay(&mut file)?;

        // Drop any torn tail so future appends start at a record boundary.
        let file_len = file.metadata()?.len();
        if valid_len < file_len {
            file.set_len(valid_len)?;
        }
        file.seek(SeekFrom::End(0))?;

        Ok(Self {
            path: path.to_path_buf(),
            data: RwLock::new(data),
            log: Mutex::new(LogFile {
                file,
                len: valid_len,
            }),
            config,
        })
    }

    /// Replays the log, returning the recovered map and the byte length of
    /// the valid record region.
    fn replay(file: &mut File) -> StorageResult<(BTreeMap<Vec<u8>, Vec<u8>>, u64)> {
        let mut bytes = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut bytes)?;

        let mut map = BTreeMap::new();
        let mut offset = 0usize;

        while bytes.len() - offset >= HEADER_SIZE + CRC_SIZE {
            let header = &bytes[offset..offset + HEADER_SIZE];
            if header[0..4] != LOG_MAGIC {
                break;
            }
            let version = u16::from_le_bytes([header[4], header[5]]);
            if version != LOG_VERSION {
                return Err(StorageError::log_corruption(
                    offset as u64,
                    format!("unsupported log version {version}"),
                ));
            }
            let record_type = header[6];
            let payload_len =
                u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;

            let record_end = offset + HEADER_SIZE + payload_len + CRC_SIZE;
            if record_end > bytes.len() {
                // Torn tail: the record was never fully written.
                break;
            }

            let body = &bytes[offset..offset + HEADER_SIZE + payload_len];
            let crc_bytes = &bytes[offset + HEADER_SIZE + payload_len..record_end];
            let expected = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
            if compute_crc32(body) != expected {
                break;
            }

            let payload = &bytes[offset + HEADER_SIZE..offset + HEADER_SIZE + payload_len];
            let batch = decode_ops(payload, offset as u64)?;
            if record_type == RECORD_SNAPSHOT {
                map.clear();
            }
            apply_batch_to_map(&mut map, &batch);

            offset = record_end;
        }

        Ok((map, offset as u64))
    }

    /// Encodes a framed record for the given batch.
    fn encode_record(record_type: u8, batch: &[BatchOp]) -> Vec<u8> {
        let payload = encode_ops(batch);
        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        data.extend_from_slice(&LOG_MAGIC);
        data.extend_from_slice(&LOG_VERSION.to_le_bytes());
        data.push(record_type);
        data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        data.extend_from_slice(&payload);
        let crc = compute_crc32(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        data
    }

    /// Rewrites the log as a single snapshot of the current map.
    ///
    /// The snapshot goes to a temp file first and replaces the log with an
    /// atomic rename, so a crash mid-compaction leaves the old log intact.
    pub fn compact(&self) -> StorageResult<()> {
        let mut log = self.log.lock();
        let data = self.data.read();

        let snapshot: Vec<BatchOp> = data
            .iter()
            .map(|(k, v)| BatchOp::put(k.clone(), v.clone()))
            .collect();
        let record = Self::encode_record(RECORD_SNAPSHOT, &snapshot);
        drop(data);

        let tmp_path = self.path.with_extension("compact");
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(&record)?;
        tmp.sync_all()?;
        std::fs::rename(&tmp_path, &self.path)?;

        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        file.seek(SeekFrom::End(0))?;
        log.file = file;
        log.len = record.len() as u64;
        Ok(())
    }

    /// Returns the current log size in bytes.
    pub fn log_size(&self) -> u64 {
        self.log.lock().len
    }
}

fn encode_ops(batch: &[BatchOp]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(batch.len() as u32).to_le_bytes());
    for op in batch {
        match op {
            BatchOp::Put { key, value } => {
                buf.push(OP_PUT);
                buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
                buf.extend_from_slice(key);
                buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
                buf.extend_from_slice(value);
            }
            BatchOp::Delete { key } => {
                buf.push(OP_DELETE);
                buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
                buf.extend_from_slice(key);
            }
            BatchOp::DeletePrefix { prefix } => {
                buf.push(OP_DELETE_PREFIX);
                buf.extend_from_slice(&(prefix.len() as u32).to_le_bytes());
                buf.extend_from_slice(prefix);
            }
        }
    }
    buf
}

fn decode_ops(payload: &[u8], record_offset: u64) -> StorageResult<Vec<BatchOp>> {
    let corrupt =
        |message: &str| StorageError::log_corruption(record_offset, message.to_string());

    let mut pos = 0usize;
    let read_u32 = |payload: &[u8], pos: &mut usize| -> StorageResult<usize> {
        if payload.len() - *pos < 4 {
            return Err(corrupt("truncated length field"));
        }
        let value = u32::from_le_bytes([
            payload[*pos],
            payload[*pos + 1],
            payload[*pos + 2],
            payload[*pos + 3],
        ]) as usize;
        *pos += 4;
        Ok(value)
    };
    let read_bytes = |payload: &[u8], pos: &mut usize, len: usize| -> StorageResult<Vec<u8>> {
        if payload.len() - *pos < len {
            return Err(corrupt("truncated byte field"));
        }
        let bytes = payload[*pos..*pos + len].to_vec();
        *pos += len;
        Ok(bytes)
    };

    let count = read_u32(payload, &mut pos)?;
    let mut batch = Vec::with_capacity(count);
    for _ in 0..count {
        if payload.len() - pos < 1 {
            return Err(corrupt("truncated op tag"));
        }
        let tag = payload[pos];
        pos += 1;
        match tag {
            OP_PUT => {
                let klen = read_u32(payload, &mut pos)?;
                let key = read_bytes(payload, &mut pos, klen)?;
                let vlen = read_u32(payload, &mut pos)?;
                let value = read_bytes(payload, &mut pos, vlen)?;
                batch.push(BatchOp::Put { key, value });
            }
            OP_DELETE => {
                let klen = read_u32(payload, &mut pos)?;
                let key = read_bytes(payload, &mut pos, klen)?;
                batch.push(BatchOp::Delete { key });
            }
            OP_DELETE_PREFIX => {
                let plen = read_u32(payload, &mut pos)?;
                let prefix = read_bytes(payload, &mut pos, plen)?;
                batch.push(BatchOp::DeletePrefix { prefix });
            }
            other => {
                return Err(StorageError::log_corruption(
                    record_offset,
                    format!("unknown op tag {other}"),
                ));
            }
        }
    }
    Ok(batch)
}

impl KvEngine for LogEngine {
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn scan(
        &self,
        lower: Bound<Vec<u8>>,
        upper: Bound<Vec<u8>>,
    ) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>> {
        if !bounds_overlap(&lower, &upper) {
            return Ok(Vec::new());
        }
        Ok(self
            .data
            .read()
            .range::<Vec<u8>, _>((lower, upper))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn scan_keys(
        &self,
        lower: Bound<Vec<u8>>,
        upper: Bound<Vec<u8>>,
    ) -> StorageResult<Vec<Vec<u8>>> {
        if !bounds_overlap(&lower, &upper) {
            return Ok(Vec::new());
        }
        Ok(self
            .data
            .read()
            .range::<Vec<u8>, _>((lower, upper))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn first_key(
        &self,
        lower: Bound<Vec<u8>>,
        upper: Bound<Vec<u8>>,
    ) -> StorageResult<Option<Vec<u8>>> {
        if !bounds_overlap(&lower, &upper) {
            return Ok(None);
        }
        Ok(self
            .data
            .read()
            .range::<Vec<u8>, _>((lower, upper))
            .next()
            .map(|(k, _)| k.clone()))
    }

    fn last_key(
        &self,
        lower: Bound<Vec<u8>>,
        upper: Bound<Vec<u8>>,
    ) -> StorageResult<Option<Vec<u8>>> {
        if !bounds_overlap(&lower, &upper) {
            return Ok(None);
        }
        Ok(self
            .data
            .read()
            .range::<Vec<u8>, _>((lower, upper))
            .next_back()
            .map(|(k, _)| k.clone()))
    }

    fn count(&self, lower: Bound<Vec<u8>>, upper: Bound<Vec<u8>>) -> StorageResult<usize> {
        if !bounds_overlap(&lower, &upper) {
            return Ok(0);
        }
        Ok(self.data.read().range::<Vec<u8>, _>((lower, upper)).count())
    }

    fn apply(&self, batch: &[BatchOp]) -> StorageResult<()> {
        let record = Self::encode_record(RECORD_BATCH, batch);

        // Durability first: the map only changes once the record is on disk.
        let mut log = self.log.lock();
        log.file.write_all(&record)?;
        if self.config.sync_on_apply {
            log.file.sync_data()?;
        }
        log.len += record.len() as u64;
        let needs_compaction =
            self.config.compact_threshold > 0 && log.len > self.config.compact_threshold;

        {
            let mut map = self.data.write();
            apply_batch_to_map(&mut map, batch);
        }
        drop(log);

        if needs_compaction {
            self.compact()?;
        }
        Ok(())
    }

    fn sync(&self) -> StorageResult<()> {
        self.log.lock().file.sync_all()?;
        Ok(())
    }

    fn len(&self) -> StorageResult<usize> {
        Ok(self.data.read().len())
    }
}

impl std::fmt::Debug for LogEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogEngine")
            .field("path", &self.path)
            .field("log_size", &self.log_size())
            .finish_non_exhaustive()
    }
}

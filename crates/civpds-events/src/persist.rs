//! Event persistence for replay.
//!
//! A [`Persister`] assigns sequence numbers and stores every sequenced
//! frame so that subscribers joining with a cursor can be replayed.
//!
//! [`DiskPersister`] keeps an append-only log split into segment files.
//! Each record is framed as:
//!
//! ```text
//! [4 bytes: frame length (little-endian u32)]
//! [4 bytes: CRC32 of frame (little-endian u32)]
//! [N bytes: frame]
//! ```
//!
//! The `seq -> (segment, offset)` index is rebuilt on open. A torn record
//! at the end of the newest segment is truncated away; a record that fails
//! its CRC elsewhere is skipped.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::error::{EventError, EventResult};
use crate::event::StreamEvent;
use crate::frame::EventFrame;

/// Stores sequenced events and serves them back in order.
#[async_trait]
pub trait Persister: Send + Sync {
    /// Assign the next sequence number to `event`, store it and return the
    /// encoded frame. Sequence-less events are framed but not stored.
    async fn persist(&self, event: StreamEvent) -> EventResult<Arc<EventFrame>>;

    /// Up to `limit` stored events with `seq > after`, oldest first.
    async fn playback(&self, after: i64, limit: usize) -> EventResult<Vec<Arc<EventFrame>>>;

    /// Highest stored sequence number.
    async fn last_seq(&self) -> EventResult<Option<i64>>;

    /// Make all persisted events durable.
    async fn flush(&self) -> EventResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory persister
// ---------------------------------------------------------------------------

struct MemState {
    next_seq: i64,
    events: Vec<Arc<EventFrame>>,
}

/// Keeps every event in memory. Used in tests and when no event directory
/// is configured.
pub struct MemPersister {
    state: Mutex<MemState>,
}

impl MemPersister {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemState {
                next_seq: 1,
                events: Vec::new(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("lock poisoned").events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemPersister {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Persister for MemPersister {
    async fn persist(&self, mut event: StreamEvent) -> EventResult<Arc<EventFrame>> {
        if event.seq().is_none() {
            return Ok(Arc::new(EventFrame::new(event)?));
        }
        let mut state = self.state.lock().expect("lock poisoned");
        event.set_seq(state.next_seq);
        let frame = Arc::new(EventFrame::new(event)?);
        state.next_seq += 1;
        state.events.push(frame.clone());
        Ok(frame)
    }

    async fn playback(&self, after: i64, limit: usize) -> EventResult<Vec<Arc<EventFrame>>> {
        let state = self.state.lock().expect("lock poisoned");
        // Seqs are dense from 1, so the first event past `after` is at index `after`.
        let start = after.clamp(0, state.events.len() as i64) as usize;
        Ok(state.events[start..].iter().take(limit).cloned().collect())
    }

    async fn last_seq(&self) -> EventResult<Option<i64>> {
        let state = self.state.lock().expect("lock poisoned");
        Ok(state.events.last().and_then(|f| f.seq()))
    }
}

// ---------------------------------------------------------------------------
// Disk persister
// ---------------------------------------------------------------------------

/// Header size: 4 bytes length + 4 bytes CRC.
const HEADER_SIZE: u64 = 8;

const SEGMENT_EXT: &str = "evlog";

/// Flush strategy for the event log.
#[derive(Clone, Debug, Default)]
pub enum SyncMode {
    /// `fsync` after every append.
    EveryWrite,
    /// Rely on OS page-cache buffering.
    #[default]
    OsDefault,
}

/// Configuration for [`DiskPersister`].
#[derive(Clone, Debug)]
pub struct DiskPersisterConfig {
    /// Roll to a new segment once the current one exceeds this size.
    pub max_segment_bytes: u64,
    pub sync_mode: SyncMode,
}

impl Default for DiskPersisterConfig {
    fn default() -> Self {
        Self {
            max_segment_bytes: 64 * 1024 * 1024, // 64 MiB
            sync_mode: SyncMode::default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Location {
    /// First seq of the segment, which names its file.
    segment: i64,
    offset: u64,
    len: u32,
}

struct Writer {
    segment: i64,
    file: BufWriter<File>,
    offset: u64,
}

struct DiskState {
    next_seq: i64,
    index: BTreeMap<i64, Location>,
    writer: Option<Writer>,
}

struct DiskInner {
    dir: PathBuf,
    config: DiskPersisterConfig,
    state: Mutex<DiskState>,
}

/// Segmented append-only event log on local disk.
#[derive(Clone)]
pub struct DiskPersister {
    inner: Arc<DiskInner>,
}

fn segment_path(dir: &Path, segment: i64) -> PathBuf {
    dir.join(format!("{segment:020}.{SEGMENT_EXT}"))
}

fn list_segments(dir: &Path) -> io::Result<Vec<i64>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXT) {
            continue;
        }
        if let Some(id) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<i64>().ok())
        {
            segments.push(id);
        }
    }
    segments.sort_unstable();
    Ok(segments)
}

/// Scan one segment, adding every valid record to `index`. Returns the
/// offset just past the last complete record.
fn scan_segment(
    path: &Path,
    segment: i64,
    index: &mut BTreeMap<i64, Location>,
) -> EventResult<u64> {
    let mut file = BufReader::new(File::open(path)?);
    let file_len = file.get_ref().metadata()?.len();
    let mut offset = 0u64;

    while offset + HEADER_SIZE <= file_len {
        file.seek(SeekFrom::Start(offset))?;
        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)?;
        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let expected = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        if length == 0 || offset + HEADER_SIZE + u64::from(length) > file_len {
            break;
        }
        let mut frame = vec![0u8; length as usize];
        file.read_exact(&mut frame)?;

        let actual = crc32fast::hash(&frame);
        if actual != expected {
            let err = EventError::CrcMismatch {
                offset,
                expected,
                actual,
            };
            warn!(segment, error = %err, "skipping corrupt event record");
        } else {
            match EventFrame::decode(Bytes::from(frame)) {
                Ok(event) => {
                    if let Some(seq) = event.seq() {
                        index.insert(
                            seq,
                            Location {
                                segment,
                                offset,
                                len: length,
                            },
                        );
                    }
                }
                Err(e) => warn!(segment, offset, error = %e, "skipping undecodable event record"),
            }
        }
        offset += HEADER_SIZE + u64::from(length);
    }
    Ok(offset)
}

fn read_record(file: &mut File, loc: &Location) -> EventResult<Bytes> {
    file.seek(SeekFrom::Start(loc.offset))?;
    let mut header = [0u8; HEADER_SIZE as usize];
    file.read_exact(&mut header)?;
    let expected = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    let mut frame = vec![0u8; loc.len as usize];
    file.read_exact(&mut frame)?;
    let actual = crc32fast::hash(&frame);
    if actual != expected {
        return Err(EventError::CrcMismatch {
            offset: loc.offset,
            expected,
            actual,
        });
    }
    Ok(Bytes::from(frame))
}

impl DiskPersister {
    /// Open (or create) the log in `dir`, rebuilding the index.
    pub fn open(dir: impl AsRef<Path>, config: DiskPersisterConfig) -> EventResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let segments = list_segments(&dir)?;
        let mut index = BTreeMap::new();
        let mut writer = None;
        for (i, &segment) in segments.iter().enumerate() {
            let path = segment_path(&dir, segment);
            let valid_end = scan_segment(&path, segment, &mut index)?;
            if i + 1 == segments.len() {
                let file = OpenOptions::new().read(true).write(true).open(&path)?;
                let len = file.metadata()?.len();
                if valid_end < len {
                    warn!(
                        segment,
                        valid_end,
                        len,
                        "truncating torn tail of event log"
                    );
                    file.set_len(valid_end)?;
                }
                let mut file = BufWriter::new(file);
                file.seek(SeekFrom::Start(valid_end))?;
                writer = Some(Writer {
                    segment,
                    file,
                    offset: valid_end,
                });
            }
        }

        let next_seq = index.keys().next_back().map(|s| s + 1).unwrap_or(1);
        info!(
            dir = %dir.display(),
            segments = segments.len(),
            events = index.len(),
            next_seq,
            "opened event log"
        );
        Ok(Self {
            inner: Arc::new(DiskInner {
                dir,
                config,
                state: Mutex::new(DiskState {
                    next_seq,
                    index,
                    writer,
                }),
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Number of indexed events.
    pub fn len(&self) -> usize {
        self.inner.state.lock().expect("lock poisoned").index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn append(inner: &DiskInner, mut event: StreamEvent) -> EventResult<Arc<EventFrame>> {
        let mut state = inner.state.lock().expect("lock poisoned");
        let seq = state.next_seq;
        event.set_seq(seq);
        let frame = EventFrame::new(event)?;
        let length = u32::try_from(frame.bytes.len())
            .map_err(|_| EventError::Frame(format!("frame of {} bytes", frame.bytes.len())))?;

        let roll = match &state.writer {
            None => true,
            Some(w) => w.offset > 0 && w.offset >= inner.config.max_segment_bytes,
        };
        if roll {
            let path = segment_path(&inner.dir, seq);
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            debug!(segment = seq, "started event log segment");
            state.writer = Some(Writer {
                segment: seq,
                file: BufWriter::new(file),
                offset: 0,
            });
        }
        let Some(w) = state.writer.as_mut() else {
            return Err(EventError::Closed);
        };

        let offset = w.offset;
        w.file.write_all(&length.to_le_bytes())?;
        w.file.write_all(&crc32fast::hash(&frame.bytes).to_le_bytes())?;
        w.file.write_all(&frame.bytes)?;
        w.file.flush()?;
        if matches!(inner.config.sync_mode, SyncMode::EveryWrite) {
            w.file.get_ref().sync_all()?;
        }
        w.offset += HEADER_SIZE + u64::from(length);
        let segment = w.segment;

        state.index.insert(
            seq,
            Location {
                segment,
                offset,
                len: length,
            },
        );
        state.next_seq += 1;
        Ok(Arc::new(frame))
    }

    fn read_range(inner: &DiskInner, after: i64, limit: usize) -> EventResult<Vec<Arc<EventFrame>>> {
        let locations: Vec<Location> = {
            let state = inner.state.lock().expect("lock poisoned");
            state
                .index
                .range(after.saturating_add(1)..)
                .take(limit)
                .map(|(_, loc)| *loc)
                .collect()
        };

        let mut out = Vec::with_capacity(locations.len());
        let mut open: Option<(i64, File)> = None;
        for loc in locations {
            let mut file = match open.take() {
                Some((segment, file)) if segment == loc.segment => file,
                _ => File::open(segment_path(&inner.dir, loc.segment))?,
            };
            let bytes = read_record(&mut file, &loc)?;
            out.push(Arc::new(EventFrame::decode(bytes)?));
            open = Some((loc.segment, file));
        }
        Ok(out)
    }
}

async fn blocking<T, F>(f: F) -> EventResult<T>
where
    F: FnOnce() -> EventResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EventError::Io(io::Error::other(e)))?
}

#[async_trait]
impl Persister for DiskPersister {
    async fn persist(&self, event: StreamEvent) -> EventResult<Arc<EventFrame>> {
        if event.seq().is_none() {
            return Ok(Arc::new(EventFrame::new(event)?));
        }
        let inner = self.inner.clone();
        blocking(move || Self::append(&inner, event)).await
    }

    async fn playback(&self, after: i64, limit: usize) -> EventResult<Vec<Arc<EventFrame>>> {
        let inner = self.inner.clone();
        blocking(move || Self::read_range(&inner, after, limit)).await
    }

    async fn last_seq(&self) -> EventResult<Option<i64>> {
        let state = self.inner.state.lock().expect("lock poisoned");
        Ok(state.index.keys().next_back().copied())
    }

    async fn flush(&self) -> EventResult<()> {
        let inner = self.inner.clone();
        blocking(move || {
            let mut state = inner.state.lock().expect("lock poisoned");
            if let Some(w) = state.writer.as_mut() {
                w.file.flush()?;
                w.file.get_ref().sync_all()?;
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{now_rfc3339, InfoEvent, TombstoneEvent};

    fn tombstone(did: &str) -> StreamEvent {
        StreamEvent::Tombstone(TombstoneEvent {
            seq: 0,
            did: did.into(),
            time: now_rfc3339(),
        })
    }

    fn seqs(frames: &[Arc<EventFrame>]) -> Vec<i64> {
        frames.iter().filter_map(|f| f.seq()).collect()
    }

    // ----------------------------------------------------------------
    // Memory
    // ----------------------------------------------------------------

    #[tokio::test]
    async fn mem_assigns_dense_seqs_and_plays_back() {
        let p = MemPersister::new();
        for i in 0..5 {
            let frame = p.persist(tombstone(&format!("did:plc:{i}"))).await.unwrap();
            assert_eq!(frame.seq(), Some(i + 1));
        }
        assert_eq!(seqs(&p.playback(0, 100).await.unwrap()), vec![1, 2, 3, 4, 5]);
        assert_eq!(seqs(&p.playback(3, 100).await.unwrap()), vec![4, 5]);
        assert_eq!(seqs(&p.playback(1, 2).await.unwrap()), vec![2, 3]);
        assert!(p.playback(5, 10).await.unwrap().is_empty());
        assert_eq!(p.last_seq().await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn sequence_less_events_are_not_stored() {
        let p = MemPersister::new();
        let frame = p
            .persist(StreamEvent::Info(InfoEvent {
                name: "hello".into(),
                message: None,
            }))
            .await
            .unwrap();
        assert_eq!(frame.seq(), None);
        assert!(p.is_empty());
    }

    // ----------------------------------------------------------------
    // Disk
    // ----------------------------------------------------------------

    #[tokio::test]
    async fn disk_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let p = DiskPersister::open(dir.path(), DiskPersisterConfig::default()).unwrap();
            for i in 0..10 {
                p.persist(tombstone(&format!("did:plc:{i}"))).await.unwrap();
            }
            p.flush().await.unwrap();
        }
        let p = DiskPersister::open(dir.path(), DiskPersisterConfig::default()).unwrap();
        assert_eq!(p.len(), 10);
        assert_eq!(p.last_seq().await.unwrap(), Some(10));
        let frames = p.playback(7, 100).await.unwrap();
        assert_eq!(seqs(&frames), vec![8, 9, 10]);
        assert_eq!(frames[0].event.repo(), Some("did:plc:7"));

        let next = p.persist(tombstone("did:plc:x")).await.unwrap();
        assert_eq!(next.seq(), Some(11));
    }

    #[tokio::test]
    async fn disk_rolls_segments() {
        let dir = tempfile::tempdir().unwrap();
        let config = DiskPersisterConfig {
            max_segment_bytes: 256,
            ..DiskPersisterConfig::default()
        };
        let p = DiskPersister::open(dir.path(), config.clone()).unwrap();
        for i in 0..30 {
            p.persist(tombstone(&format!("did:plc:{i}"))).await.unwrap();
        }
        assert!(list_segments(dir.path()).unwrap().len() > 1);
        assert_eq!(seqs(&p.playback(0, 100).await.unwrap()), (1..=30).collect::<Vec<_>>());

        drop(p);
        let p = DiskPersister::open(dir.path(), config).unwrap();
        assert_eq!(seqs(&p.playback(25, 100).await.unwrap()), vec![26, 27, 28, 29, 30]);
    }

    #[tokio::test]
    async fn torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        {
            let p = DiskPersister::open(dir.path(), DiskPersisterConfig::default()).unwrap();
            for i in 0..3 {
                p.persist(tombstone(&format!("did:plc:{i}"))).await.unwrap();
            }
        }
        let segment = segment_path(dir.path(), 1);
        let len = fs::metadata(&segment).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&segment)
            .unwrap()
            .set_len(len - 3)
            .unwrap();

        let p = DiskPersister::open(dir.path(), DiskPersisterConfig::default()).unwrap();
        assert_eq!(p.len(), 2);
        let next = p.persist(tombstone("did:plc:new")).await.unwrap();
        assert_eq!(next.seq(), Some(3));

        drop(p);
        let p = DiskPersister::open(dir.path(), DiskPersisterConfig::default()).unwrap();
        let frames = p.playback(0, 10).await.unwrap();
        assert_eq!(seqs(&frames), vec![1, 2, 3]);
        assert_eq!(frames[2].event.repo(), Some("did:plc:new"));
    }

    #[tokio::test]
    async fn corrupt_record_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        {
            let p = DiskPersister::open(dir.path(), DiskPersisterConfig::default()).unwrap();
            for i in 0..3 {
                p.persist(tombstone(&format!("did:plc:{i}"))).await.unwrap();
            }
        }
        let segment = segment_path(dir.path(), 1);
        let mut file = OpenOptions::new().read(true).write(true).open(&segment).unwrap();
        file.seek(SeekFrom::Start(HEADER_SIZE + 2)).unwrap();
        let mut buf = [0u8; 1];
        file.read_exact(&mut buf).unwrap();
        buf[0] ^= 0xFF;
        file.seek(SeekFrom::Start(HEADER_SIZE + 2)).unwrap();
        file.write_all(&buf).unwrap();
        file.sync_all().unwrap();
        drop(file);

        let p = DiskPersister::open(dir.path(), DiskPersisterConfig::default()).unwrap();
        assert_eq!(seqs(&p.playback(0, 10).await.unwrap()), vec![2, 3]);
    }
}

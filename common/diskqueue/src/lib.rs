//! A persistent, capacity-bounded FIFO of opaque records.
//!
//! Records live in segment files named `seg-<sequence>.dat`, each record is a
//! little endian `u32` length followed by the payload. The reader position is
//! kept in `read.pos` so a restarted process resumes where it stopped.
//!
//! `put` only returns once the record is on disk. When the total size goes
//! over capacity, whole segments are dropped from the head of the queue.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;
use tracing::{debug, info, warn};

const HEADER_BYTES: u64 = 4;
const POSITION_FILE: &str = "read.pos";
const SEGMENT_PREFIX: &str = "seg-";
const SEGMENT_SUFFIX: &str = ".dat";

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue is empty")]
    Eof,
    #[error("record of {size} bytes does not fit in a queue of {capacity} bytes")]
    TooLarge { size: u64, capacity: u64 },
    #[error("queue io error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupted segment {path:?}: {reason}")]
    Corrupted { path: PathBuf, reason: String },
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub path: PathBuf,
    pub capacity_bytes: u64,
    pub segment_bytes: u64,
    pub clear_on_start: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub bytes: u64,
    pub segments: usize,
    pub dropped_records: u64,
}

#[derive(Debug)]
struct Segment {
    seq: u64,
    bytes: u64,
    records: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct ReadPosition {
    seq: u64,
    offset: u64,
    // records consumed in the segment at `seq`
    consumed: u64,
}

struct Inner {
    config: QueueConfig,
    segments: VecDeque<Segment>,
    writer: Option<File>,
    position: ReadPosition,
    total_bytes: u64,
    dropped_records: u64,
}

pub struct DiskQueue {
    inner: Mutex<Inner>,
}

fn segment_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("{SEGMENT_PREFIX}{seq:020}{SEGMENT_SUFFIX}"))
}

fn parse_segment_name(name: &str) -> Option<u64> {
    name.strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse()
        .ok()
}

/// Walks the record headers of a segment, returns the end of the last complete
/// record, how many records it holds, and how many records end before `stop_at`.
fn scan_segment(path: &Path, stop_at: u64) -> io::Result<(u64, u64, u64)> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let mut offset = 0;
    let mut records = 0;
    let mut before = 0;
    let mut header = [0u8; HEADER_BYTES as usize];
    while offset + HEADER_BYTES <= len {
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut header)?;
        let end = offset + HEADER_BYTES + u64::from(u32::from_le_bytes(header));
        if end > len {
            break;
        }
        offset = end;
        records += 1;
        if end <= stop_at {
            before += 1;
        }
    }
    Ok((offset, records, before))
}

impl DiskQueue {
    pub fn open(config: QueueConfig) -> Result<Self, QueueError> {
        if config.clear_on_start && config.path.exists() {
            info!("clearing disk queue at {:?}", config.path);
            fs::remove_dir_all(&config.path)?;
        }
        fs::create_dir_all(&config.path)?;

        let mut seqs: Vec<u64> = fs::read_dir(&config.path)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str().and_then(parse_segment_name))
            .collect();
        seqs.sort_unstable();

        let mut position = read_position(&config.path)?;
        if let Some(first) = seqs.first() {
            if position.seq < *first {
                position = ReadPosition {
                    seq: *first,
                    ..Default::default()
                };
            }
        }

        let mut segments = VecDeque::with_capacity(seqs.len());
        let mut total_bytes = 0;
        let last = seqs.last().copied();
        for seq in seqs {
            let path = segment_path(&config.path, seq);
            let stop_at = if seq == position.seq { position.offset } else { 0 };
            let (bytes, records, before) = scan_segment(&path, stop_at)?;
            let on_disk = fs::metadata(&path)?.len();
            if bytes < on_disk {
                warn!(
                    "segment {:?} has a truncated tail ({} of {} bytes valid)",
                    path, bytes, on_disk
                );
                if Some(seq) == last {
                    OpenOptions::new().write(true).open(&path)?.set_len(bytes)?;
                }
            }
            if seq == position.seq {
                position.offset = position.offset.min(bytes);
                position.consumed = before;
            }
            total_bytes += bytes;
            segments.push_back(Segment {
                seq,
                bytes,
                records,
            });
        }

        let writer = match segments.back() {
            Some(segment) => Some(
                OpenOptions::new()
                    .append(true)
                    .open(segment_path(&config.path, segment.seq))?,
            ),
            None => None,
        };

        info!(
            "opened disk queue at {:?}: {} segments, {} bytes",
            config.path,
            segments.len(),
            total_bytes
        );

        Ok(Self {
            inner: Mutex::new(Inner {
                config,
                segments,
                writer,
                position,
                total_bytes,
                dropped_records: 0,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends a record and syncs it to disk.
    pub fn put(&self, payload: &[u8]) -> Result<(), QueueError> {
        self.lock().put(payload)
    }

    /// Hands the oldest record to `f`. The record is consumed before `f` runs,
    /// returns `QueueError::Eof` when there is nothing to read.
    pub fn get<F, R>(&self, f: F) -> Result<R, QueueError>
    where
        F: FnOnce(&[u8]) -> R,
    {
        let payload = self.lock().pop()?;
        Ok(f(&payload))
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.lock();
        QueueStats {
            bytes: inner.total_bytes,
            segments: inner.segments.len(),
            dropped_records: inner.dropped_records,
        }
    }
}

fn read_position(dir: &Path) -> Result<ReadPosition, QueueError> {
    let path = dir.join(POSITION_FILE);
    let raw = match fs::read(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(ReadPosition::default()),
        Err(err) => return Err(err.into()),
    };
    let (Ok(seq), Ok(offset)) = (
        <[u8; 8]>::try_from(&raw[..raw.len().min(8)]),
        <[u8; 8]>::try_from(&raw[raw.len().min(8)..]),
    ) else {
        warn!(
            "ignoring {:?}: expected 16 bytes, found {}; reading from the oldest segment",
            path,
            raw.len()
        );
        return Ok(ReadPosition::default());
    };
    let (seq, offset) = (u64::from_le_bytes(seq), u64::from_le_bytes(offset));
    Ok(ReadPosition {
        seq,
        offset,
        consumed: 0,
    })
}

impl Inner {
    fn dir(&self) -> &Path {
        &self.config.path
    }

    fn put(&mut self, payload: &[u8]) -> Result<(), QueueError> {
        let size = HEADER_BYTES + payload.len() as u64;
        if size > self.config.capacity_bytes || payload.len() > u32::MAX as usize {
            return Err(QueueError::TooLarge {
                size,
                capacity: self.config.capacity_bytes,
            });
        }

        while self.total_bytes + size > self.config.capacity_bytes {
            self.drop_oldest()?;
        }

        let rotate = match self.segments.back() {
            Some(last) => {
                self.writer.is_none()
                    || (last.bytes > 0 && last.bytes + size > self.config.segment_bytes)
            }
            None => true,
        };
        if rotate {
            self.rotate()?;
        }

        let Some(writer) = self.writer.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::Other, "no writable segment").into());
        };
        let mut record = Vec::with_capacity(size as usize);
        record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        record.extend_from_slice(payload);
        if let Err(err) = writer.write_all(&record).and_then(|()| writer.sync_data()) {
            self.discard_partial_write();
            return Err(err.into());
        }

        let Some(last) = self.segments.back_mut() else {
            return Err(io::Error::new(io::ErrorKind::Other, "no writable segment").into());
        };
        last.bytes += size;
        last.records += 1;
        self.total_bytes += size;
        Ok(())
    }

    /// Cuts whatever a failed write left past the last whole record. When the
    /// segment can't be cut, the next put starts a fresh one.
    fn discard_partial_write(&mut self) {
        let (Some(writer), Some(last)) = (self.writer.as_ref(), self.segments.back()) else {
            return;
        };
        let seq = last.seq;
        if let Err(err) = writer.set_len(last.bytes).and_then(|()| writer.sync_data()) {
            warn!("failed to truncate segment {}, closing it: {}", seq, err);
            self.writer = None;
        }
    }

    fn rotate(&mut self) -> Result<(), QueueError> {
        let seq = self
            .segments
            .back()
            .map(|s| s.seq + 1)
            .unwrap_or(self.position.seq.max(1));
        let path = segment_path(self.dir(), seq);
        debug!("rotating disk queue to {:?}", path);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        if self.segments.is_empty() {
            self.position = ReadPosition {
                seq,
                ..Default::default()
            };
        }
        self.writer = Some(file);
        self.segments.push_back(Segment {
            seq,
            bytes: 0,
            records: 0,
        });
        Ok(())
    }

    fn drop_oldest(&mut self) -> Result<(), QueueError> {
        let Some(oldest) = self.segments.pop_front() else {
            return Ok(());
        };
        let lost = if oldest.seq == self.position.seq {
            oldest.records.saturating_sub(self.position.consumed)
        } else {
            oldest.records
        };
        self.dropped_records += lost;
        warn!(
            "disk queue over capacity, dropping segment {} with {} unread records",
            oldest.seq, lost
        );
        self.remove_segment(&oldest)?;
        if self.segments.is_empty() {
            self.writer = None;
        }
        Ok(())
    }

    fn remove_segment(&mut self, segment: &Segment) -> Result<(), QueueError> {
        self.total_bytes -= segment.bytes;
        match fs::remove_file(segment_path(self.dir(), segment.seq)) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        if let Some(next) = self.segments.front() {
            if self.position.seq <= segment.seq {
                self.position = ReadPosition {
                    seq: next.seq,
                    ..Default::default()
                };
            }
        } else {
            self.position = ReadPosition {
                seq: segment.seq + 1,
                ..Default::default()
            };
        }
        self.persist_position()
    }

    fn pop(&mut self) -> Result<Vec<u8>, QueueError> {
        loop {
            let Some(front) = self.segments.front() else {
                return Err(QueueError::Eof);
            };
            let is_writer = self.segments.len() == 1 && self.writer.is_some();
            if self.position.seq != front.seq {
                self.position = ReadPosition {
                    seq: front.seq,
                    ..Default::default()
                };
            }

            if self.position.offset >= front.bytes {
                if is_writer {
                    return Err(QueueError::Eof);
                }
                let done = self.segments.pop_front().ok_or(QueueError::Eof)?;
                self.remove_segment(&done)?;
                continue;
            }

            let path = segment_path(self.dir(), front.seq);
            let mut file = File::open(&path)?;
            file.seek(SeekFrom::Start(self.position.offset))?;
            let mut header = [0u8; HEADER_BYTES as usize];
            file.read_exact(&mut header)?;
            let len = u64::from(u32::from_le_bytes(header));
            let end = self.position.offset + HEADER_BYTES + len;
            if end > front.bytes {
                if is_writer {
                    return Err(QueueError::Corrupted {
                        path,
                        reason: format!("record ends at {end}, segment holds {}", front.bytes),
                    });
                }
                warn!("skipping truncated segment {:?}", path);
                let skipped = self.segments.pop_front().ok_or(QueueError::Eof)?;
                self.dropped_records += skipped.records.saturating_sub(self.position.consumed);
                self.remove_segment(&skipped)?;
                continue;
            }

            let mut payload = vec![0u8; len as usize];
            file.read_exact(&mut payload)?;
            self.position.offset = end;
            self.position.consumed += 1;

            if end >= front.bytes && !is_writer {
                let done = self.segments.pop_front().ok_or(QueueError::Eof)?;
                self.remove_segment(&done)?;
            } else {
                self.persist_position()?;
            }
            return Ok(payload);
        }
    }

    fn persist_position(&self) -> Result<(), QueueError> {
        let mut raw = [0u8; 16];
        raw[..8].copy_from_slice(&self.position.seq.to_le_bytes());
        raw[8..].copy_from_slice(&self.position.offset.to_le_bytes());
        let tmp = self.dir().join(format!("{POSITION_FILE}.tmp"));
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, self.dir().join(POSITION_FILE))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir, capacity_bytes: u64, segment_bytes: u64) -> QueueConfig {
        QueueConfig {
            path: dir.path().join("queue"),
            capacity_bytes,
            segment_bytes,
            clear_on_start: false,
        }
    }

    fn drain(queue: &DiskQueue) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            match queue.get(|p| p.to_vec()) {
                Ok(payload) => out.push(payload),
                Err(QueueError::Eof) => return out,
                Err(err) => panic!("unexpected error: {err}"),
            }
        }
    }

    #[test]
    fn empty_queue_is_eof() {
        let dir = TempDir::new().unwrap();
        let queue = DiskQueue::open(config(&dir, 1024, 256)).unwrap();
        assert!(matches!(queue.get(|_| ()), Err(QueueError::Eof)));
    }

    #[test]
    fn records_come_back_in_order_across_segments() {
        let dir = TempDir::new().unwrap();
        let queue = DiskQueue::open(config(&dir, 1 << 20, 32)).unwrap();
        for i in 0..20u8 {
            queue.put(&[i; 10]).unwrap();
        }
        assert!(queue.stats().segments > 1);

        let got = drain(&queue);
        assert_eq!(got.len(), 20);
        for (i, payload) in got.iter().enumerate() {
            assert_eq!(payload, &vec![i as u8; 10]);
        }
        assert!(matches!(queue.get(|_| ()), Err(QueueError::Eof)));

        // Still writable after a full drain
        queue.put(b"again").unwrap();
        assert_eq!(drain(&queue), vec![b"again".to_vec()]);
    }

    #[test]
    fn oldest_segments_are_evicted_over_capacity() {
        let dir = TempDir::new().unwrap();
        // One 100 byte record per segment, room for four of them
        let queue = DiskQueue::open(config(&dir, 4 * 104, 104)).unwrap();
        for i in 0..10u8 {
            queue.put(&[i; 100]).unwrap();
        }

        let stats = queue.stats();
        assert!(stats.bytes <= 4 * 104);
        assert_eq!(stats.dropped_records, 6);

        let got: Vec<u8> = drain(&queue).iter().map(|p| p[0]).collect();
        assert_eq!(got, vec![6, 7, 8, 9]);
        assert!(matches!(queue.get(|_| ()), Err(QueueError::Eof)));
    }

    #[test]
    fn record_larger_than_capacity_is_refused() {
        let dir = TempDir::new().unwrap();
        let queue = DiskQueue::open(config(&dir, 64, 64)).unwrap();
        let res = queue.put(&[0u8; 128]);
        assert!(matches!(res, Err(QueueError::TooLarge { size: 132, capacity: 64 })));
        assert_eq!(queue.stats().bytes, 0);
    }

    #[test]
    fn reopen_resumes_from_read_position() {
        let dir = TempDir::new().unwrap();
        {
            let queue = DiskQueue::open(config(&dir, 1 << 20, 1 << 10)).unwrap();
            for payload in [b"one".as_slice(), b"two", b"three"] {
                queue.put(payload).unwrap();
            }
            assert_eq!(queue.get(|p| p.to_vec()).unwrap(), b"one");
        }

        let queue = DiskQueue::open(config(&dir, 1 << 20, 1 << 10)).unwrap();
        assert_eq!(drain(&queue), vec![b"two".to_vec(), b"three".to_vec()]);
    }

    #[test]
    fn clear_on_start_wipes_records() {
        let dir = TempDir::new().unwrap();
        {
            let queue = DiskQueue::open(config(&dir, 1 << 20, 1 << 10)).unwrap();
            queue.put(b"stale").unwrap();
        }
        let mut cfg = config(&dir, 1 << 20, 1 << 10);
        cfg.clear_on_start = true;
        let queue = DiskQueue::open(cfg).unwrap();
        assert!(matches!(queue.get(|_| ()), Err(QueueError::Eof)));
    }

    #[test]
    fn truncated_tail_is_ignored_on_reopen() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir, 1 << 20, 1 << 10);
        {
            let queue = DiskQueue::open(cfg.clone()).unwrap();
            queue.put(b"complete").unwrap();
        }
        // Simulate a crash in the middle of a write
        let mut file = OpenOptions::new()
            .append(true)
            .open(segment_path(&cfg.path, 1))
            .unwrap();
        file.write_all(&[200, 0, 0, 0, 1, 2]).unwrap();
        drop(file);

        let queue = DiskQueue::open(cfg).unwrap();
        assert_eq!(drain(&queue), vec![b"complete".to_vec()]);
        queue.put(b"next").unwrap();
        assert_eq!(drain(&queue), vec![b"next".to_vec()]);
    }

    #[test]
    fn damaged_read_position_restarts_from_the_oldest_record() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir, 1 << 20, 1 << 10);
        {
            let queue = DiskQueue::open(cfg.clone()).unwrap();
            queue.put(b"one").unwrap();
            queue.put(b"two").unwrap();
        }
        fs::write(cfg.path.join(POSITION_FILE), [1, 2, 3]).unwrap();

        let queue = DiskQueue::open(cfg).unwrap();
        assert_eq!(drain(&queue), vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn read_position_is_replaced_whole() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir, 1 << 20, 1 << 10);
        let queue = DiskQueue::open(cfg.clone()).unwrap();
        queue.put(b"one").unwrap();
        queue.put(b"two").unwrap();
        queue.get(|_| ()).unwrap();

        assert_eq!(fs::read(cfg.path.join(POSITION_FILE)).unwrap().len(), 16);
        assert!(!cfg.path.join("read.pos.tmp").exists());
    }

    #[test]
    fn failed_write_leaves_no_garbage_behind() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir, 1 << 20, 1 << 10);
        let queue = DiskQueue::open(cfg.clone()).unwrap();
        queue.put(b"one").unwrap();

        // half a record, as a write cut short by a full disk would leave
        let mut file = OpenOptions::new()
            .append(true)
            .open(segment_path(&cfg.path, 1))
            .unwrap();
        file.write_all(&[9, 0, 0, 0, b'x']).unwrap();
        drop(file);
        queue.lock().discard_partial_write();

        queue.put(b"two").unwrap();
        assert_eq!(drain(&queue), vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(fs::metadata(segment_path(&cfg.path, 1)).unwrap().len(), 14);
    }
}

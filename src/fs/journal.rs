//! Per-endpoint journal files.
//!
//! A journal is an append-only file that records every byte received from
//! one endpoint and re-serves it for forwarding. It carries two positions:
//! the write offset (implicit, at end of file, advanced by [`Journal::append`])
//! and a replay cursor owned by the caller, which marks the next byte not
//! yet forwarded to the opposite peer. Bytes between the two are in flight.
//!
//! Files are opened in read+append mode and never truncated or deleted, so
//! a reconnecting peer keeps extending its earlier record. Kernel-level
//! write buffering is sufficient durability; nothing is fsynced.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::os::fd::RawFd;
use std::path::PathBuf;

use nix::errno::Errno;
use nix::sys::socket::{send, MsgFlags};

use crate::cfg::CHUNK_SIZE;
use crate::error::{Error, JournalOp, PeerOp, Result};

/// Outcome of one [`Journal::replay`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replay {
    /// The replay cursor reached the end of the journal.
    Drained,
    /// The sink stopped accepting bytes; the cursor records exactly how far
    /// delivery got.
    WouldBlock,
}

/// The directory that holds journal files, one per endpoint key.
#[derive(Clone, Debug)]
pub struct JournalStore {
    dir: PathBuf,
}

impl JournalStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        JournalStore { dir: dir.into() }
    }

    /// Opens (creating if absent) the journal named `key`, positioned at end
    /// of file. The caller's initial replay cursor is the write offset at
    /// open time: bytes recorded by earlier connections are not replayed.
    pub fn open(&self, key: &str) -> Result<Journal> {
        let path = self.dir.join(key);
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|source| Error::journal(JournalOp::Open, key, source))?;
        let end = file
            .seek(SeekFrom::End(0))
            .map_err(|source| Error::journal(JournalOp::Seek, key, source))?;
        Ok(Journal {
            file,
            key: key.to_owned(),
            write_offset: end,
        })
    }
}

pub struct Journal {
    file: File,
    key: String,
    write_offset: u64,
}

impl Journal {
    /// Current append position. A replay cursor never exceeds this.
    pub fn write_offset(&self) -> u64 {
        self.write_offset
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Appends `buf` to the journal. The replay cursor is unaffected.
    pub fn append(&mut self, buf: &[u8]) -> Result<()> {
        self.file
            .write_all(buf)
            .map_err(|source| Error::journal(JournalOp::Write, &self.key, source))?;
        self.write_offset += buf.len() as u64;
        Ok(())
    }

    /// Forwards journal contents from `*cursor` to the non-blocking socket
    /// `sink`, in chunks, advancing `*cursor` by the bytes actually written.
    ///
    /// On [`Replay::WouldBlock`] the cursor accounts for a partially written
    /// chunk, so the next pass resumes exactly where the kernel stopped
    /// accepting. Interrupted reads and writes are retried in place.
    pub fn replay(&mut self, cursor: &mut u64, sink: RawFd) -> Result<Replay> {
        self.file
            .seek(SeekFrom::Start(*cursor))
            .map_err(|source| Error::journal(JournalOp::Seek, &self.key, source))?;
        let mut chunk = [0u8; CHUNK_SIZE];
        loop {
            let read = loop {
                match self.file.read(&mut chunk) {
                    Ok(read) => break read,
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(source) => {
                        return Err(Error::journal(JournalOp::Read, &self.key, source))
                    }
                }
            };
            if read == 0 {
                return Ok(Replay::Drained);
            }
            let mut sent = 0;
            while sent < read {
                // MSG_NOSIGNAL: a peer that closed its read half must show
                // up as EPIPE here, never as a signal.
                match send(sink, &chunk[sent..read], MsgFlags::MSG_NOSIGNAL) {
                    Ok(n) => {
                        sent += n;
                        *cursor += n as u64;
                    }
                    Err(Errno::EINTR) => continue,
                    Err(Errno::EAGAIN) => return Ok(Replay::WouldBlock),
                    Err(errno) => {
                        return Err(Error::PeerIo {
                            op: PeerOp::Write,
                            source: errno.into(),
                        })
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn drain(reader: &mut UnixStream, out: &mut Vec<u8>) {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => return,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(err) => panic!("drain failed: {err}"),
            }
        }
    }

    #[test]
    fn open_positions_cursor_at_end() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalStore::new(dir.path());

        let mut journal = store.open("127.0.0.1:1000").unwrap();
        assert_eq!(journal.write_offset(), 0);
        journal.append(b"stale bytes").unwrap();
        drop(journal);

        // A second open must not replay what an earlier connection left.
        let journal = store.open("127.0.0.1:1000").unwrap();
        assert_eq!(journal.write_offset(), 11);
    }

    #[test]
    fn append_then_replay_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalStore::new(dir.path());
        let mut journal = store.open("peer").unwrap();
        let mut cursor = journal.write_offset();

        let (mut reader, sink) = UnixStream::pair().unwrap();
        reader.set_nonblocking(true).unwrap();
        sink.set_nonblocking(true).unwrap();

        journal.append(b"hello\n").unwrap();
        assert_eq!(cursor, 0);
        assert_eq!(journal.write_offset(), 6);

        let status = journal.replay(&mut cursor, sink.as_raw_fd()).unwrap();
        assert_eq!(status, Replay::Drained);
        assert_eq!(cursor, 6);

        let mut received = Vec::new();
        drain(&mut reader, &mut received);
        assert_eq!(received, b"hello\n");
    }

    #[test]
    fn partial_write_accounting() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalStore::new(dir.path());
        let mut journal = store.open("peer").unwrap();
        let mut cursor = 0u64;

        let payload = vec![0xabu8; 1 << 20];
        journal.append(&payload).unwrap();

        let (mut reader, sink) = UnixStream::pair().unwrap();
        reader.set_nonblocking(true).unwrap();
        sink.set_nonblocking(true).unwrap();

        // The payload exceeds the socketpair buffers, so the first pass must
        // stop early with an exact cursor.
        let status = journal.replay(&mut cursor, sink.as_raw_fd()).unwrap();
        assert_eq!(status, Replay::WouldBlock);
        assert!(cursor > 0);
        assert!(cursor < journal.write_offset());

        let mut received = Vec::new();
        drain(&mut reader, &mut received);
        assert_eq!(received.len() as u64, cursor);

        loop {
            let status = journal.replay(&mut cursor, sink.as_raw_fd()).unwrap();
            drain(&mut reader, &mut received);
            if status == Replay::Drained {
                break;
            }
        }
        assert_eq!(cursor, journal.write_offset());
        assert_eq!(received, payload);
    }

    #[test]
    fn replay_to_closed_sink_is_peer_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalStore::new(dir.path());
        let mut journal = store.open("peer").unwrap();
        let mut cursor = 0u64;
        journal.append(b"doomed").unwrap();

        let (reader, sink) = UnixStream::pair().unwrap();
        sink.set_nonblocking(true).unwrap();
        drop(reader);

        let err = journal.replay(&mut cursor, sink.as_raw_fd()).unwrap_err();
        assert!(matches!(
            err,
            Error::PeerIo {
                op: PeerOp::Write,
                ..
            }
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn replay_reproduces_appends(
            chunks in proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), 0..2048),
                0..16,
            )
        ) {
            let dir = tempfile::tempdir().unwrap();
            let store = JournalStore::new(dir.path());
            let mut journal = store.open("peer").unwrap();
            let mut cursor = journal.write_offset();

            let (mut reader, sink) = UnixStream::pair().unwrap();
            reader.set_nonblocking(true).unwrap();
            sink.set_nonblocking(true).unwrap();

            let mut expected = Vec::new();
            for chunk in &chunks {
                journal.append(chunk).unwrap();
                expected.extend_from_slice(chunk);
            }

            let mut received = Vec::new();
            loop {
                let status = journal.replay(&mut cursor, sink.as_raw_fd()).unwrap();
                prop_assert!(cursor <= journal.write_offset());
                drain(&mut reader, &mut received);
                if status == Replay::Drained {
                    break;
                }
            }
            prop_assert_eq!(cursor, journal.write_offset());
            prop_assert_eq!(received, expected);
        }
    }
}

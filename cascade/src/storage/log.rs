use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use byteorder::{BigEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};
use fs4::FileExt;

use crate::error::{CResult, Error};
use crate::object::Version;

/// Fixed bytes following the length field besides the payload:
/// version (8) + timestamp (8) + kind (1) + crc (4).
const FRAME_OVERHEAD: u32 = 8 + 8 + 1 + 4;

/// An append-only log file of self-describing delta frames:
///
/// - Frame length as big-endian u32 (length of everything after this field).
/// - Version as big-endian u64.
/// - Timestamp in microseconds as big-endian u64.
/// - Kind as one byte (0 = put, 1 = remove).
/// - Payload as raw bytes.
/// - CRC32 over version, timestamp, kind and payload, as big-endian u32.
///
/// Frames are concatenated; on open the tail is truncated back to the last
/// frame whose CRC validates. A CRC mismatch anywhere before the tail means
/// the replica's log cannot be trusted.
pub struct Log {
    /// Path to the log file.
    pub(crate) path: PathBuf,
    /// The opened file containing the log.
    pub(crate) file: std::fs::File,
}

/// The position and header of one frame, as recorded by the in-memory index.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameMeta {
    /// Offset of the frame's length field.
    pub pos: u64,
    /// Total frame size on disk including the length field.
    pub len: u32,
    pub version: Version,
    pub timestamp_us: u64,
    pub kind: u8,
    /// Offset of the payload bytes.
    pub payload_pos: u64,
    pub payload_len: u32,
}

impl FrameMeta {
    /// Offset of the first byte after this frame.
    pub fn end(&self) -> u64 {
        self.pos + self.len as u64
    }
}

impl Log {
    /// Opens a log file, or creates one if it does not exist. Takes out an
    /// exclusive lock on the file until it is closed, or errors if the lock
    /// is already held.
    pub fn new(path: PathBuf) -> CResult<Self> {
        Self::new_with_lock(path, true)
    }

    pub fn new_with_lock(path: PathBuf, try_lock: bool) -> CResult<Self> {
        if let Some(dir) = path.parent() {
            match std::fs::create_dir_all(dir) {
                Ok(_) => {}
                Err(err) => {
                    return Err(Error::Internal(format!("{}:{:?}", err, dir.to_str())))
                }
            }
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        if try_lock {
            // 锁文件。不允许其他进程篡改同一份日志。
            file.try_lock_exclusive()?;
        }

        Ok(Self { path, file })
    }

    /// Scans the log from the beginning and returns the metadata of every
    /// intact frame, in file order.
    ///
    /// Recovery logic:
    ///    1. Read the frame length; a short read here or in the body means an
    ///       incomplete append, so truncate the file at the frame start.
    ///    2. Validate the CRC. A mismatch on the final frame is a torn tail
    ///       write and is truncated away; a mismatch with more frames behind
    ///       it is corruption and fatal.
    ///    3. Loop until the end of the file.
    pub fn recover_frames(&mut self) -> CResult<Vec<FrameMeta>> {
        let mut frames = Vec::new();
        let file_len = self.file.metadata()?.len();
        let mut r = BufReader::new(&mut self.file);

        let mut pos = r.seek(SeekFrom::Start(0))?;

        while pos < file_len {
            let mut read_frame = || -> Result<(FrameMeta, u32), std::io::Error> {
                let frame_len = r.read_u32::<BigEndian>()?;
                if frame_len < FRAME_OVERHEAD || pos + 4 + frame_len as u64 > file_len {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "frame extends beyond end of file",
                    ));
                }
                let version = r.read_u64::<BigEndian>()? as Version;
                let timestamp_us = r.read_u64::<BigEndian>()?;
                let kind = r.read_u8()?;
                let payload_len = frame_len - FRAME_OVERHEAD;
                let mut payload = vec![0; payload_len as usize];
                r.read_exact(&mut payload)?;
                let stored_crc = r.read_u32::<BigEndian>()?;

                let mut hasher = crc32fast::Hasher::new();
                hasher.update(&(version as u64).to_be_bytes());
                hasher.update(&timestamp_us.to_be_bytes());
                hasher.update(&[kind]);
                hasher.update(&payload);

                let meta = FrameMeta {
                    pos,
                    len: 4 + frame_len,
                    version,
                    timestamp_us,
                    kind,
                    payload_pos: pos + 4 + (FRAME_OVERHEAD - 4) as u64,
                    payload_len,
                };
                Ok((meta, hasher.finalize() ^ stored_crc))
            };

            match read_frame() {
                Ok((meta, 0)) => {
                    pos = meta.end();
                    frames.push(meta);
                }
                Ok((meta, _)) => {
                    // CRC mismatch. Only the last frame may be torn.
                    if meta.end() >= file_len {
                        log::error!(
                            "Found torn frame at offset {} of {:?}, truncating file",
                            pos,
                            self.path
                        );
                        self.file.set_len(pos)?;
                        break;
                    }
                    return Err(Error::Corruption(format!(
                        "frame checksum mismatch at offset {} of {:?}",
                        pos, self.path
                    )));
                }
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    log::error!(
                        "Found incomplete frame at offset {} of {:?}, truncating file",
                        pos,
                        self.path
                    );
                    self.file.set_len(pos)?;
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }

        Ok(frames)
    }

    /// Appends one frame and returns its metadata. The caller decides when
    /// to sync; the write itself is flushed to the OS before returning.
    pub fn append_frame(
        &mut self,
        version: Version,
        timestamp_us: u64,
        kind: u8,
        payload: &[u8],
    ) -> CResult<FrameMeta> {
        let frame_len = FRAME_OVERHEAD + payload.len() as u32;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&(version as u64).to_be_bytes());
        hasher.update(&timestamp_us.to_be_bytes());
        hasher.update(&[kind]);
        hasher.update(payload);
        let crc = hasher.finalize();

        // Assemble the whole frame first so it hits the file in one write.
        let mut frame = BytesMut::with_capacity(4 + frame_len as usize);
        frame.put_u32(frame_len);
        frame.put_u64(version as u64);
        frame.put_u64(timestamp_us);
        frame.put_u8(kind);
        frame.put_slice(payload);
        frame.put_u32(crc);

        let pos = self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&frame)?;

        Ok(FrameMeta {
            pos,
            len: 4 + frame_len,
            version,
            timestamp_us,
            kind,
            payload_pos: pos + 4 + (FRAME_OVERHEAD - 4) as u64,
            payload_len: payload.len() as u32,
        })
    }

    /// Reads and CRC-checks the payload of a previously indexed frame.
    pub fn read_payload(&mut self, meta: &FrameMeta) -> CResult<Vec<u8>> {
        let mut payload = vec![0; meta.payload_len as usize];
        self.file.seek(SeekFrom::Start(meta.payload_pos))?;
        self.file.read_exact(&mut payload)?;

        let mut crc_buf = [0u8; 4];
        self.file.read_exact(&mut crc_buf)?;
        let stored_crc = u32::from_be_bytes(crc_buf);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&(meta.version as u64).to_be_bytes());
        hasher.update(&meta.timestamp_us.to_be_bytes());
        hasher.update(&[meta.kind]);
        hasher.update(&payload);
        if hasher.finalize() != stored_crc {
            return Err(Error::Corruption(format!(
                "frame checksum mismatch at offset {} of {:?}",
                meta.pos, self.path
            )));
        }

        Ok(payload)
    }

    /// Forces all appended frames to the storage medium.
    pub fn sync(&mut self) -> CResult<()> {
        Ok(self.file.sync_all()?)
    }

    pub fn disk_size(&self) -> CResult<u64> {
        Ok(self.file.metadata()?.len())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn setup() -> (tempdir::TempDir, Log) {
        let dir = tempdir::TempDir::new("cascade").unwrap();
        let log = Log::new(dir.path().join("shard.log")).unwrap();
        (dir, log)
    }

    #[test]
    fn append_and_recover() -> CResult<()> {
        let (_dir, mut log) = setup();
        let m1 = log.append_frame(1, 1000, 0, b"first")?;
        let m2 = log.append_frame(2, 2000, 1, b"")?;
        let m3 = log.append_frame(3, 3000, 0, b"third")?;
        assert_eq!(m2.pos, m1.end());
        assert_eq!(m3.pos, m2.end());

        let frames = log.recover_frames()?;
        assert_eq!(frames, vec![m1, m2, m3]);
        assert_eq!(log.read_payload(&frames[0])?, b"first");
        assert_eq!(log.read_payload(&frames[1])?, b"");
        assert_eq!(log.read_payload(&frames[2])?, b"third");
        Ok(())
    }

    #[test]
    fn truncates_incomplete_tail() -> CResult<()> {
        // NB: Don't let the file fall out of scope between writes, the lock
        // is dropped with it.
        let dir = tempdir::TempDir::new("cascade")?;
        let path = dir.path().join("shard.log");

        let mut log = Log::new(path.clone())?;
        let m1 = log.append_frame(1, 1000, 0, b"keep-me")?;
        let m2 = log.append_frame(2, 2000, 0, b"torn")?;
        drop(log);

        // Truncate the file at every byte boundary inside the second frame
        // and assert recovery always retains exactly the first frame.
        for cut in m1.end()..m2.end() {
            let f = std::fs::OpenOptions::new().write(true).open(&path)?;
            f.set_len(cut)?;
            drop(f);

            let mut log = Log::new(path.clone())?;
            let frames = log.recover_frames()?;
            assert_eq!(frames, vec![m1], "cut at {}", cut);
            assert_eq!(log.disk_size()?, m1.end());
            drop(log);

            // Recovery truncated the file, re-append so the next cut works.
            let mut log = Log::new(path.clone())?;
            log.append_frame(2, 2000, 0, b"torn")?;
        }
        Ok(())
    }

    #[test]
    fn corrupt_tail_frame_is_truncated() -> CResult<()> {
        let dir = tempdir::TempDir::new("cascade")?;
        let path = dir.path().join("shard.log");

        let mut log = Log::new(path.clone())?;
        let m1 = log.append_frame(1, 1000, 0, b"keep-me")?;
        let m2 = log.append_frame(2, 2000, 0, b"flipped")?;
        drop(log);

        // Flip one payload byte of the final frame.
        flip_byte(&path, m2.payload_pos)?;

        let mut log = Log::new(path)?;
        assert_eq!(log.recover_frames()?, vec![m1]);
        Ok(())
    }

    #[test]
    fn corrupt_middle_frame_is_fatal() -> CResult<()> {
        let dir = tempdir::TempDir::new("cascade")?;
        let path = dir.path().join("shard.log");

        let mut log = Log::new(path.clone())?;
        let m1 = log.append_frame(1, 1000, 0, b"flipped")?;
        log.append_frame(2, 2000, 0, b"after")?;
        drop(log);

        flip_byte(&path, m1.payload_pos)?;

        let mut log = Log::new(path)?;
        match log.recover_frames() {
            Err(Error::Corruption(_)) => Ok(()),
            other => panic!("expected corruption error, got {:?}", other),
        }
    }

    #[test]
    fn read_payload_detects_bitrot() -> CResult<()> {
        let dir = tempdir::TempDir::new("cascade")?;
        let path = dir.path().join("shard.log");

        let mut log = Log::new(path.clone())?;
        let meta = log.append_frame(1, 1000, 0, b"payload")?;
        assert_eq!(log.read_payload(&meta)?, b"payload");
        drop(log);

        flip_byte(&path, meta.payload_pos + 2)?;

        let mut log = Log::new(path)?;
        assert!(matches!(log.read_payload(&meta), Err(Error::Corruption(_))));
        Ok(())
    }

    #[test]
    fn log_lock() -> CResult<()> {
        let dir = tempdir::TempDir::new("cascade")?;
        let path = dir.path().join("shard.log");
        let log = Log::new(path.clone())?;

        assert!(Log::new(path.clone()).is_err());
        drop(log);
        assert!(Log::new(path).is_ok());
        Ok(())
    }

    fn flip_byte(path: &std::path::Path, pos: u64) -> CResult<()> {
        use std::io::{Read, Seek, SeekFrom, Write};
        let mut f = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
        let mut b = [0u8; 1];
        f.seek(SeekFrom::Start(pos))?;
        f.read_exact(&mut b)?;
        b[0] ^= 0xff;
        f.seek(SeekFrom::Start(pos))?;
        f.write_all(&b)?;
        Ok(())
    }
}

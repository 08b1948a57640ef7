//! Stat, chunked read, chunked write, gzip and content-digest primitives (C2).

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{FileTypeExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;
use std::time::SystemTime;

use crate::error::Result;

/// 10 MiB, the fixed chunk size the wire protocol transfers files in.
pub const CHUNK_SIZE: i64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileStat {
    pub exists: bool,
    pub mtime: Option<SystemTime>,
    pub size: i64,
    pub mode: u32,
    pub is_dir: bool,
    pub is_fifo: bool,
    pub md5: Option<String>,
}

impl FileStat {
    pub fn is_dir(&self) -> bool {
        self.is_dir
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStatPart {
    pub start: i64,
    pub len: i64,
    pub md5: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileStatSlice {
    pub size: i64,
    pub total: i64,
    pub parts: Vec<FileStatPart>,
}

/// The chunked-transfer unit ("MyFile" in the original implementation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChunk {
    pub name: String,
    pub data: Vec<u8>,
    pub stat: FileStat,
    pub gzip: bool,
    pub total: i64,
    pub index: i64,
    pub pos: i64,
}

pub fn byte_md5(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

pub fn file_md5(path: &Path) -> String {
    let Ok(mut f) = File::open(path) else {
        return String::new();
    };
    let mut hasher = Md5::new();
    let mut buf = [0u8; 64 * 1024];
    while let Ok(n) = f.read(&mut buf) {
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    hex::encode(hasher.finalize())
}

pub fn gzip_encode(data: &[u8]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    let _ = enc.write_all(data);
    enc.finish().unwrap_or_default()
}

pub fn gzip_decode(data: &[u8]) -> Vec<u8> {
    let mut dec = GzDecoder::new(data);
    let mut out = Vec::new();
    let _ = dec.read_to_end(&mut out);
    out
}

/// Stat a path, existence-aware: a missing path yields `exists: false`, not
/// an error. `md5` is computed only when requested and the path is a
/// regular, non-empty, non-FIFO file.
pub fn file_get_stat(path: &Path, want_md5: bool) -> Result<FileStat> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(FileStat::default()),
        Err(e) => return Err(e.into()),
    };
    let mode = meta.mode();
    let is_fifo = meta.file_type().is_fifo();
    let mut stat = FileStat {
        exists: true,
        mtime: meta.modified().ok(),
        size: meta.len() as i64,
        mode,
        is_dir: meta.is_dir(),
        is_fifo,
        md5: None,
    };
    if !stat.is_dir && !stat.is_fifo && want_md5 && stat.size > 0 {
        stat.md5 = Some(file_md5(path));
    }
    Ok(stat)
}

/// Build the per-chunk md5 manifest of a regular file. Errors if `path` is
/// a directory.
pub fn file_get_stat_slice(path: &Path) -> Result<FileStatSlice> {
    let meta = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(FileStatSlice::default()),
        Err(e) => return Err(e.into()),
    };
    if meta.is_dir() {
        return Err(crate::error::HsyncError::Protocol("not file".into()));
    }
    let size = meta.len() as i64;
    let total = std::cmp::max((size as f64 / CHUNK_SIZE as f64).ceil() as i64, 1);
    let mut f = File::open(path)?;
    let mut parts = Vec::with_capacity(total as usize);
    let mut buf = vec![0u8; CHUNK_SIZE as usize];
    for index in 0..total {
        let start = index * CHUNK_SIZE;
        f.seek(SeekFrom::Start(start as u64))?;
        let n = read_fill(&mut f, &mut buf)?;
        parts.push(FileStatPart {
            start,
            len: n as i64,
            md5: byte_md5(&buf[..n]),
        });
    }
    Ok(FileStatSlice { size, total, parts })
}

fn read_fill(f: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = f.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

/// Build a `FileChunk` for the `index`-th slice of `path`, gzip-encoding the
/// payload. Whole-file md5 is attached only on chunk 0.
pub fn file_get_my_file(path: &Path, index: i64) -> Result<FileChunk> {
    let want_md5 = index == 0;
    let stat = file_get_stat(path, want_md5)?;
    let pos = CHUNK_SIZE * index;
    if stat.is_dir {
        return Ok(FileChunk {
            name: String::new(),
            data: Vec::new(),
            stat,
            gzip: false,
            total: 1,
            index: 0,
            pos: 0,
        });
    }
    let mut f = File::open(path)?;
    f.seek(SeekFrom::Start(pos as u64))?;
    let mut buf = vec![0u8; CHUNK_SIZE as usize];
    let n = read_fill(&mut f, &mut buf)?;
    let total = std::cmp::max((stat.size as f64 / CHUNK_SIZE as f64).ceil() as i64, 1);
    Ok(FileChunk {
        name: String::new(),
        data: gzip_encode(&buf[..n]),
        stat,
        gzip: true,
        total,
        index,
        pos,
    })
}

/// Stat-only chunk, carrying no data: used for `Trans.FileTruncate` args.
pub fn file_get_my_file_stat(path: &Path) -> Result<FileChunk> {
    let stat = file_get_stat(path, false)?;
    Ok(FileChunk {
        name: String::new(),
        data: Vec::new(),
        stat,
        gzip: false,
        total: 0,
        index: 0,
        pos: 0,
    })
}

/// Create `dir` (and parents) with `mode` if it does not already exist.
pub fn ensure_dir(dir: &Path, mode: u32) -> Result<()> {
    match std::fs::metadata(dir) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            std::fs::create_dir_all(dir)?;
            let _ = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(mode));
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Receiver-side chunk write: open (or create) the file with `mode`, write
/// `data` at `pos`, and on the final chunk truncate to `size`.
pub fn write_chunk_at(path: &Path, mode: u32, data: &[u8], pos: i64) -> Result<usize> {
    let mut f = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .mode(mode)
        .open(path)?;
    f.seek(SeekFrom::Start(pos as u64))?;
    f.write_all(data)?;
    Ok(data.len())
}

pub fn truncate_to(path: &Path, size: i64) -> Result<()> {
    let f = OpenOptions::new().write(true).open(path)?;
    f.set_len(size as u64)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_missing_path_has_no_error() {
        let stat = file_get_stat(Path::new("/does/not/exist"), true).unwrap();
        assert!(!stat.exists);
    }

    #[test]
    fn stat_slice_total_and_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        let mut f = File::create(&path).unwrap();
        let data = vec![7u8; (CHUNK_SIZE as usize) + 123];
        f.write_all(&data).unwrap();
        drop(f);

        let slice = file_get_stat_slice(&path).unwrap();
        assert_eq!(slice.total, 2);
        assert_eq!(slice.size, data.len() as i64);
        let mut rebuilt = Vec::new();
        for (i, part) in slice.parts.iter().enumerate() {
            assert_eq!(part.start, i as i64 * CHUNK_SIZE);
            let chunk = &data[part.start as usize..(part.start + part.len) as usize];
            assert_eq!(byte_md5(chunk), part.md5);
            rebuilt.extend_from_slice(chunk);
        }
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn stat_slice_exact_multiple_has_no_empty_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, vec![1u8; CHUNK_SIZE as usize]).unwrap();
        let slice = file_get_stat_slice(&path).unwrap();
        assert_eq!(slice.total, 1);
    }

    #[test]
    fn stat_slice_empty_file_has_one_zero_length_part() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        std::fs::write(&path, []).unwrap();
        let slice = file_get_stat_slice(&path).unwrap();
        assert_eq!(slice.total, 1);
        assert_eq!(slice.parts[0].len, 0);
    }

    #[test]
    fn stat_detects_named_pipe_and_skips_its_md5() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p");
        let status = std::process::Command::new("mkfifo").arg(&path).status();
        let Ok(status) = status else { return };
        if !status.success() {
            return;
        }
        let stat = file_get_stat(&path, true).unwrap();
        assert!(stat.exists);
        assert!(stat.is_fifo);
        assert!(stat.md5.is_none(), "fifo must never be read for its md5");
    }

    #[test]
    fn gzip_roundtrip() {
        let data = b"hello world, this is chunk data".to_vec();
        let enc = gzip_encode(&data);
        let dec = gzip_decode(&enc);
        assert_eq!(dec, data);
    }

    #[test]
    fn my_file_chunk0_carries_whole_file_md5() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"hello").unwrap();
        let chunk = file_get_my_file(&path, 0).unwrap();
        assert_eq!(chunk.total, 1);
        assert_eq!(chunk.stat.md5.as_deref(), Some(file_md5(&path).as_str()));
        assert_eq!(gzip_decode(&chunk.data), b"hello");
    }
}

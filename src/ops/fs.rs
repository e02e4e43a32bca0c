//! File operations
//!
//! Regular files never report `WouldBlock`, so their reads and writes complete
//! on the first attempt and the file descriptor is not registered with the
//! reactor.

use crate::error::{OpError, OpResult};
use crate::runtime::Runtime;
use crate::table::{Handle, Payload};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Open flags for files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOptions {
    read: bool,
    write: bool,
    create: bool,
    create_new: bool,
    truncate: bool,
    append: bool,
    mode: Option<u32>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            read: true,
            write: false,
            create: false,
            create_new: false,
            truncate: false,
            append: false,
            mode: None,
        }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(mut self, read: bool) -> Self {
        self.read = read;
        self
    }

    pub fn write(mut self, write: bool) -> Self {
        self.write = write;
        self
    }

    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    /// Fail with `AlreadyExists` if the path exists
    pub fn create_new(mut self, create_new: bool) -> Self {
        self.create_new = create_new;
        self
    }

    pub fn truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }

    pub fn append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }

    /// Permission bits for newly created files
    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Read-write, create, truncate
    pub fn for_create() -> Self {
        Self::new().read(true).write(true).create(true).truncate(true)
    }

    fn to_std(self) -> std::fs::OpenOptions {
        let mut options = std::fs::OpenOptions::new();
        options
            .read(self.read)
            .write(self.write)
            .append(self.append)
            .truncate(self.truncate)
            .create(self.create)
            .create_new(self.create_new);
        if let Some(mode) = self.mode {
            options.mode(mode);
        }
        options
    }
}

/// An open file
pub struct FileResource {
    file: File,
    path: PathBuf,
}

impl FileResource {
    pub fn open(path: &Path, options: OpenOptions) -> io::Result<Self> {
        let file = options.to_std().open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn read(&mut self, len: usize) -> OpResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let n = loop {
            match self.file.read(&mut buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };
        buf.truncate(n);
        Ok(buf)
    }

    pub(crate) fn write(&mut self, data: &[u8]) -> OpResult<usize> {
        Ok(self.file.write(data)?)
    }

    pub(crate) fn seek(&mut self, from: SeekFrom) -> OpResult<u64> {
        Ok(self.file.seek(from)?)
    }

    pub(crate) fn stat(&self) -> OpResult<FileInfo> {
        let meta = self.file.metadata()?;
        Ok(FileInfo {
            is_file: meta.is_file(),
            is_dir: meta.is_dir(),
            is_symlink: meta.file_type().is_symlink(),
            size: meta.len(),
            mtime: meta.modified().ok(),
            mode: meta.mode(),
        })
    }

    pub(crate) fn truncate(&mut self, len: u64) -> OpResult<()> {
        Ok(self.file.set_len(len)?)
    }
}

/// File metadata returned by `op_fstat`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub is_file: bool,
    pub is_dir: bool,
    pub is_symlink: bool,
    pub size: u64,
    pub mtime: Option<SystemTime>,
    pub mode: u32,
}

pub(crate) fn open(rt: &Runtime, path: &Path, options: OpenOptions) -> OpResult<Handle> {
    let file = FileResource::open(path, options).map_err(|e| {
        let err = OpError::from(e);
        OpError::new(err.kind(), format!("{}, open '{}'", err.message(), path.display()))
    })?;
    rt.register(Payload::File(file))
}

fn with_file<T>(
    rt: &Runtime,
    rid: Handle,
    op: &str,
    f: impl FnOnce(&mut FileResource) -> OpResult<T>,
) -> OpResult<T> {
    rt.with_payload(rid, |payload| match payload {
        Payload::File(file) => f(file),
        other => Err(Runtime::wrong_kind(rid, other.kind(), op)),
    })
}

pub(crate) fn seek(rt: &Runtime, rid: Handle, from: SeekFrom) -> OpResult<u64> {
    with_file(rt, rid, "op_seek", |f| f.seek(from))
}

pub(crate) fn fstat(rt: &Runtime, rid: Handle) -> OpResult<FileInfo> {
    with_file(rt, rid, "op_fstat", |f| f.stat())
}

pub(crate) fn ftruncate(rt: &Runtime, rid: Handle, len: u64) -> OpResult<()> {
    with_file(rt, rid, "op_ftruncate", |f| f.truncate(len))
}

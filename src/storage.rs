//! The filesystem seam.
//!
//! The engine core never touches paths directly; it goes through a
//! [`Storage`] handle addressing files by typed identifiers. The
//! production implementation is [`FsStorage`] over `std::fs`; tests can
//! substitute their own backend to inject faults.

use crate::file::{current_file_content, Fd, FileKind};
use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

/// An append-only file with explicit durability control
pub trait WritableFile: Write + Send {
    /// Flushes application buffers and asks the OS to persist the data
    fn sync(&mut self) -> std::io::Result<()>;
}

/// A file supporting positional reads from multiple threads
pub trait RandomAccessFile: Send + Sync {
    /// Reads up to `buf.len()` bytes at `offset`, returning the byte count
    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize>;

    /// Total file length in bytes
    fn len(&self) -> std::io::Result<u64>;
}

/// A file read front to back
pub trait SequentialFile: Read + Send {}

impl<T: Read + Send> SequentialFile for T {}

/// Guard for the single-process database lock; dropping it releases the
/// lock
pub trait FileLock: Send + Sync {}

/// Host filesystem abstraction the engine core runs against
pub trait Storage: Send + Sync {
    /// Creates (truncating) the file for `fd` and returns a writer
    fn create(&self, fd: Fd) -> std::io::Result<Box<dyn WritableFile>>;

    /// Opens the file for `fd` for sequential reading
    fn open_sequential(&self, fd: Fd) -> std::io::Result<Box<dyn SequentialFile>>;

    /// Opens the file for `fd` for positional reading
    fn open_random(&self, fd: Fd) -> std::io::Result<Box<dyn RandomAccessFile>>;

    /// Lists the identifiers of all recognized files in the folder
    fn list(&self) -> std::io::Result<Vec<Fd>>;

    /// Removes the file for `fd`
    fn remove(&self, fd: Fd) -> std::io::Result<()>;

    /// Reads the `CURRENT` pointer, returning the active manifest number
    fn current(&self) -> crate::Result<Option<u64>>;

    /// Atomically points `CURRENT` at the given manifest (temp file +
    /// rename)
    fn set_current(&self, manifest_num: u64) -> std::io::Result<()>;

    /// Takes the single-process lock on the folder
    fn lock(&self) -> crate::Result<Box<dyn FileLock>>;
}

/// [`Storage`] over a host filesystem folder
pub struct FsStorage {
    path: PathBuf,
}

impl FsStorage {
    /// Opens (creating if needed) the database folder
    pub fn open<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        std::fs::create_dir_all(&path)?;

        Ok(Self {
            path: path.as_ref().into(),
        })
    }

    fn path_of(&self, fd: Fd) -> PathBuf {
        self.path.join(fd.file_name())
    }
}

struct FsWritableFile {
    file: BufWriter<File>,
}

impl Write for FsWritableFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

impl WritableFile for FsWritableFile {
    fn sync(&mut self) -> std::io::Result<()> {
        self.file.flush()?;
        self.file.get_mut().sync_data()
    }
}

// Positional reads through a shared seek cursor. Contention is bounded
// by the block cache sitting in front of this.
struct FsRandomAccessFile {
    file: Mutex<File>,
}

impl RandomAccessFile for FsRandomAccessFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        let mut file = self.file.lock().expect("lock is poisoned");
        file.seek(SeekFrom::Start(offset))?;

        let mut read = 0;
        while read < buf.len() {
            let n = file.read(&mut buf[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }

        Ok(read)
    }

    fn len(&self) -> std::io::Result<u64> {
        let file = self.file.lock().expect("lock is poisoned");
        Ok(file.metadata()?.len())
    }
}

struct FsFileLock {
    file: File,
}

impl FileLock for FsFileLock {}

impl Drop for FsFileLock {
    fn drop(&mut self) {
        log::debug!("Releasing database lock");

        if let Err(e) = self.file.unlock() {
            log::warn!("Failed to release database lock: {e:?}");
        }
    }
}

const WRITE_BUFFER_CAPACITY: usize = 64 * 1_024;

impl Storage for FsStorage {
    fn create(&self, fd: Fd) -> std::io::Result<Box<dyn WritableFile>> {
        let file = File::create(self.path_of(fd))?;

        Ok(Box::new(FsWritableFile {
            file: BufWriter::with_capacity(WRITE_BUFFER_CAPACITY, file),
        }))
    }

    fn open_sequential(&self, fd: Fd) -> std::io::Result<Box<dyn SequentialFile>> {
        let file = File::open(self.path_of(fd))?;
        Ok(Box::new(std::io::BufReader::new(file)))
    }

    fn open_random(&self, fd: Fd) -> std::io::Result<Box<dyn RandomAccessFile>> {
        let file = File::open(self.path_of(fd))?;

        Ok(Box::new(FsRandomAccessFile {
            file: Mutex::new(file),
        }))
    }

    fn list(&self) -> std::io::Result<Vec<Fd>> {
        let mut fds = Vec::new();

        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            if let Some(fd) = entry.file_name().to_str().and_then(Fd::parse) {
                fds.push(fd);
            }
        }

        Ok(fds)
    }

    fn remove(&self, fd: Fd) -> std::io::Result<()> {
        std::fs::remove_file(self.path_of(fd))
    }

    fn current(&self) -> crate::Result<Option<u64>> {
        let path = self.path_of(Fd::new(FileKind::Current, 0));

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let name = content.strip_suffix('\n').ok_or_else(|| {
            crate::Error::Corruption("CURRENT file is missing trailing newline".into())
        })?;

        match Fd::parse(name) {
            Some(fd) if fd.kind == FileKind::Manifest => Ok(Some(fd.num)),
            _ => Err(crate::Error::Corruption(format!(
                "CURRENT file does not name a manifest: {name:?}"
            ))),
        }
    }

    fn set_current(&self, manifest_num: u64) -> std::io::Result<()> {
        let tmp_fd = Fd::new(FileKind::Temp, manifest_num);
        let tmp_path = self.path_of(tmp_fd);

        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(current_file_content(manifest_num).as_bytes())?;
            file.sync_all()?;
        }

        std::fs::rename(&tmp_path, self.path_of(Fd::new(FileKind::Current, 0)))?;

        #[cfg(not(target_os = "windows"))]
        {
            // fsync the folder so the rename itself is durable
            let folder = File::open(&self.path)?;
            folder.sync_all()?;
        }

        Ok(())
    }

    fn lock(&self) -> crate::Result<Box<dyn FileLock>> {
        log::debug!("Acquiring database lock at {}", self.path.display());

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.path_of(Fd::new(FileKind::Lock, 0)))?;

        file.try_lock().map_err(|e| match e {
            std::fs::TryLockError::Error(e) => crate::Error::Io(e),
            std::fs::TryLockError::WouldBlock => crate::Error::Locked,
        })?;

        Ok(Box::new(FsFileLock { file }))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{RandomAccessFile, WritableFile};
    use std::{
        io::Write,
        sync::{Arc, Mutex},
    };

    /// In-memory file for codec tests
    #[derive(Clone, Default)]
    pub struct MemFile(Arc<Mutex<Vec<u8>>>);

    impl MemFile {
        pub fn bytes(&self) -> Vec<u8> {
            self.0.lock().expect("lock is poisoned").clone()
        }

        pub fn set_bytes(&self, bytes: Vec<u8>) {
            *self.0.lock().expect("lock is poisoned") = bytes;
        }
    }

    impl Write for MemFile {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0
                .lock()
                .expect("lock is poisoned")
                .extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl WritableFile for MemFile {
        fn sync(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl RandomAccessFile for MemFile {
        fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
            let data = self.0.lock().expect("lock is poisoned");

            // NOTE: Truncation is fine, in-memory files are small
            #[allow(clippy::cast_possible_truncation)]
            let offset = offset as usize;

            if offset >= data.len() {
                return Ok(0);
            }

            let n = buf.len().min(data.len() - offset);
            buf[..n].copy_from_slice(&data[offset..offset + n]);
            Ok(n)
        }

        fn len(&self) -> std::io::Result<u64> {
            Ok(self.0.lock().expect("lock is poisoned").len() as u64)
        }
    }
}

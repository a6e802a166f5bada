//! Block store. Aligned, fixed-size block I/O over a single file.
//!
//! Synchronous transfers run on the calling thread. Asynchronous transfers run on a dedicated
//! I/O thread pool: the buffer is moved into the I/O task and handed back by [`IoRequest::wait`],
//! so a buffer can never be touched while its transfer is in flight.

use std::cmp;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Instant;

use log;

use crate::buffer::AlignedBlock;
use crate::config::SortConfig;
use crate::sort::SortError;
use crate::stats::IoStats;

/// Block store parameters shared by all stores of a sorter.
#[derive(Clone)]
pub struct StoreOptions {
    /// Block size in bytes.
    pub block_size: usize,
    /// Buffer alignment required by the device.
    pub alignment: usize,
    /// Open files with `O_DIRECT`.
    pub direct_io: bool,
    /// Thread pool executing asynchronous transfers.
    pub io_pool: Arc<rayon::ThreadPool>,
    /// Transfer counters.
    pub stats: Arc<IoStats>,
}

impl StoreOptions {
    pub fn new(config: &SortConfig, io_pool: Arc<rayon::ThreadPool>, stats: Arc<IoStats>) -> Self {
        StoreOptions {
            block_size: config.block_size,
            alignment: config.alignment,
            direct_io: config.direct_io,
            io_pool,
            stats,
        }
    }
}

/// Block device state shared with in-flight I/O tasks.
struct Device {
    file: fs::File,
    /// Current file length in bytes.
    len: AtomicU64,
    block_size: usize,
    stats: Arc<IoStats>,
}

impl Device {
    fn read_into(&self, index: u64, buf: &mut [u8]) -> io::Result<()> {
        let len = self.len.load(Ordering::SeqCst);
        let offset = index * self.block_size as u64;
        if offset >= len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "block {} is out of range (file holds {} blocks)",
                    index,
                    blocks_for(len, self.block_size)
                ),
            ));
        }

        // the whole block is requested so the transfer stays aligned; a short read is expected at the tail
        let expected = cmp::min(self.block_size as u64, len - offset) as usize;
        let mut filled = 0;
        while filled < expected {
            match read_at(&self.file, &mut buf[filled..], offset + filled as u64) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("block {} ends prematurely at byte {}", index, filled),
                    ))
                }
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        buf[filled..].fill(0);

        self.stats.record_read(expected);
        return Ok(());
    }

    fn write_from(&self, index: u64, buf: &[u8]) -> io::Result<()> {
        let offset = index * self.block_size as u64;
        write_all_at(&self.file, buf, offset)?;
        self.len.fetch_max(offset + buf.len() as u64, Ordering::SeqCst);

        self.stats.record_write(buf.len());
        return Ok(());
    }
}

/// File backed block store.
pub struct BlockStore {
    device: Arc<Device>,
    alignment: usize,
    direct: bool,
    io_pool: Arc<rayon::ThreadPool>,
    /// Keeps the scratch file alive; the file is deleted on drop.
    scratch_path: Option<tempfile::TempPath>,
}

impl BlockStore {
    /// Opens an existing file for reading and writing.
    pub fn open(path: &Path, options: &StoreOptions) -> Result<Self, SortError> {
        Self::from_path(path, options, false, false)
    }

    /// Creates a file or truncates an existing one.
    pub fn create(path: &Path, options: &StoreOptions) -> Result<Self, SortError> {
        Self::from_path(path, options, true, true)
    }

    /// Creates an anonymous scratch file in `dir`. The file is removed when the store is dropped.
    pub fn scratch(dir: &Path, options: &StoreOptions) -> Result<Self, SortError> {
        let tmp_file = tempfile::Builder::new()
            .prefix(".block-sort-")
            .suffix(".tmp")
            .tempfile_in(dir)
            .map_err(|err| SortError::TempDir(err))?;
        let tmp_path = tmp_file.into_temp_path();

        let mut store = Self::from_path(&tmp_path, options, false, true)?;
        log::debug!("using {} as a scratch file", tmp_path.display());
        store.scratch_path = Some(tmp_path);

        return Ok(store);
    }

    fn from_path(path: &Path, options: &StoreOptions, create: bool, truncate: bool) -> Result<Self, SortError> {
        let mut open_options = fs::OpenOptions::new();
        open_options.read(true).write(true).create(create).truncate(truncate);

        let (file, direct) = if options.direct_io {
            match open_direct(&open_options, path) {
                Ok(file) => (file, true),
                Err(err) if direct_io_rejected(&err) => {
                    log::warn!(
                        "direct I/O is not supported for {} ({}), falling back to buffered I/O",
                        path.display(),
                        err
                    );
                    (open_options.open(path).map_err(|err| SortError::IO(err))?, false)
                }
                Err(err) => return Err(SortError::IO(err)),
            }
        } else {
            (open_options.open(path).map_err(|err| SortError::IO(err))?, false)
        };

        let len = file.metadata().map_err(|err| SortError::IO(err))?.len();

        return Ok(BlockStore {
            device: Arc::new(Device {
                file,
                len: AtomicU64::new(len),
                block_size: options.block_size,
                stats: Arc::clone(&options.stats),
            }),
            alignment: options.alignment,
            direct,
            io_pool: Arc::clone(&options.io_pool),
            scratch_path: None,
        });
    }

    /// Allocates a buffer suitable for this store.
    pub fn new_block(&self) -> Result<AlignedBlock, SortError> {
        AlignedBlock::new(self.device.block_size, self.alignment)
    }

    pub fn block_size(&self) -> usize {
        self.device.block_size
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Whether the file bypasses the OS page cache.
    pub fn is_direct(&self) -> bool {
        self.direct
    }

    pub fn stats(&self) -> &Arc<IoStats> {
        &self.device.stats
    }

    /// File length in bytes.
    pub fn len_bytes(&self) -> u64 {
        self.device.len.load(Ordering::SeqCst)
    }

    /// Number of blocks covering the file, the last one possibly partial.
    pub fn file_size_in_blocks(&self) -> u64 {
        blocks_for(self.len_bytes(), self.device.block_size)
    }

    /// Truncates or extends the file to exactly `len` bytes.
    pub fn set_len(&self, len: u64) -> Result<(), SortError> {
        self.device.file.set_len(len).map_err(|err| SortError::IO(err))?;
        self.device.len.store(len, Ordering::SeqCst);

        return Ok(());
    }

    /// Reads block `index` into `block`. A partial last block is zero padded.
    pub fn read_block(&self, index: u64, block: &mut AlignedBlock) -> Result<(), SortError> {
        block.check_alignment(self.device.block_size, self.alignment)?;
        self.device.read_into(index, block).map_err(|err| SortError::IO(err))
    }

    /// Writes `block` as block `index`, extending the file if needed.
    pub fn write_block(&self, index: u64, block: &AlignedBlock) -> Result<(), SortError> {
        block.check_alignment(self.device.block_size, self.alignment)?;
        self.device.write_from(index, block).map_err(|err| SortError::IO(err))
    }

    /// Starts reading block `index` into `block`. The filled buffer is returned by [`IoRequest::wait`].
    pub fn async_read(&self, index: u64, mut block: AlignedBlock) -> IoRequest {
        let (sender, receiver) = mpsc::sync_channel(1);

        match block.check_alignment(self.device.block_size, self.alignment) {
            Ok(()) => {
                let device = Arc::clone(&self.device);
                self.io_pool.spawn(move || {
                    let result = device
                        .read_into(index, &mut block)
                        .map(|_| block)
                        .map_err(|err| SortError::IO(err));
                    let _ = sender.send(result);
                });
            }
            Err(err) => {
                let _ = sender.send(Err(err));
            }
        }

        return IoRequest::new(index, receiver, Arc::clone(&self.device.stats));
    }

    /// Starts writing `block` as block `index`. The buffer is handed back by [`IoRequest::wait`].
    pub fn async_write(&self, index: u64, block: AlignedBlock) -> IoRequest {
        let (sender, receiver) = mpsc::sync_channel(1);

        match block.check_alignment(self.device.block_size, self.alignment) {
            Ok(()) => {
                let device = Arc::clone(&self.device);
                self.io_pool.spawn(move || {
                    let result = device
                        .write_from(index, &block)
                        .map(|_| block)
                        .map_err(|err| SortError::IO(err));
                    let _ = sender.send(result);
                });
            }
            Err(err) => {
                let _ = sender.send(Err(err));
            }
        }

        return IoRequest::new(index, receiver, Arc::clone(&self.device.stats));
    }
}

/// Completion token of an asynchronous block transfer.
/// Dropping a request without waiting leaves the transfer running; its buffer is released afterwards.
#[must_use = "the buffer is only returned by `wait`"]
pub struct IoRequest {
    index: u64,
    receiver: mpsc::Receiver<Result<AlignedBlock, SortError>>,
    stats: Arc<IoStats>,
}

impl IoRequest {
    fn new(index: u64, receiver: mpsc::Receiver<Result<AlignedBlock, SortError>>, stats: Arc<IoStats>) -> Self {
        IoRequest { index, receiver, stats }
    }

    /// Block index the transfer targets.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Blocks until the transfer completes and returns the buffer.
    pub fn wait(self) -> Result<AlignedBlock, SortError> {
        let started = Instant::now();
        let result = match self.receiver.recv() {
            Ok(result) => result,
            Err(_) => Err(SortError::IO(io::Error::new(
                io::ErrorKind::Other,
                format!("I/O task for block {} terminated unexpectedly", self.index),
            ))),
        };
        self.stats.record_wait(started.elapsed());

        return result;
    }
}

fn blocks_for(len: u64, block_size: usize) -> u64 {
    (len + block_size as u64 - 1) / block_size as u64
}

#[cfg(target_os = "linux")]
fn open_direct(options: &fs::OpenOptions, path: &Path) -> io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut options = options.clone();
    options.custom_flags(libc::O_DIRECT);
    options.open(path)
}

#[cfg(not(target_os = "linux"))]
fn open_direct(_options: &fs::OpenOptions, _path: &Path) -> io::Result<fs::File> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "direct I/O is not supported on this platform",
    ))
}

#[cfg(target_os = "linux")]
fn direct_io_rejected(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINVAL) || err.kind() == io::ErrorKind::Unsupported
}

#[cfg(not(target_os = "linux"))]
fn direct_io_rejected(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::Unsupported
}

#[cfg(unix)]
fn read_at(file: &fs::File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(unix)]
fn write_at(file: &fs::File, buf: &[u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::write_at(file, buf, offset)
}

#[cfg(windows)]
fn read_at(file: &fs::File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}

#[cfg(windows)]
fn write_at(file: &fs::File, buf: &[u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_write(file, buf, offset)
}

fn write_all_at(file: &fs::File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    while !buf.is_empty() {
        match write_at(file, buf, offset) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "failed to write whole block")),
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }

    return Ok(());
}

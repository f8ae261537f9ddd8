//! Platform-specific durable sync implementations
//!
//! Commit durability depends on data actually reaching persistent storage,
//! and each platform exposes a different strongest primitive for that. This
//! module maps a single call to the strongest guarantee available.

use std::fs::File;
use std::io;
use std::path::Path;

/// Ensures file data is durably written to persistent storage before returning.
///
/// Platform behaviors:
/// - Linux: fdatasync() - syncs data but not metadata (faster than fsync)
/// - macOS/iOS: fcntl(F_FULLFSYNC) - bypasses disk cache, ensures data reaches physical media
/// - Windows: FlushFileBuffers() - flushes internal buffers and requests device flush
/// - Other: file.sync_data() - Rust stdlib fallback
///
/// # Safety
/// This function makes system calls that may block for extended periods during heavy I/O.
/// The caller must not hold locks that could cause deadlocks during the sync operation.
pub fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        // Linux: fdatasync() syncs file data but not metadata (atime, mtime).
        // Sufficient for record and log volume durability.
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fdatasync is a POSIX system call that operates on a valid file descriptor.
        // We obtain the fd from a valid File reference, so it is guaranteed to be open.
        let result = unsafe { libc::fdatasync(fd) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        // macOS/iOS: F_FULLFSYNC bypasses the disk cache and ensures data reaches
        // physical media. Standard fsync() on macOS only flushes to the disk's
        // volatile write cache, which can be lost on power failure.
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fcntl with F_FULLFSYNC is a macOS system call that operates on a valid fd.
        // We obtain the fd from a valid File reference, so it is guaranteed to be open.
        let result = unsafe { libc::fcntl(fd, libc::F_FULLFSYNC) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(target_os = "windows")]
    {
        // Windows: FlushFileBuffers() flushes internal buffers and requests device flush.
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::FlushFileBuffers;
        let handle = file.as_raw_handle();
        // SAFETY: FlushFileBuffers is a Windows API call on a valid file handle.
        // We obtain the handle from a valid File reference.
        let result = unsafe { FlushFileBuffers(handle as *mut _) };
        if result != 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios", target_os = "windows")))]
    {
        // Fallback for other platforms (FreeBSD, etc.): Rust's sync_data() maps
        // to the best available sync primitive.
        file.sync_data()
    }
}

/// Ensures a directory entry change (file created, removed, or renamed inside
/// `dir`) is durably written.
///
/// Recovery treats the presence of a log file as "uncommitted state exists",
/// so removing the log at commit must itself survive a crash. On unix that
/// requires fsyncing the parent directory; Windows directories cannot be
/// opened for sync and metadata changes there are flushed with the file
/// handles, so this is a no-op.
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        let handle = File::open(dir)?;
        handle.sync_all()
    }

    #[cfg(not(unix))]
    {
        let _ = dir;
        Ok(())
    }
}

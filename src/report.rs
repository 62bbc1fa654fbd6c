//! The allocation report.
//!
//! ```text
//! TINY : 0x7f3a2c000000
//! 0x7f3a2c000050 - 0x7f3a2c000067 : 24 bytes
//! LARGE : 0x7f3a2c010000
//! 0x7f3a2c010050 - 0x7f3a2c010827 : 2008 bytes
//! Total: 2032
//! ```

use core::fmt;

use crate::zones::{SizeClass, Zones};

/// Write one line per zone, TINY then SMALL then LARGE and newest first
/// within a class, each followed by one line per allocated block with the
/// first and last byte of its payload. A final line totals the bytes.
pub fn write_report<W: fmt::Write>(zones: &Zones, out: &mut W) -> fmt::Result {
    let mut total = 0;

    for class in SizeClass::ALL {
        for zone in zones.list(class).iter() {
            writeln!(out, "{} : {:p}", class, zone.start())?;

            for block in zone.blocks().iter().filter(|b| !b.is_free()) {
                let start = block.payload();
                let bytes = block.user_size();
                let last = start.as_ptr().wrapping_add(bytes - 1);
                writeln!(out, "{:p} - {:p} : {} bytes", start, last, bytes)?;
                total += bytes;
            }
        }
    }

    writeln!(out, "Total: {}", total)
}

const BUFFER_SIZE: usize = 512;

/// A `fmt::Write` sink over a raw file descriptor, buffered on the stack so
/// that writing a report never allocates.
pub struct FdWriter {
    fd: libc::c_int,
    buf: [u8; BUFFER_SIZE],
    len: usize,
}

impl FdWriter {
    pub fn new(fd: libc::c_int) -> Self {
        FdWriter {
            fd,
            buf: [0; BUFFER_SIZE],
            len: 0,
        }
    }

    pub fn stdout() -> Self {
        FdWriter::new(libc::STDOUT_FILENO)
    }

    /// Write out everything buffered so far.
    pub fn flush(&mut self) {
        let mut written = 0;
        while written < self.len {
            let rest = &self.buf[written..self.len];
            let n = unsafe { libc::write(self.fd, rest.as_ptr() as *const libc::c_void, rest.len()) };
            if n <= 0 {
                if n < 0 && errno::errno().0 == libc::EINTR {
                    continue;
                }
                break;
            }
            written += n as usize;
        }
        self.len = 0;
    }
}

impl fmt::Write for FdWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut bytes = s.as_bytes();
        while !bytes.is_empty() {
            if self.len == BUFFER_SIZE {
                self.flush();
            }
            let n = bytes.len().min(BUFFER_SIZE - self.len);
            self.buf[self.len..self.len + n].copy_from_slice(&bytes[..n]);
            self.len += n;
            bytes = &bytes[n..];
        }
        Ok(())
    }
}

impl Drop for FdWriter {
    fn drop(&mut self) {
        self.flush();
    }
}

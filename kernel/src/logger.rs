//! Kernel logger
//!
//! `log` backend that formats every record into a fixed line buffer and
//! appends it to an in-memory ring. Nothing allocates; when the ring is full
//! the oldest bytes are overwritten. A record arriving while the ring is
//! locked (interrupt path) is counted as dropped instead of spinning.

use core::fmt::Write;
use core::sync::atomic::{AtomicU64, Ordering};

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::Mutex;

/// Ring capacity in bytes
pub const LOG_BUFFER_SIZE: usize = 8192;

/// Longest formatted record, truncated beyond
const LINE_MAX: usize = 256;

/// Buffer writer for formatting without alloc
pub struct BufferWriter<'a> {
    pub buffer: &'a mut [u8],
    pub pos: usize,
}

impl<'a> BufferWriter<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self { buffer, pos: 0 }
    }

    pub fn written(&self) -> &[u8] {
        &self.buffer[..self.pos]
    }
}

impl<'a> Write for BufferWriter<'a> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let bytes = s.as_bytes();
        let remaining = self.buffer.len() - self.pos;
        let to_write = bytes.len().min(remaining);

        if to_write > 0 {
            self.buffer[self.pos..self.pos + to_write].copy_from_slice(&bytes[..to_write]);
            self.pos += to_write;
        }

        Ok(())
    }
}

/// Byte ring keeping the most recent output
pub struct LogRing {
    buf: [u8; LOG_BUFFER_SIZE],
    /// Next write position
    head: usize,
    len: usize,
}

impl LogRing {
    pub const fn new() -> Self {
        Self { buf: [0; LOG_BUFFER_SIZE], head: 0, len: 0 }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        // only the tail of an oversized write survives anyway
        let bytes = &bytes[bytes.len().saturating_sub(LOG_BUFFER_SIZE)..];
        for &byte in bytes {
            self.buf[self.head] = byte;
            self.head = (self.head + 1) % LOG_BUFFER_SIZE;
        }
        self.len = (self.len + bytes.len()).min(LOG_BUFFER_SIZE);
    }

    /// Copy the contents, oldest first, into `out`; returns the bytes copied
    pub fn copy_to(&self, out: &mut [u8]) -> usize {
        let start = (self.head + LOG_BUFFER_SIZE - self.len) % LOG_BUFFER_SIZE;
        let count = self.len.min(out.len());
        for (i, slot) in out.iter_mut().take(count).enumerate() {
            *slot = self.buf[(start + i) % LOG_BUFFER_SIZE];
        }
        count
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }
}

/// Logger writing into a [`LogRing`]
pub struct RingLogger {
    ring: Mutex<LogRing>,
    dropped: AtomicU64,
}

impl RingLogger {
    pub const fn new() -> Self {
        Self { ring: Mutex::new(LogRing::new()), dropped: AtomicU64::new(0) }
    }

    pub fn read(&self, out: &mut [u8]) -> usize {
        self.ring.lock().copy_to(out)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Log for RingLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // Format: [LEVEL] target: message
        let level_str = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN ",
            Level::Info => "INFO ",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        let mut line = [0u8; LINE_MAX];
        let mut writer = BufferWriter::new(&mut line);
        let _ = write!(writer, "[{}] {}: {}", level_str, record.target(), record.args());
        let len = writer.pos.min(LINE_MAX - 1);
        line[len] = b'\n';

        match self.ring.try_lock() {
            Some(mut ring) => ring.push(&line[..=len]),
            None => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn flush(&self) {}
}

/// Global logger instance
static LOGGER: RingLogger = RingLogger::new();

/// Install the ring logger as the `log` backend
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}

/// Copy the global log, oldest first
pub fn read(out: &mut [u8]) -> usize {
    LOGGER.read(out)
}

/// Records lost to lock contention
pub fn dropped() -> u64 {
    LOGGER.dropped()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_wraps_keeping_newest() {
        let mut ring = LogRing::new();
        ring.push(&[b'a'; LOG_BUFFER_SIZE - 2]);
        ring.push(b"bcde");
        assert_eq!(ring.len(), LOG_BUFFER_SIZE);

        let mut out = [0u8; LOG_BUFFER_SIZE];
        assert_eq!(ring.copy_to(&mut out), LOG_BUFFER_SIZE);
        assert_eq!(&out[..2], b"aa");
        assert_eq!(&out[LOG_BUFFER_SIZE - 4..], b"bcde");

        ring.clear();
        assert!(ring.is_empty());
    }

    #[test]
    fn test_buffer_writer_truncates() {
        let mut buf = [0u8; 4];
        let mut writer = BufferWriter::new(&mut buf);
        write!(writer, "{}", 123456).unwrap();
        assert_eq!(writer.written(), b"1234");
    }

    #[test]
    fn test_record_format() {
        let logger = RingLogger::new();
        logger.log(
            &Record::builder()
                .args(format_args!("quantum {} for {}", 16, "init"))
                .level(Level::Warn)
                .target("gsched")
                .build(),
        );
        let mut out = [0u8; 128];
        let len = logger.read(&mut out);
        assert_eq!(&out[..len], b"[WARN ] gsched: quantum 16 for init\n");
        assert_eq!(logger.dropped(), 0);
    }

    #[test]
    fn test_init_once() {
        assert!(init(LevelFilter::Debug).is_ok());
        assert!(init(LevelFilter::Trace).is_err());
        log::warn!("logger installed");
        let mut out = [0u8; LOG_BUFFER_SIZE];
        assert!(read(&mut out) > 0);
    }
}

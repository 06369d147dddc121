use std::fmt::Write;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use rustix::fd::BorrowedFd;

use crate::teb;

static START: Lazy<Instant> = Lazy::new(Instant::now);

/// Writes to an internal buffer, flushing to stdout when the buffer fills or
/// the object is dropped. Records from different threads therefore don't
/// interleave mid-line.
struct RuntimeLoggerWriter {
    buffer: [u8; 1000],
    len: usize,
    stdout: BorrowedFd<'static>,
}

impl RuntimeLoggerWriter {
    fn new() -> Self {
        Self {
            buffer: [0; 1000],
            len: 0,
            // SAFETY: stdout stays open for the life of the process.
            stdout: unsafe { BorrowedFd::borrow_raw(libc::STDOUT_FILENO) },
        }
    }

    fn capacity_remaining(&self) -> usize {
        self.buffer.len() - self.len
    }

    fn write_direct(&self, mut bytes: &[u8]) -> std::fmt::Result {
        while !bytes.is_empty() {
            match rustix::io::write(self.stdout, bytes) {
                Ok(0) => return Err(std::fmt::Error),
                Ok(n) => bytes = &bytes[n..],
                Err(rustix::io::Errno::INTR) => continue,
                Err(_) => return Err(std::fmt::Error),
            }
        }
        Ok(())
    }

    fn flush(&mut self) {
        // Nowhere to report a failure to.
        let _ = self.write_direct(&self.buffer[..self.len]);
        self.len = 0;
    }
}

impl Write for RuntimeLoggerWriter {
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        if s.len() > self.capacity_remaining() {
            // Flush to make room and keep output FIFO.
            self.flush();
        }
        if s.len() > self.capacity_remaining() {
            // There will never be enough room.
            self.write_direct(s.as_bytes())
        } else {
            self.buffer[self.len..self.len + s.len()].copy_from_slice(s.as_bytes());
            self.len += s.len();
            Ok(())
        }
    }
}

impl Drop for RuntimeLoggerWriter {
    fn drop(&mut self) {
        self.flush();
    }
}

/// `hh:mm:ss.nnnnnnnnn`.
struct Elapsed(Duration);

impl std::fmt::Display for Elapsed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secs = self.0.as_secs();
        write!(
            f,
            "{:02}:{:02}:{:02}.{:09}",
            secs / 3600,
            (secs / 60) % 60,
            secs % 60,
            self.0.subsec_nanos()
        )
    }
}

/// Implementation of `log::Log` that tags each record with the native thread
/// id and, for threads in the runtime, the NT thread id.
pub struct RuntimeLogger {}

impl RuntimeLogger {
    /// Installs a `RuntimeLogger` as the logging backend of the `log` crate.
    pub fn install(level: log::LevelFilter) -> Result<(), log::SetLoggerError> {
        // log::set_logger requires a logger with a static lifetime.
        const RUNTIME_LOGGER: RuntimeLogger = RuntimeLogger {};

        Lazy::force(&START);
        log::set_logger(&RUNTIME_LOGGER)?;
        log::set_max_level(level);
        Ok(())
    }
}

impl log::Log for RuntimeLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let mut writer = RuntimeLoggerWriter::new();
        let native = rustix::thread::gettid().as_raw_nonzero();
        let _ = write!(&mut writer, "{} [{native}", Elapsed(START.elapsed()));
        let _ = match teb::current() {
            Ok(teb) => write!(&mut writer, ":{}] ", teb.thread_id()),
            Err(_) => writer.write_str("] "),
        };
        let _ = write!(
            &mut writer,
            "[{level}] [{file_name}:{line_number}] [{module}] ",
            level = record.level(),
            file_name = record.file().unwrap_or("?"),
            line_number = record.line().unwrap_or(0),
            module = record.module_path().unwrap_or("?"),
        );
        let _ = std::fmt::write(&mut writer, *record.args());
        let _ = writer.write_char('\n');
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_elapsed_format() {
        assert_eq!(Elapsed(Duration::ZERO).to_string(), "00:00:00.000000000");
        assert_eq!(
            Elapsed(Duration::new(3 * 3600 + 25 * 60 + 7, 42)).to_string(),
            "03:25:07.000000042"
        );
        assert_eq!(
            Elapsed(Duration::from_secs(100 * 3600)).to_string(),
            "100:00:00.000000000"
        );
    }

    #[test]
    fn test_writer_overflow() {
        let mut writer = RuntimeLoggerWriter::new();
        writer.write_str("short ").unwrap();
        assert_eq!(writer.len, 6);
        // Larger than the buffer: written through, after the buffered part.
        let long = "x".repeat(2000);
        writer.write_str(&long).unwrap();
        assert_eq!(writer.len, 0);
        writer.write_str("\n").unwrap();
    }
}

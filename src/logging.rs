//! A `log::Log` backend that writes each peer's required event trace to
//! `log_peer_<id>.log` in the bit-exact `YYYY-MM-DD HH:MM:SS: <message>`
//! format relied on for grading/inspection.
//!
//! No formatting crate in the pack (env_logger, fern, flexi_logger)
//! produces this exact layout out of the box, so the backend is hand
//! rolled, the same way the rest of the crate's ambient stack favors a
//! small amount of direct code over pulling in a dependency for a single
//! call site.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::PeerId;

struct PeerLogger {
    file: Mutex<File>,
}

impl log::Log for PeerLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() == log::Level::Info
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let line = format!("{}: {}\n", timestamp, record.args());
        if let Ok(mut file) = self.file.lock() {
            let _ = file.write_all(line.as_bytes());
        }
    }

    fn flush(&self) {
        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
    }
}

/// Installs the global logger for this process, truncating any previous
/// log file for `peer_id`. Must be called exactly once, before any other
/// module logs.
pub fn init(peer_id: PeerId) -> Result<()> {
    let path = format!("log_peer_{}.log", peer_id);
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)?;
    let logger = PeerLogger {
        file: Mutex::new(file),
    };
    log::set_boxed_logger(Box::new(logger))
        .map_err(|_| Error::Config("logger already initialized".into()))?;
    log::set_max_level(log::LevelFilter::Debug);
    Ok(())
}

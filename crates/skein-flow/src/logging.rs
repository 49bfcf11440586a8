//! A simple file-based logger for flow runs.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

pub struct RunLogger {
    file: File,
}

impl RunLogger {
    pub fn new(base_path: &Path) -> io::Result<Self> {
        let log_dir = base_path.join("logs");
        fs::create_dir_all(&log_dir)?;
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
            .as_secs();
        let path = log_dir.join(format!("flow-run-{}.log", timestamp));
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(RunLogger { file })
    }

    pub fn log(&mut self, message: &str) {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let _ = writeln!(self.file, "[{}] {}", timestamp, message);
    }
}

//! 構造化JSONログ

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

/// 反復ごとの統計をJSON行で追記するヘルパ。
pub struct StructuredLogger {
    file: Mutex<BufWriter<File>>,
}

impl StructuredLogger {
    pub fn new(path: &Path) -> std::io::Result<StructuredLogger> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let f = fs::OpenOptions::new().create(true).append(true).open(path)?;
        Ok(StructuredLogger {
            file: Mutex::new(BufWriter::with_capacity(1 << 16, f)),
        })
    }

    pub fn write_json(&self, v: &serde_json::Value) {
        if let Ok(mut w) = self.file.lock() {
            let _ = writeln!(w, "{v}");
            let _ = w.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.jsonl");
        let logger = StructuredLogger::new(&path).unwrap();
        logger.write_json(&serde_json::json!({"iteration": 0, "loss": 0.5}));
        logger.write_json(&serde_json::json!({"iteration": 1, "loss": 0.25}));
        drop(logger);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let v: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(v["iteration"], 1);
    }
}

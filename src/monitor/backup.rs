//! Backup, restore, export and import for the event store.
//!
//! Backups go through the SQLite backup API after an integrity check,
//! optionally gzipped, with the oldest retired past `max_backups`.
//! Export writes a range query to a self-describing JSON file; import
//! replays such a file inside one transaction.

use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::Connection;

use crate::core::error::{QsysError, Result};
use crate::core::events::ChangeEvent;

/// Gzip magic bytes.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub(crate) fn db_err(context: &str, e: impl std::fmt::Display) -> QsysError {
    QsysError::internal(format!("{context}: {e}"))
}

pub(crate) fn io_err(context: &str, e: std::io::Error) -> QsysError {
    QsysError::internal(format!("{context}: {e}"))
}

/// `PRAGMA integrity_check` must answer `ok`.
pub(crate) fn check_integrity(conn: &Connection) -> Result<()> {
    let verdict: String = conn
        .query_row("PRAGMA integrity_check", [], |row| row.get(0))
        .map_err(|e| db_err("integrity check failed", e))?;
    if verdict != "ok" {
        return Err(QsysError::internal(format!(
            "Database failed integrity check: {verdict}"
        )));
    }
    Ok(())
}

/// Back up `conn` into `backup_dir`.
///
/// Returns the path of the written backup
/// (`events-backup-YYYY-MM-DDTHH-MM-SS.db(.gz)`).
pub(crate) fn backup_database(
    conn: &Connection,
    backup_dir: &Path,
    compress: bool,
    max_backups: usize,
) -> Result<PathBuf> {
    check_integrity(conn)?;
    std::fs::create_dir_all(backup_dir).map_err(|e| io_err("create backup dir", e))?;

    let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S");
    let raw_path = backup_dir.join(format!("events-backup-{stamp}.db"));

    {
        let mut target = Connection::open(&raw_path).map_err(|e| db_err("open backup target", e))?;
        let backup = rusqlite::backup::Backup::new(conn, &mut target)
            .map_err(|e| db_err("start backup", e))?;
        backup
            .run_to_completion(64, std::time::Duration::from_millis(5), None)
            .map_err(|e| db_err("run backup", e))?;
    }

    let final_path = if compress {
        let gz_path = backup_dir.join(format!("events-backup-{stamp}.db.gz"));
        gzip_file(&raw_path, &gz_path)?;
        std::fs::remove_file(&raw_path).map_err(|e| io_err("remove raw backup", e))?;
        gz_path
    } else {
        raw_path
    };

    retire_old_backups(backup_dir, max_backups)?;
    tracing::info!(path = %final_path.display(), "Event store backed up");
    Ok(final_path)
}

/// Delete the oldest `events-backup-*` files beyond `max_backups`.
fn retire_old_backups(backup_dir: &Path, max_backups: usize) -> Result<()> {
    let mut backups: Vec<PathBuf> = std::fs::read_dir(backup_dir)
        .map_err(|e| io_err("list backups", e))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("events-backup-"))
        })
        .collect();
    // Timestamped names sort chronologically.
    backups.sort();

    while backups.len() > max_backups {
        let victim = backups.remove(0);
        if let Err(e) = std::fs::remove_file(&victim) {
            tracing::warn!(path = %victim.display(), error = %e, "Failed to retire backup");
        } else {
            tracing::debug!(path = %victim.display(), "Retired old backup");
        }
    }
    Ok(())
}

/// Restore a backup file over `target_path`.
///
/// Gzipped backups are detected by magic bytes and unpacked first; the
/// candidate is integrity-checked before anything is overwritten.
pub(crate) fn restore_database(backup_path: &Path, target_path: &Path) -> Result<()> {
    let mut header = [0u8; 2];
    {
        use std::io::Read;
        let mut file = std::fs::File::open(backup_path).map_err(|e| io_err("open backup", e))?;
        file.read_exact(&mut header)
            .map_err(|e| io_err("read backup header", e))?;
    }

    let candidate: PathBuf = if header == GZIP_MAGIC {
        let unpacked = target_path.with_extension("restore-tmp");
        gunzip_file(backup_path, &unpacked)?;
        unpacked
    } else {
        backup_path.to_path_buf()
    };

    let verdict = (|| {
        let conn = Connection::open(&candidate).map_err(|e| db_err("open restore candidate", e))?;
        check_integrity(&conn)
    })();

    match verdict {
        Ok(()) => {
            if candidate != backup_path {
                std::fs::rename(&candidate, target_path).map_err(|e| io_err("move restored db", e))?;
            } else {
                std::fs::copy(backup_path, target_path).map_err(|e| io_err("copy restored db", e))?;
            }
            tracing::info!(path = %target_path.display(), "Event store restored");
            Ok(())
        }
        Err(e) => {
            if candidate != backup_path {
                let _ = std::fs::remove_file(&candidate);
            }
            Err(e)
        }
    }
}

fn gzip_file(src: &Path, dst: &Path) -> Result<()> {
    use std::io::{copy, BufReader, BufWriter};

    let input = std::fs::File::open(src).map_err(|e| io_err("open for gzip", e))?;
    let output = std::fs::File::create(dst).map_err(|e| io_err("create gzip target", e))?;
    let mut encoder =
        flate2::write::GzEncoder::new(BufWriter::new(output), flate2::Compression::default());
    copy(&mut BufReader::new(input), &mut encoder).map_err(|e| io_err("gzip", e))?;
    encoder
        .finish()
        .map_err(|e| io_err("finish gzip", e))?;
    Ok(())
}

fn gunzip_file(src: &Path, dst: &Path) -> Result<()> {
    use std::io::{copy, BufReader, BufWriter};

    let input = std::fs::File::open(src).map_err(|e| io_err("open gzip", e))?;
    let mut decoder = flate2::read::GzDecoder::new(BufReader::new(input));
    let output = std::fs::File::create(dst).map_err(|e| io_err("create gunzip target", e))?;
    let mut writer = BufWriter::new(output);
    copy(&mut decoder, &mut writer).map_err(|e| io_err("gunzip", e))?;
    Ok(())
}

/// Serialize a query result to the export JSON document and write it
/// to `events-export-YYYY-MM-DDTHH-MM-SS.json` under `dir`.
pub(crate) fn export_events(
    events: &[ChangeEvent],
    dir: &Path,
    start_time: Option<i64>,
    end_time: Option<i64>,
) -> Result<(PathBuf, serde_json::Value)> {
    std::fs::create_dir_all(dir).map_err(|e| io_err("create export dir", e))?;
    let document = serde_json::json!({
        "exportedAt": Utc::now().to_rfc3339(),
        "eventsCount": events.len(),
        "startTime": start_time,
        "endTime": end_time,
        "events": events,
    });

    let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S");
    let path = dir.join(format!("events-export-{stamp}.json"));
    let text = serde_json::to_string_pretty(&document)
        .map_err(|e| QsysError::internal(format!("serialize export: {e}")))?;
    std::fs::write(&path, text).map_err(|e| io_err("write export", e))?;
    Ok((path, document))
}

/// Parse an export document back into events.
pub(crate) fn parse_import(document: &serde_json::Value) -> Result<Vec<ChangeEvent>> {
    let events = document
        .get("events")
        .ok_or_else(|| QsysError::validation("Import document has no events array"))?;
    serde_json::from_value(events.clone())
        .map_err(|e| QsysError::validation(format!("Malformed events array: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_db(dir: &Path) -> Connection {
        let conn = Connection::open(dir.join("source.db")).unwrap();
        conn.execute_batch(
            "CREATE TABLE events (id INTEGER PRIMARY KEY, note TEXT);
             INSERT INTO events (note) VALUES ('one'), ('two');",
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_backup_and_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let conn = scratch_db(dir.path());

        let backup = backup_database(&conn, dir.path(), false, 7).unwrap();
        assert!(backup.exists());

        let restored_path = dir.path().join("restored.db");
        restore_database(&backup, &restored_path).unwrap();

        let restored = Connection::open(&restored_path).unwrap();
        let count: i64 = restored
            .query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_gzipped_backup_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let conn = scratch_db(dir.path());

        let backup = backup_database(&conn, dir.path(), true, 7).unwrap();
        assert!(backup.extension().unwrap() == "gz");

        let restored_path = dir.path().join("restored.db");
        restore_database(&backup, &restored_path).unwrap();
        let restored = Connection::open(&restored_path).unwrap();
        let count: i64 = restored
            .query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_backup_retirement() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..4 {
            std::fs::write(
                dir.path().join(format!("events-backup-2026-01-0{}T00-00-00.db", i + 1)),
                b"x",
            )
            .unwrap();
        }
        retire_old_backups(dir.path(), 2).unwrap();

        let remaining: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|n| n.contains("03") || n.contains("04")));
    }

    #[test]
    fn test_restore_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("events-backup-bogus.db");
        std::fs::write(&bogus, b"definitely not sqlite").unwrap();

        let target = dir.path().join("target.db");
        assert!(restore_database(&bogus, &target).is_err());
        assert!(!target.exists());
    }

    #[test]
    fn test_export_document_shape() {
        let dir = tempfile::tempdir().unwrap();
        let (path, document) = export_events(&[], dir.path(), Some(1), Some(2)).unwrap();
        assert!(path.exists());
        assert_eq!(document["eventsCount"], 0);
        assert_eq!(document["startTime"], 1);
        assert!(document["exportedAt"].is_string());
        assert!(document["events"].as_array().unwrap().is_empty());
    }
}

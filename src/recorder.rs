// ===============================
// src/recorder.rs
// ===============================
//
// JSONL audit trail of relay / follower activity:
// - One AuditRecord per line, appended to RECORD_FILE.
// - BufWriter, flushed every 1s and every 1000 records.
// - Parent directory is created if missing.
// - On write failure the file is reopened once; if that fails the record is dropped.
//
// Recording is best-effort: a full channel drops records instead of
// slowing the relay or the dispatch loop.
//
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};

use crate::domain::WireEvent;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditRecord {
    Enqueued { ts: DateTime<Utc>, key: String, queue_size: usize, event: WireEvent },
    Dequeued { ts: DateTime<Utc>, follower: String, event: WireEvent },
    Stale { ts: DateTime<Utc>, account: String, age_ms: i64 },
    Dispatched { ts: DateTime<Utc>, account: String, action: String, success: bool, outcome: String },
    Alert { ts: DateTime<Utc>, follower: String, subject: String, body: String },
}

#[derive(Debug, Clone, Default)]
pub struct Recorder {
    tx: Option<mpsc::Sender<AuditRecord>>,
}

impl Recorder {
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Spawn the writer task when a path is configured.
    pub fn spawn(path: Option<String>) -> Self {
        match path {
            Some(path) => {
                let (tx, rx) = mpsc::channel::<AuditRecord>(8192);
                tokio::spawn(run(rx, path));
                Self { tx: Some(tx) }
            }
            None => Self::disabled(),
        }
    }

    pub fn record(&self, rec: AuditRecord) {
        if let Some(tx) = &self.tx {
            if tx.try_send(rec).is_err() {
                warn!("recorder: channel full or closed, record dropped");
            }
        }
    }
}

async fn open_writer(path: &str) -> std::io::Result<BufWriter<tokio::fs::File>> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = fs::create_dir_all(parent).await {
                error!(?e, %path, "recorder: create_dir_all failed");
            }
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

pub async fn run(mut rx: mpsc::Receiver<AuditRecord>, path: String) {
    let mut writer = match open_writer(&path).await {
        Ok(w) => w,
        Err(e) => {
            error!(?e, %path, "recorder: open failed, recording disabled");
            return;
        }
    };
    info!(%path, "recorder: started");

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut since_last_flush: u32 = 0;
    const FLUSH_EVERY_N_RECORDS: u32 = 1000;

    loop {
        tokio::select! {
            maybe_rec = rx.recv() => {
                let Some(rec) = maybe_rec else {
                    let _ = writer.flush().await;
                    info!("recorder: channel closed, stopped");
                    break;
                };
                let mut line = match serde_json::to_string(&rec) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(?e, "recorder: serialize error, skip record");
                        continue;
                    }
                };
                line.push('\n');

                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    error!(?e, "recorder: write failed, attempting reopen");
                    match open_writer(&path).await {
                        Ok(w) => writer = w,
                        Err(e2) => {
                            error!(?e2, "recorder: reopen failed, drop record");
                            continue;
                        }
                    }
                    if let Err(e3) = writer.write_all(line.as_bytes()).await {
                        error!(?e3, "recorder: write failed again after reopen, drop record");
                        continue;
                    }
                }

                since_last_flush += 1;
                if since_last_flush >= FLUSH_EVERY_N_RECORDS {
                    let _ = writer.flush().await;
                    since_last_flush = 0;
                }
            }

            _ = tick.tick() => {
                let _ = writer.flush().await;
                since_last_flush = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_one_json_line_per_record() {
        let path = std::env::temp_dir().join(format!("trade_relay_audit_{}.jsonl", std::process::id()));
        let path_str = path.to_string_lossy().to_string();
        let _ = std::fs::remove_file(&path);

        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(run(rx, path_str.clone()));
        tx.send(AuditRecord::Stale { ts: Utc::now(), account: "A".into(), age_ms: 6000 })
            .await
            .unwrap();
        tx.send(AuditRecord::Dispatched {
            ts: Utc::now(),
            account: "A".into(),
            action: "close".into(),
            success: true,
            outcome: "closed".into(),
        })
        .await
        .unwrap();
        drop(tx);
        task.await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["kind"], "stale");
        assert_eq!(first["age_ms"], 6000);
        let _ = std::fs::remove_file(&path);
    }
}

// ===============================
// src/recorder.rs
// ===============================
//
// JSONL recorder yang ringan & tahan banting:
// - Tulis setiap Event (candle closed, sinyal, trade) ke file .jsonl (append).
// - Bufer dengan BufWriter agar hemat syscall.
// - Flush periodik tiap 1s dan/atau tiap 1000 event.
// - Otomatis membuat parent directory jika belum ada.
// - Jika open/tulis gagal, coba reopen file di event berikutnya; recorder
//   tidak pernah membuat proses berhenti.
//
// ENV: set `RECORD_FILE=/path/to/events.jsonl` agar aktif (lihat system.rs).
//
use std::path::Path;
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::{mpsc, watch},
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info};

use crate::domain::Event;

const FLUSH_EVERY_N_EVENTS: u32 = 1000;

async fn open_writer(path: &str) -> std::io::Result<BufWriter<File>> {
    // Pastikan parent directory ada (kalau ada)
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

async fn write_line(writer: &mut BufWriter<File>, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}

pub async fn run(mut rx: mpsc::Receiver<Event>, path: String, mut stop: watch::Receiver<bool>) {
    info!(%path, "recorder: started");
    let mut writer = match open_writer(&path).await {
        Ok(w) => Some(w),
        Err(e) => {
            error!(?e, %path, "recorder: open failed, will retry on next event");
            None
        }
    };

    // Flush periodik (tiap 1 detik) + flush berbasis jumlah event
    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut since_last_flush: u32 = 0;

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => {
                let Some(ev) = maybe_ev else {
                    // Channel closed: flush dan keluar
                    if let Some(w) = writer.as_mut() {
                        let _ = w.flush().await;
                    }
                    info!("recorder: channel closed, stopped");
                    break;
                };

                let line = match serde_json::to_string(&ev) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(?e, "recorder: serialize error, skip event");
                        continue;
                    }
                };

                if writer.is_none() {
                    writer = open_writer(&path).await.ok();
                }
                let Some(w) = writer.as_mut() else {
                    error!(%path, "recorder: file unavailable, drop event");
                    continue;
                };

                let res = write_line(w, &line).await;
                if let Err(e) = res {
                    error!(?e, "recorder: write failed, attempting reopen");
                    writer = open_writer(&path).await.ok();
                    // coba lagi sekali setelah reopen
                    let retried = match writer.as_mut() {
                        Some(w) => write_line(w, &line).await.is_ok(),
                        None => false,
                    };
                    if !retried {
                        error!("recorder: write failed again after reopen, drop event");
                        writer = None;
                        continue;
                    }
                }

                since_last_flush += 1;
                if since_last_flush >= FLUSH_EVERY_N_EVENTS {
                    if let Some(w) = writer.as_mut() {
                        let _ = w.flush().await;
                    }
                    since_last_flush = 0;
                }
            }

            _ = stop.changed() => {
                // Shutdown: tulis sisa event di channel, flush, keluar
                rx.close();
                while let Some(ev) = rx.recv().await {
                    if let (Some(w), Ok(line)) = (writer.as_mut(), serde_json::to_string(&ev)) {
                        let _ = write_line(w, &line).await;
                    }
                }
                if let Some(w) = writer.as_mut() {
                    let _ = w.flush().await;
                }
                info!("recorder: stopped");
                break;
            }

            _ = tick.tick() => {
                // Flush periodik
                if let Some(w) = writer.as_mut() {
                    let _ = w.flush().await;
                }
                since_last_flush = 0;
            }
        }
    }
}

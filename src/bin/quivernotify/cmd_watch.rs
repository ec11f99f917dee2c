use anyhow::Result;
use log::{info, warn};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use QuiverNotify::{ChangeNotification, GlobalNotifier, NotifierTarget};

use super::metrics_http;
use super::util::{config_for, engine_for};

/// Prints one JSON line per notification.
struct JsonLinesTarget {
    prefix: Option<String>,
    printed: AtomicUsize,
}

impl NotifierTarget for JsonLinesTarget {
    fn filter(&self, name: &str) -> bool {
        match &self.prefix {
            Some(p) => name.starts_with(p.as_str()),
            None => true,
        }
    }

    fn database_changed(&self, change: ChangeNotification) {
        match serde_json::to_string(&change.summary()) {
            Ok(line) => {
                let mut out = std::io::stdout().lock();
                if writeln!(out, "{}", line).and_then(|_| out.flush()).is_err() {
                    warn!("stdout closed, notification for '{}' lost", change.database_id());
                }
            }
            Err(e) => warn!("serialize notification for '{}': {}", change.database_id(), e),
        }
        self.printed.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn exec(
    root: Option<PathBuf>,
    prefix: Option<String>,
    refresh_ms: u64,
    max: Option<usize>,
    report_empty: bool,
    metrics_addr: Option<String>,
) -> Result<()> {
    let cfg = config_for(root)
        .with_refresh_interval_ms(refresh_ms)
        .with_report_empty_diffs(report_empty);
    let engine = engine_for(&cfg);

    if let Some(addr) = metrics_addr.as_deref() {
        metrics_http::spawn(addr)?;
    }

    let target = Arc::new(JsonLinesTarget {
        prefix,
        printed: AtomicUsize::new(0),
    });
    let notifier = GlobalNotifier::new(engine, cfg, target.clone())?;
    notifier.start()?;
    info!("watching {} database(s)", notifier.watched_ids().len());

    loop {
        notifier.process_pending(Some(Duration::from_millis(250)));
        if let Some(m) = max {
            if target.printed.load(Ordering::SeqCst) >= m {
                break;
            }
        }
    }
    notifier.stop();
    Ok(())
}

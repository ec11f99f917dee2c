use anyhow::{anyhow, Result};
use log::{info, warn};
use std::thread;
use tiny_http::{Header, Response, Server};

use QuiverNotify::metrics;

/// Serve /metrics (Prometheus text) and /health on a background thread.
pub fn spawn(addr: &str) -> Result<()> {
    let server = Server::http(addr).map_err(|e| anyhow!("bind http at {}: {}", addr, e))?;
    info!("metrics listening on {}", addr);

    thread::Builder::new()
        .name("qn-metrics".to_string())
        .spawn(move || loop {
            let rq = match server.recv() {
                Ok(rq) => rq,
                Err(e) => {
                    warn!("http recv error: {}", e);
                    continue;
                }
            };

            let url = rq.url().to_string();
            let is_get = rq.method().as_str() == "GET";

            if is_get && (url == "/" || url == "/health" || url == "/ready") {
                let _ = rq.respond(Response::from_string("OK\n").with_status_code(200));
                continue;
            }

            if is_get && url == "/metrics" {
                let mut resp = Response::from_string(build_metrics());
                if let Ok(ct) = Header::from_bytes(b"Content-Type", b"text/plain; version=0.0.4") {
                    resp.add_header(ct);
                }
                let _ = rq.respond(resp);
                continue;
            }

            let _ = rq.respond(Response::from_string("not found\n").with_status_code(404));
        })?;
    Ok(())
}

fn metric(out: &mut String, name: &str, kind: &str, help: &str, value: String) {
    out.push_str(&format!("# HELP quivernotify_{} {}\n", name, help));
    out.push_str(&format!("# TYPE quivernotify_{} {}\n", name, kind));
    out.push_str(&format!("quivernotify_{} {}\n", name, value));
}

pub fn build_metrics() -> String {
    let m = metrics::snapshot();
    let mut out = String::new();

    out.push_str("# HELP quivernotify_build_info Build info.\n");
    out.push_str("# TYPE quivernotify_build_info gauge\n");
    out.push_str(&format!(
        "quivernotify_build_info{{version=\"{}\"}} 1\n",
        env!("CARGO_PKG_VERSION")
    ));

    // --- Catalog / coordinator ---
    metric(&mut out, "catalog_entries_discovered_total", "counter", "Catalog entries reported by the registry watcher.", m.catalog_entries_discovered.to_string());
    metric(&mut out, "catalog_entries_created_total", "counter", "Catalog entries created.", m.catalog_entries_created.to_string());
    metric(&mut out, "databases_registered_total", "counter", "Databases that started being watched.", m.databases_registered.to_string());
    metric(&mut out, "databases_rejected_total", "counter", "Databases rejected by the admission filter.", m.databases_rejected.to_string());
    metric(&mut out, "databases_failed_total", "counter", "Databases dropped because open or initial read failed.", m.databases_failed.to_string());

    // --- Diff worker ---
    metric(&mut out, "work_items_enqueued_total", "counter", "Work items queued for the diff worker.", m.work_items_enqueued.to_string());
    metric(&mut out, "work_items_dropped_total", "counter", "Work items discarded at shutdown.", m.work_items_dropped.to_string());
    metric(&mut out, "diffs_computed_total", "counter", "Diffs computed.", m.diffs_computed.to_string());
    metric(&mut out, "diffs_empty_dropped_total", "counter", "Diffs without visible changes that were dropped.", m.diffs_empty_dropped.to_string());
    metric(&mut out, "diff_failures_total", "counter", "Diff computations that failed or panicked.", m.diff_failures.to_string());
    metric(&mut out, "empty_diff_ratio", "gauge", "Share of computed diffs dropped as empty (percent).", format!("{:.2}", m.empty_diff_ratio() * 100.0));

    // --- Delivery ---
    metric(&mut out, "notifications_enqueued_total", "counter", "Notifications queued for delivery.", m.notifications_enqueued.to_string());
    metric(&mut out, "notifications_initial_total", "counter", "Initial-contents notifications queued.", m.notifications_initial.to_string());
    metric(&mut out, "notifications_delivered_total", "counter", "Notifications handed to the consumer.", m.notifications_delivered.to_string());
    metric(&mut out, "notifications_discarded_total", "counter", "Notifications discarded at shutdown.", m.notifications_discarded.to_string());
    metric(&mut out, "notifications_in_flight", "gauge", "Notifications queued but not yet delivered.", m.notifications_in_flight().to_string());

    // --- Commit log ---
    metric(&mut out, "log_frames_appended_total", "counter", "Commit frames appended.", m.log_frames_appended.to_string());
    metric(&mut out, "log_bytes_written_total", "counter", "Commit log bytes written.", m.log_bytes_written.to_string());
    metric(&mut out, "external_commits_total", "counter", "Commits imported from other processes.", m.external_commits.to_string());

    out
}

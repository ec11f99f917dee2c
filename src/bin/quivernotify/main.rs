use anyhow::Result;
use env_logger::{Builder, Env};
use log::error;

mod cli;
mod util;
mod cmd_register;
mod cmd_entries;
mod cmd_put;
mod cmd_diff;
mod cmd_watch;
mod metrics_http;

fn init_logger() {
    // Уровень берём из RUST_LOG, иначе дефолт — info.
    // Пример: RUST_LOG=debug ./quivernotify watch --root ./data
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn main() {
    init_logger();

    if let Err(e) = run() {
        error!("{:?}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = cli::Cli::parse();
    match cli.cmd {
        cli::Cmd::Register { root, id, name } =>
            cmd_register::exec(root, id, name),

        cli::Cmd::Entries { root, json } =>
            cmd_entries::exec(root, json),

        cli::Cmd::Put { root, id, table, row, set, delete, internal } =>
            cmd_put::exec(root, id, table, row, set, delete, internal),

        cli::Cmd::Diff { root, id, from, to, json } =>
            cmd_diff::exec(root, id, from, to, json),

        cli::Cmd::Watch { root, prefix, refresh_ms, max, report_empty, metrics_addr } =>
            cmd_watch::exec(root, prefix, refresh_ms, max, report_empty, metrics_addr),
    }
}

use anyhow::Result;
use env_logger::{Builder, Env};
use log::error;

mod cli;
mod util;
mod cmd_status;
mod cmd_tree;
mod cmd_compact;

fn init_logger() {
    // RUST_LOG wins; default is info.
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn main() {
    init_logger();
    if let Err(e) = run() {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = cli::Cli::parse_args();
    match cli.cmd {
        cli::Cmd::Status { path, json } =>
            cmd_status::exec(path, json),

        cli::Cmd::Trees { path, json } =>
            cmd_status::exec_trees(path, json),

        cli::Cmd::Put { path, tree, key, value } =>
            cmd_tree::exec_put(path, tree, key, value),

        cli::Cmd::Get { path, tree, key, out } =>
            cmd_tree::exec_get(path, tree, key, out),

        cli::Cmd::Del { path, tree, key } =>
            cmd_tree::exec_del(path, tree, key),

        cli::Cmd::Scan { path, tree, from, limit, json } =>
            cmd_tree::exec_scan(path, tree, from, limit, json),

        cli::Cmd::Append { path, list, key, value } =>
            cmd_tree::exec_append(path, list, key, value),

        cli::Cmd::Compact { path, min_fill, floor, force, shift, json } =>
            cmd_compact::exec(path, min_fill, floor, force, shift, json),

        cli::Cmd::Shift { path } =>
            cmd_compact::exec_shift(path),
    }
}

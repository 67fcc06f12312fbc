use std::sync::Arc;

use clap::Parser;
use color_eyre::{Result, eyre::Context};

use crate::cli::{Cli, Commands};
use crate::conf::Config;

mod cli;
mod conf;
mod db;
mod library;
mod listener;
mod scan;
mod smartpl;
mod text_encoding;
mod util;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install().unwrap();
    setup_tracing();

    let options = Cli::parse();
    let cfg = Arc::new(Config::load(options.config.as_ref())?);

    match options.command {
        Commands::Run => {
            let (handle, join) =
                library::init(Arc::clone(&cfg)).wrap_err("Could not start library")?;
            handle.initscan()?;
            handle.exec_async(library::rss::schedule_sync)?;
            let _watcher = library::watcher::start(&cfg, handle.clone())
                .wrap_err("Could not start filesystem watcher")?;

            tokio::signal::ctrl_c()
                .await
                .wrap_err("Could not listen for shutdown signal")?;
            tracing::info!("Shutting down");
            library::deinit(handle, join);
        }
        Commands::Scan => {
            let (handle, join) =
                library::init(Arc::clone(&cfg)).wrap_err("Could not start library")?;
            handle.initscan()?;

            // The scan runs on the library thread; wait for it to drain
            let (tx, rx) = std::sync::mpsc::channel();
            handle.exec_async(move |_| {
                let _ = tx.send(());
            })?;
            let _ = rx.recv();
            library::deinit(handle, join);
        }
        Commands::Backup => {
            let db = db::Db::open(cfg).wrap_err("Could not open database")?;
            db.backup()?;
        }
    }

    Ok(())
}

pub fn setup_tracing() {
    use tracing_subscriber::filter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = filter::EnvFilter::builder().from_env().unwrap();
    let fmt = fmt::layer().pretty().with_line_number(true);

    let _ignore_err = tracing_subscriber::registry()
        .with(fmt)
        .with(filter)
        .try_init();
}

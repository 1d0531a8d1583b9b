use clap::Parser;
use tokio::task::LocalSet;

use coral_dws::EXIT_NO_RESTART;
use coral_dws::common::config::{RabbitConfig, ServerOpts};
use coral_dws::common::setup::setup_logging;
use coral_dws::server::bootstrap::run_server;

fn load_config(opts: &ServerOpts) -> coral_dws::Result<RabbitConfig> {
    let mut config = match &opts.config {
        Some(path) => RabbitConfig::load(path)?,
        None => RabbitConfig::default(),
    };
    config.apply_opts(opts)?;
    Ok(config)
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let opts = ServerOpts::parse();
    setup_logging(opts.verbose);

    let result = match load_config(&opts) {
        Ok(config) => LocalSet::new().run_until(run_server(config)).await,
        Err(error) => Err(error),
    };

    if let Err(error) = result {
        log::error!("{error}");
        if error.is_fatal_startup() {
            std::process::exit(EXIT_NO_RESTART);
        }
        std::process::exit(1);
    }
}

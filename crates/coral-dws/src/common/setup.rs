use std::io::Write;

use env_logger::DEFAULT_FILTER_ENV;
use log::LevelFilter;

/// Sets the behavior of the logger, based on the verbosity passed on the command line and
/// environment variables such as `RUST_LOG`.
pub fn setup_logging(verbosity: u8) {
    let mut builder = env_logger::Builder::default();
    builder.filter_level(match verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    });
    // The kube client is very chatty on debug
    builder.filter_module("kube_client", LevelFilter::Info);
    builder.filter_module("hyper_util", LevelFilter::Info);

    let has_debug = std::env::var(DEFAULT_FILTER_ENV)
        .map(|v| v.contains("debug") || v.contains("trace"))
        .unwrap_or(false);

    if verbosity > 0 || has_debug {
        builder.format_timestamp_millis();
    } else {
        // <time> <level> <message>
        builder.format(|buf, record| {
            let level_style = buf.default_level_style(record.level()).bold();
            writeln!(
                buf,
                "{} {level_style}{}{level_style:#} {}",
                buf.timestamp_seconds(),
                record.level(),
                record.args()
            )
        });
    }

    // Overwrite the defaults from env
    builder.parse_default_env();
    builder.init();
}

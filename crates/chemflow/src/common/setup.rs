use env_logger::DEFAULT_FILTER_ENV;
use log::LevelFilter;
use std::io::Write;

/// Crates of the HTTP stack that are only interesting when something goes wrong.
const QUIET_MODULES: &[&str] = &["hyper", "hyper_util", "tower", "axum::rejection"];

fn debug_requested(verbose: bool) -> bool {
    verbose
        || std::env::var(DEFAULT_FILTER_ENV)
            .map(|filter| filter.contains("debug") || filter.contains("trace"))
            .unwrap_or(false)
}

/// Initializes `env_logger` for the service and the CLI.
///
/// `Info` is logged by default and `Debug` with `verbose`. `RUST_LOG` is applied last,
/// so it can override both the level and the quiet HTTP modules.
pub fn setup_logging(verbose: bool) {
    let mut builder = env_logger::Builder::default();
    builder.filter_level(if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
    for module in QUIET_MODULES {
        builder.filter_module(module, LevelFilter::Warn);
    }

    if debug_requested(verbose) {
        builder.format_timestamp_millis().format_module_path(true);
    } else {
        // <time> <level> <message>
        builder.format(|buf, record| {
            let style = buf.default_level_style(record.level()).bold();
            writeln!(
                buf,
                "{} {style}{:<5}{style:#} {}",
                buf.timestamp_seconds(),
                record.level(),
                record.args()
            )
        });
    }

    builder.parse_default_env();
    builder.init();
}

// common.rs — logging bootstrap and distribution info

use log::LevelFilter;

/// Distribution name and version (for banners and diagnostics)
pub const DISTNAME: &str = "softcompute";
pub const DISTVER: &str = env!("CARGO_PKG_VERSION");

/// Install the process-wide logger.
///
/// `RUST_LOG` wins when set; otherwise `verbose` selects debug output and
/// the default is info. Calling this twice is harmless.
pub fn init_logging(verbose: bool) {
    let default_level = if verbose { LevelFilter::Debug } else { LevelFilter::Info };

    let mut builder = env_logger::Builder::new();
    builder.filter_level(default_level);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    let _ = builder.format_timestamp_millis().try_init();
}

/// Startup banner, e.g. "softcompute 1.0.0".
pub fn version_string() -> String {
    format!("{} {}", DISTNAME, DISTVER)
}

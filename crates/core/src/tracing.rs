//! Log output setup.
//!
//! Installed once per process through [`crate::config::set_logger`].
//! `RUST_LOG` directives override the default level; `RINGSIM_LOG_FORMAT=json`
//! switches to JSON lines, `RINGSIM_LOG_TO_STDERR` moves output to stderr and
//! `RINGSIM_DISABLE_LOGS` turns it off.

#[cfg(feature = "trace")]
pub(crate) mod tracer {
    use tracing::level_filters::LevelFilter;
    use tracing_subscriber::{layer::SubscriberExt, Layer, Registry};

    pub fn init_tracer(level: Option<LevelFilter>) -> anyhow::Result<()> {
        let default_filter = if cfg!(any(test, debug_assertions)) {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        };
        let default_filter = level.unwrap_or(default_filter);
        let filter_layer = tracing_subscriber::EnvFilter::builder()
            .with_default_directive(default_filter.into())
            .from_env_lossy();

        if std::env::var("RINGSIM_DISABLE_LOGS").is_ok() {
            return Ok(());
        }
        let to_stderr = std::env::var("RINGSIM_LOG_TO_STDERR").is_ok();
        let json = std::env::var("RINGSIM_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

        let fmt_layer = tracing_subscriber::fmt::layer().with_level(true);
        let fmt_layer = if cfg!(any(test, debug_assertions)) {
            fmt_layer.with_file(true).with_line_number(true)
        } else {
            fmt_layer
        };
        let layer = match (json, to_stderr) {
            (true, true) => fmt_layer.json().with_writer(std::io::stderr).boxed(),
            (true, false) => fmt_layer.json().boxed(),
            (false, true) => fmt_layer.pretty().with_writer(std::io::stderr).boxed(),
            (false, false) => fmt_layer.pretty().boxed(),
        };

        let subscriber = Registry::default().with(layer.with_filter(filter_layer));
        tracing::subscriber::set_global_default(subscriber)?;
        Ok(())
    }
}

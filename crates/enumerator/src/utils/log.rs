use std::path::Path;

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber: terminal output always, plus a log file
/// under `output_dir` when requested. Controlled by `RUST_LOG`.
pub fn init_tracing_subscriber(save_logs_file: bool, output_dir: &Path, filename: &str) {
    let base = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_span_events(FmtSpan::CLOSE)
        .with_file(false)
        .with_target(false);

    if save_logs_file {
        let appender =
            RollingFileAppender::new(Rotation::NEVER, output_dir, format!("{filename}.log"));
        let file_subscriber = base.with_ansi(false).with_writer(appender).finish();

        // keep the terminal output as a second layer next to the file
        let stdout_layer = tracing_subscriber::fmt::layer()
            .with_span_events(FmtSpan::CLOSE)
            .with_file(false)
            .with_target(false);

        tracing::subscriber::set_global_default(file_subscriber.with(stdout_layer))
            .expect("global subscriber already set");
    } else {
        tracing::subscriber::set_global_default(base.finish())
            .expect("global subscriber already set");
    }
}

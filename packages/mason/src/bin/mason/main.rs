use clap::Parser;
use color_eyre::Result;
use tracing_error::ErrorLayer;
use tracing_subscriber::{Layer as _, layer::SubscriberExt as _, util::SubscriberInitExt};
use tracing_tree::time::Uptime;

mod cmd;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling.
    color_eyre::install()?;

    // Initialize logging.
    tracing_subscriber::registry()
        .with(ErrorLayer::default())
        .with(
            tracing_tree::HierarchicalLayer::default()
                .with_indent_lines(true)
                .with_indent_amount(2)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_verbose_exit(false)
                .with_verbose_entry(false)
                .with_deferred_spans(false)
                .with_bracketed_fields(true)
                .with_span_retrace(true)
                .with_timer(Uptime::default())
                .with_writer(std::io::stderr)
                .with_targets(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::builder()
                        .with_env_var("MASON_LOG")
                        .from_env_lossy(),
                ),
        )
        .init();

    match cmd::Cmd::parse() {
        cmd::Cmd::Assemble(options) => cmd::assemble::exec(options).await,
    }
}

pub mod cli;
pub mod error;

pub use error::{CliError, CliResult};

/// Install the stderr log subscriber.
///
/// `RUST_LOG` is honoured; `directives` are added on top. Directives that
/// do not parse are ignored.
pub fn init_logging(directives: &[&str]) {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for directive in directives.iter().filter_map(|d| d.parse().ok()) {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

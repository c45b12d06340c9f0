use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt as _;

pub type InitError = Box<dyn std::error::Error + Send + Sync>;

/// Installs the global `tracing` subscriber. `RUST_LOG` overrides the default `info` filter.
pub fn init_logging(json_logs: bool) -> Result<(), InitError> {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer(json_logs))
        .try_init()?;
    Ok(())
}

pub(crate) fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

pub(crate) fn fmt_layer<S>(json_logs: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'span> LookupSpan<'span>,
{
    if json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).boxed()
    }
}

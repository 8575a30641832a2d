use anyhow::anyhow;
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

/// Filter used by cleanup binaries when `RUST_LOG` is unset: engine progress at
/// info, driver chatter from sqlx and the HTTP stack kept at warn.
pub const DEFAULT_FILTER: &str = "info,sqlx=warn,hyper=warn,reqwest=warn";

/// Install the process-wide subscriber for a cleanup run.
///
/// Batch progress (`batch finished` with its `cleanup_rate`) and worker spans
/// carrying `batch`/`worker` are emitted at info; probe failures at debug.
/// `RUST_LOG` replaces `default_filter` entirely. Fails if a subscriber is
/// already installed.
pub fn init_tracing(default_filter: &str) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true)
        .try_init()
        .map_err(|e| anyhow!("tracing subscriber already installed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_install_is_rejected() {
        let _ = init_tracing("warn");
        let err = init_tracing(DEFAULT_FILTER).unwrap_err();
        assert!(err.to_string().contains("already installed"));
    }
}

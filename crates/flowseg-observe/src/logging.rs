use tracing_subscriber::EnvFilter;

/// Initializes a `tracing_subscriber` using `FLOWSEG_LOG` first, then `RUST_LOG`, then a default.
///
/// Log field contract for flowseg tools:
/// - Always include `split` on any cursor/stream event.
/// - Include `batch_size` and `target_h`/`target_w` once a stream is configured.
/// - Include `position` (the cyclic stream position) on per-sample events.
/// - Structured lifecycle events use target `flowseg_proof` with an `event` field.
pub fn init_tracing() {
    let filter = env_filter();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("FLOWSEG_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

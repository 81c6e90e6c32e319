use tracing_subscriber::{EnvFilter, FmtSubscriber};

pub fn init() {
    let filter = std::env::var("RUST_LOG").map_or_else(
        |_| EnvFilter::new("info"),
        |value| EnvFilter::try_new(value).unwrap_or_else(|_| EnvFilter::new("info")),
    );

    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();

    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to set global tracing subscriber: {err}");
    }
}

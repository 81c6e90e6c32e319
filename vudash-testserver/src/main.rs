use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context as _;
use vudash_testserver::{MetricsState, PATH_METRICS, router, sample_reports};

/// Standalone fake load tool: serves rotating `/metrics` batches so the
/// dashboard can be pointed at something during development.
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9090".to_string())
        .parse()
        .context("invalid listen address")?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let addr = listener.local_addr().context("resolve local addr")?;

    let state = MetricsState::default();
    state.set_reports(sample_reports(0));
    let app = router(state.clone());

    eprintln!("metrics=http://{addr}{PATH_METRICS}");

    let refresher = tokio::spawn(async move {
        let mut tick: u64 = 0;
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            tick += 1;
            state.set_reports(sample_reports(tick));
        }
    });

    let serve = axum::serve(listener, app).with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    });
    serve.await.context("serve metrics")?;

    refresher.abort();
    Ok(())
}

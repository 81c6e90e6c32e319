use std::process::Stdio;
use std::time::Duration;

use anyhow::Context as _;
use futures_util::StreamExt as _;
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tokio_tungstenite::tungstenite::Message;
use url::Url;
use vudash_testserver::{MetricsServer, ResponseMode, sample_reports};

struct Server {
    child: tokio::process::Child,
    base_url: String,
    _data_dir: tempfile::TempDir,
}

impl Server {
    async fn start(extra_args: &[&str]) -> anyhow::Result<Self> {
        let data_dir = tempfile::tempdir().context("create data dir")?;
        let exe = env!("CARGO_BIN_EXE_vudash");

        let mut child = tokio::process::Command::new(exe)
            .arg("--bind")
            .arg("127.0.0.1:0")
            .arg("--data-dir")
            .arg(data_dir.path())
            .args(extra_args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawn vudash")?;

        let stderr = child.stderr.take().context("missing stderr")?;
        let mut stderr_lines = BufReader::new(stderr).lines();

        let base_url = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(line) = stderr_lines.next_line().await? {
                if let Some(v) = line.strip_prefix("listening=") {
                    return Ok::<_, anyhow::Error>(v.trim().to_string());
                }
            }
            anyhow::bail!("listening url not found on stderr");
        })
        .await
        .context("timed out waiting for listening url")??;

        Ok(Self {
            child,
            base_url,
            _data_dir: data_dir,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn ws_url(&self) -> anyhow::Result<String> {
        let mut url = Url::parse(&self.base_url).context("parse base url")?;
        url.set_scheme("ws")
            .map_err(|_| anyhow::anyhow!("failed to set ws scheme"))?;
        url.set_path("/ws");
        Ok(url.to_string())
    }

    async fn stop(mut self) {
        let _ = self.child.kill().await;
    }
}

async fn register(
    client: &reqwest::Client,
    server: &Server,
    id: &str,
    metrics_url: &str,
) -> anyhow::Result<()> {
    let res = client
        .post(server.url("/api/load"))
        .json(&serde_json::json!({
            "id": id,
            "title": format!("run {id}"),
            "url": metrics_url,
        }))
        .send()
        .await
        .context("register token")?;
    anyhow::ensure!(res.status() == 201, "expected 201, got {}", res.status());
    Ok(())
}

async fn next_message_of_type(
    ws: &mut (impl futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
          + Unpin),
    wanted: &str,
    within: Duration,
) -> anyhow::Result<serde_json::Value> {
    tokio::time::timeout(within, async {
        loop {
            let msg = ws.next().await.context("ws stream ended")??;
            if let Message::Text(text) = msg {
                let v: serde_json::Value = serde_json::from_str(&text)?;
                if v.get("type") == Some(&serde_json::Value::String(wanted.to_string())) {
                    return Ok::<_, anyhow::Error>(v);
                }
            }
        }
    })
    .await
    .with_context(|| format!("timed out waiting for ws `{wanted}` message"))?
}

#[tokio::test]
async fn selecting_a_run_streams_updates_then_stalls() -> anyhow::Result<()> {
    let metrics = MetricsServer::start().await.context("start metrics server")?;
    metrics.state().set_reports(sample_reports(1));

    let server = Server::start(&["--poll-interval", "100ms", "--stall-threshold", "3"]).await?;
    let client = reqwest::Client::new();

    register(&client, &server, "run-a", &metrics.metrics_url()).await?;

    let (mut ws, _resp) = tokio_tungstenite::connect_async(server.ws_url()?)
        .await
        .context("connect ws")?;
    let snapshot = next_message_of_type(&mut ws, "snapshot", Duration::from_secs(2)).await?;
    anyhow::ensure!(
        snapshot["snapshot"]["dashboardData"].is_object(),
        "unexpected snapshot: {snapshot}"
    );

    let selected = client
        .post(server.url("/api/select/run-a"))
        .send()
        .await?;
    anyhow::ensure!(selected.status() == 200, "expected 200, got {}", selected.status());

    let update = next_message_of_type(&mut ws, "update", Duration::from_secs(3)).await?;
    anyhow::ensure!(update["dashboard"] == "run-a", "unexpected update: {update}");
    anyhow::ensure!(
        update["row"]["vus"].as_u64() == Some(2),
        "expected two VUs in the tick row: {update}"
    );

    // The run goes dark: after three consecutive failed polls the dashboard
    // must be declared stopped exactly once.
    metrics.state().set_mode(ResponseMode::Status(500));
    let stopped = next_message_of_type(&mut ws, "stopped", Duration::from_secs(5)).await?;
    anyhow::ensure!(stopped["dashboard"] == "run-a", "unexpected stop: {stopped}");
    let stop_time = stopped["stop_time"]
        .as_str()
        .context("stop_time missing")?
        .to_string();
    anyhow::ensure!(!stop_time.is_empty() && stop_time != "0s", "bad stop time: {stop_time}");

    // The stop time is written through to the token and the snapshot.
    let list: serde_json::Value = client.get(server.url("/api/load")).send().await?.json().await?;
    anyhow::ensure!(
        list[0]["end_at"] == stop_time.as_str(),
        "token end_at not recorded: {list}"
    );
    let data: serde_json::Value = client
        .get(server.url("/api/dashboard-data"))
        .send()
        .await?
        .json()
        .await?;
    anyhow::ensure!(
        data["dashboardStopTimes"]["run-a"] == stop_time.as_str(),
        "snapshot missing stop time: {data}"
    );
    anyhow::ensure!(
        data["chartHistories"]["run-a"]["overall"]
            .as_array()
            .is_some_and(|points| !points.is_empty()),
        "expected chart history for the stalled run: {data}"
    );

    server.stop().await;
    metrics.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn switching_dashboards_cancels_the_previous_poller() -> anyhow::Result<()> {
    let metrics_a = MetricsServer::start().await.context("start metrics a")?;
    let metrics_b = MetricsServer::start().await.context("start metrics b")?;
    metrics_a.state().set_reports(sample_reports(1));
    metrics_b.state().set_reports(sample_reports(1));

    let server = Server::start(&["--poll-interval", "100ms"]).await?;
    let client = reqwest::Client::new();

    register(&client, &server, "run-a", &metrics_a.metrics_url()).await?;
    register(&client, &server, "run-b", &metrics_b.metrics_url()).await?;

    client.post(server.url("/api/select/run-a")).send().await?;
    tokio::time::timeout(Duration::from_secs(3), async {
        while metrics_a.state().requests_total() == 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .context("poller never reached metrics a")?;

    client.post(server.url("/api/select/run-b")).send().await?;

    // Give any in-flight request to A time to land, then the count must
    // freeze while B keeps being polled.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let frozen = metrics_a.state().requests_total();
    let b_before = metrics_b.state().requests_total();
    tokio::time::sleep(Duration::from_millis(500)).await;

    anyhow::ensure!(
        metrics_a.state().requests_total() == frozen,
        "cancelled poller kept polling metrics a"
    );
    anyhow::ensure!(
        metrics_b.state().requests_total() > b_before,
        "expected continued polling of metrics b"
    );

    server.stop().await;
    metrics_a.shutdown().await;
    metrics_b.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn selecting_an_already_stopped_run_does_not_poll() -> anyhow::Result<()> {
    let metrics = MetricsServer::start().await.context("start metrics server")?;
    metrics.state().set_mode(ResponseMode::Status(500));

    let server = Server::start(&["--poll-interval", "50ms", "--stall-threshold", "3"]).await?;
    let client = reqwest::Client::new();

    register(&client, &server, "run-a", &metrics.metrics_url()).await?;

    let (mut ws, _resp) = tokio_tungstenite::connect_async(server.ws_url()?)
        .await
        .context("connect ws")?;
    client.post(server.url("/api/select/run-a")).send().await?;
    next_message_of_type(&mut ws, "stopped", Duration::from_secs(5)).await?;

    let seen = metrics.state().requests_total();
    anyhow::ensure!(seen == 3, "expected exactly three failed polls, saw {seen}");

    // Re-selecting a stopped run reports its status without restarting the
    // loop.
    let res: serde_json::Value = client
        .post(server.url("/api/select/run-a"))
        .send()
        .await?
        .json()
        .await?;
    anyhow::ensure!(res["status"] == "Stopped", "unexpected response: {res}");

    tokio::time::sleep(Duration::from_millis(300)).await;
    anyhow::ensure!(
        metrics.state().requests_total() == seen,
        "stopped run was polled again"
    );

    server.stop().await;
    metrics.shutdown().await;
    Ok(())
}

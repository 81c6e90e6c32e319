use std::process::Stdio;
use std::time::Duration;

use anyhow::Context as _;
use tokio::io::{AsyncBufReadExt as _, BufReader};

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

    async fn stop(mut self) {
        let _ = self.child.kill().await;
    }
}

fn token_payload(id: &str, title: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "title": title,
        "url": "http://127.0.0.1:9/metrics",
        "loadOptions": { "Profile": "smoke", "VUs": 2, "Duration": "1m", "RPS": 10 },
    })
}

#[tokio::test]
async fn registry_create_list_duplicate_delete() -> anyhow::Result<()> {
    let server = Server::start(&[]).await?;
    let client = reqwest::Client::new();

    let created = client
        .post(server.url("/api/load"))
        .json(&token_payload("run-a", "Run A"))
        .send()
        .await
        .context("create token")?;
    anyhow::ensure!(created.status() == 201, "expected 201, got {}", created.status());
    let body: serde_json::Value = created.json().await?;
    anyhow::ensure!(body["success"] == true, "unexpected body: {body}");
    anyhow::ensure!(body["id"] == "run-a", "unexpected body: {body}");
    anyhow::ensure!(body["title"] == "Run A", "unexpected body: {body}");

    // A second registration under the same id must conflict and must not
    // disturb the list.
    let dup = client
        .post(server.url("/api/load"))
        .json(&token_payload("run-a", "Run A again"))
        .send()
        .await?;
    anyhow::ensure!(dup.status() == 409, "expected 409, got {}", dup.status());

    let list: serde_json::Value = client.get(server.url("/api/load")).send().await?.json().await?;
    let tokens = list.as_array().context("expected array of tokens")?;
    anyhow::ensure!(tokens.len() == 1, "expected one token, got: {list}");
    anyhow::ensure!(tokens[0]["title"] == "Run A", "unexpected token: {list}");
    anyhow::ensure!(tokens[0]["end_at"] == "0s", "fresh token must be running: {list}");

    let deleted = client.delete(server.url("/api/load/run-a")).send().await?;
    anyhow::ensure!(deleted.status() == 200, "expected 200, got {}", deleted.status());

    let list: serde_json::Value = client.get(server.url("/api/load")).send().await?.json().await?;
    anyhow::ensure!(
        list.as_array().is_some_and(Vec::is_empty),
        "expected empty list, got: {list}"
    );

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn registry_missing_title_is_rejected() -> anyhow::Result<()> {
    let server = Server::start(&[]).await?;
    let client = reqwest::Client::new();

    let res = client
        .post(server.url("/api/load"))
        .json(&serde_json::json!({ "url": "http://127.0.0.1:9/metrics" }))
        .send()
        .await?;
    anyhow::ensure!(res.status() == 400, "expected 400, got {}", res.status());
    let body: serde_json::Value = res.json().await?;
    anyhow::ensure!(body["error"] == "Title is required", "unexpected body: {body}");
    anyhow::ensure!(body["success"] == false, "unexpected body: {body}");

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn registry_delete_unknown_is_not_found() -> anyhow::Result<()> {
    let server = Server::start(&[]).await?;
    let client = reqwest::Client::new();

    let res = client.delete(server.url("/api/load/ghost")).send().await?;
    anyhow::ensure!(res.status() == 404, "expected 404, got {}", res.status());

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn dashboard_data_roundtrips_through_the_server() -> anyhow::Result<()> {
    let server = Server::start(&[]).await?;
    let client = reqwest::Client::new();

    // A fresh server serves the empty shape, not an error.
    let empty: serde_json::Value = client
        .get(server.url("/api/dashboard-data"))
        .send()
        .await?
        .json()
        .await?;
    anyhow::ensure!(
        empty["dashboardData"].is_object(),
        "expected empty-shaped snapshot, got: {empty}"
    );

    let snapshot = serde_json::json!({
        "dashboardData": { "run-a": [] },
        "chartHistories": {
            "run-a": {
                "overall": [ { "timestamp": 1000, "avg_latency": 2.5 } ],
                "perStep": {},
                "perVU": {},
            }
        },
        "dashboardStopTimes": { "run-a": "1m 5s" },
    });
    let posted = client
        .post(server.url("/api/dashboard-data"))
        .json(&snapshot)
        .send()
        .await?;
    anyhow::ensure!(posted.status() == 200, "expected 200, got {}", posted.status());

    let read: serde_json::Value = client
        .get(server.url("/api/dashboard-data"))
        .send()
        .await?
        .json()
        .await?;
    anyhow::ensure!(
        read["dashboardStopTimes"]["run-a"] == "1m 5s",
        "stop time lost in roundtrip: {read}"
    );
    anyhow::ensure!(
        read["chartHistories"]["run-a"]["overall"][0]["avg_latency"] == 2.5,
        "history lost in roundtrip: {read}"
    );

    server.stop().await;
    Ok(())
}

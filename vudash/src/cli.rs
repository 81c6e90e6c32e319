use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use vudash_core::poller::DEFAULT_STALL_THRESHOLD;

fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("duration cannot be empty (expected e.g. 1s, 500ms, 1m)".to_string());
    }

    let number_end = s
        .char_indices()
        .find(|(_, ch)| !ch.is_ascii_digit())
        .map_or(s.len(), |(idx, _)| idx);

    if number_end == 0 {
        return Err(format!("invalid duration '{s}' (expected e.g. 1s, 500ms, 1m)"));
    }

    let (number_str, unit_str) = s.split_at(number_end);
    let value: u64 = number_str
        .parse()
        .map_err(|_| format!("invalid duration '{s}' (expected e.g. 1s, 500ms, 1m)"))?;
    if value == 0 {
        return Err(format!("duration '{s}' must be positive"));
    }

    match unit_str.trim() {
        "" | "s" | "sec" | "secs" | "second" | "seconds" => Ok(Duration::from_secs(value)),
        "ms" | "msec" | "msecs" | "millisecond" | "milliseconds" => {
            Ok(Duration::from_millis(value))
        }
        "m" | "min" | "mins" | "minute" | "minutes" => {
            let secs = value
                .checked_mul(60)
                .ok_or_else(|| format!("duration '{s}' is too large"))?;
            Ok(Duration::from_secs(secs))
        }
        "h" | "hr" | "hrs" | "hour" | "hours" => {
            let secs = value
                .checked_mul(60)
                .and_then(|v| v.checked_mul(60))
                .ok_or_else(|| format!("duration '{s}' is too large"))?;
            Ok(Duration::from_secs(secs))
        }
        _ => Err(format!("invalid duration '{s}' (expected e.g. 1s, 500ms, 1m)")),
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "vudash",
    author,
    version,
    about = "Monitoring dashboard for load-test runs",
    long_about = "vudash is a monitoring dashboard server for load-test runs.\n\nExternal load tools register a token (target metrics URL plus the VU/RPS/duration profile); selecting a token polls its metrics endpoint for live per-VU results, aggregates them, and keeps chart history. A run that stops answering is declared stopped after a few consecutive empty polls and its final state is snapshotted to disk.",
    after_help = "Examples:\n  vudash\n  vudash --bind 0.0.0.0:8088 --poll-interval 2s\n  vudash --data-dir /var/lib/vudash --keep-data"
)]
pub struct Cli {
    /// Address to serve the dashboard on
    #[arg(long, default_value = "127.0.0.1:8088")]
    pub bind: SocketAddr,

    /// Directory for the token registry and snapshot files
    #[arg(long, default_value = ".")]
    pub data_dir: PathBuf,

    /// Metrics poll interval (e.g. 1s, 500ms)
    #[arg(long, value_parser = parse_duration, default_value = "1s")]
    pub poll_interval: Duration,

    /// Consecutive failed/empty polls before a run is declared stopped
    #[arg(long, default_value_t = DEFAULT_STALL_THRESHOLD)]
    pub stall_threshold: u32,

    /// Keep the registry and snapshot files across restarts instead of
    /// resetting them on shutdown
    #[arg(long)]
    pub keep_data: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_accepts_common_units() {
        assert_eq!(parse_duration("500ms"), Ok(Duration::from_millis(500)));
        assert_eq!(parse_duration("1s"), Ok(Duration::from_secs(1)));
        assert_eq!(parse_duration("2m"), Ok(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("5x").is_err());
    }

    #[test]
    fn parse_duration_rejects_zero() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("0ms").is_err());
        assert!(parse_duration("0").is_err());
    }

    #[test]
    fn cli_defaults_are_sensible() {
        let cli = match Cli::try_parse_from(["vudash"]) {
            Ok(v) => v,
            Err(err) => panic!("failed to parse args: {err}"),
        };
        assert_eq!(cli.bind.port(), 8088);
        assert_eq!(cli.poll_interval, Duration::from_secs(1));
        assert_eq!(cli.stall_threshold, 3);
        assert!(!cli.keep_data);
    }

    #[test]
    fn cli_parses_overrides() {
        let cli = match Cli::try_parse_from([
            "vudash",
            "--bind",
            "0.0.0.0:9000",
            "--data-dir",
            "/tmp/vudash",
            "--poll-interval",
            "250ms",
            "--stall-threshold",
            "5",
            "--keep-data",
        ]) {
            Ok(v) => v,
            Err(err) => panic!("failed to parse args: {err}"),
        };
        assert_eq!(cli.bind.port(), 9000);
        assert_eq!(cli.data_dir, PathBuf::from("/tmp/vudash"));
        assert_eq!(cli.poll_interval, Duration::from_millis(250));
        assert_eq!(cli.stall_threshold, 5);
        assert!(cli.keep_data);
    }
}

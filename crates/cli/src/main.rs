use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

use packrat_core::{JobState, ObjectStore, S3ObjectStore, Settings, StatusView, summarize_archives};

/// First status check happens this long after the job starts.
const POLL_INITIAL_DELAY: Duration = Duration::from_secs(2);
/// Delay between subsequent polls, and after a transient poll error.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "packrat")]
#[command(about = "Content-store backup orchestration CLI", long_about = None)]
struct Cli {
    #[arg(long)]
    json: bool,

    #[arg(long, default_value = "http://127.0.0.1:8087")]
    daemon_url: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    Backup {
        #[command(subcommand)]
        cmd: BackupCmd,
    },
    Backups {
        #[command(subcommand)]
        cmd: BackupsCmd,
    },
}

#[derive(Subcommand)]
enum BackupCmd {
    Run {
        #[arg(long)]
        project_id: String,
        #[arg(long)]
        dataset: String,
        #[arg(long)]
        api_version: String,
        #[arg(long)]
        token: String,
        #[arg(long)]
        project_name: String,
        /// Start the job and exit without polling it to completion.
        #[arg(long)]
        no_wait: bool,
    },
}

#[derive(Subcommand)]
enum BackupsCmd {
    List,
    Download {
        #[arg(long)]
        key: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Deserialize)]
struct StartResponse {
    #[serde(rename = "backupId")]
    backup_id: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    packrat_core::init_logging();
    let cli = Cli::parse();

    let result = match cli.cmd {
        Command::Backup {
            cmd:
                BackupCmd::Run {
                    project_id,
                    dataset,
                    api_version,
                    token,
                    project_name,
                    no_wait,
                },
        } => {
            run_backup(
                &cli.daemon_url,
                &project_id,
                &dataset,
                &api_version,
                &token,
                &project_name,
                no_wait,
                cli.json,
            )
            .await
        }
        Command::Backups { cmd: BackupsCmd::List } => list_backups(cli.json).await,
        Command::Backups {
            cmd: BackupsCmd::Download { key, output },
        } => download_backup(&key, output).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_backup(
    daemon_url: &str,
    project_id: &str,
    dataset: &str,
    api_version: &str,
    token: &str,
    project_name: &str,
    no_wait: bool,
    json: bool,
) -> Result<(), String> {
    let client = reqwest::Client::new();
    let url = format!(
        "{}/api/backup/{project_id}/{dataset}/{api_version}/{token}/{project_name}",
        daemon_url.trim_end_matches('/')
    );

    let started: StartResponse = client
        .get(&url)
        .send()
        .await
        .map_err(|e| format!("start request failed: {e}"))?
        .error_for_status()
        .map_err(|e| format!("start request rejected: {e}"))?
        .json()
        .await
        .map_err(|e| format!("start response invalid: {e}"))?;

    if json {
        println!("{}", serde_json::json!({ "backupId": started.backup_id }));
    } else {
        println!("backup started: {}", started.backup_id);
    }
    if no_wait {
        return Ok(());
    }

    let status = poll_until_terminal(&client, daemon_url, &started.backup_id, json).await;
    match status.status {
        JobState::Completed => {
            if !json {
                println!(
                    "completed: {}",
                    status.s3_location.as_deref().unwrap_or("(no location)")
                );
            }
            Ok(())
        }
        _ => Err(format!(
            "backup failed: {}",
            status.error.as_deref().unwrap_or(&status.message)
        )),
    }
}

/// Polls the daemon until the job reports Completed or Failed. Runs
/// indefinitely by design; transport and parse errors are treated as
/// transient and simply retried on the next tick.
async fn poll_until_terminal(
    client: &reqwest::Client,
    daemon_url: &str,
    backup_id: &str,
    json: bool,
) -> StatusView {
    let url = format!(
        "{}/api/backup/status/{backup_id}",
        daemon_url.trim_end_matches('/')
    );

    tokio::time::sleep(POLL_INITIAL_DELAY).await;
    loop {
        match fetch_status(client, &url).await {
            Ok(view) => {
                if json {
                    println!(
                        "{}",
                        serde_json::to_string(&view).unwrap_or_else(|_| "{}".to_string())
                    );
                } else {
                    match view.progress {
                        Some(pct) => println!("{:?}: {} ({pct}%)", view.status, view.message),
                        None => println!("{:?}: {}", view.status, view.message),
                    }
                }
                if view.status.is_terminal() {
                    return view;
                }
            }
            Err(e) => {
                tracing::warn!(event = "poll.transient_error", error = %e, "poll.transient_error");
            }
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn fetch_status(client: &reqwest::Client, url: &str) -> Result<StatusView, String> {
    client
        .get(url)
        .send()
        .await
        .map_err(|e| format!("status request failed: {e}"))?
        .error_for_status()
        .map_err(|e| format!("status request rejected: {e}"))?
        .json::<StatusView>()
        .await
        .map_err(|e| format!("status response invalid: {e}"))
}

async fn list_backups(json: bool) -> Result<(), String> {
    let settings = Settings::from_env();
    settings.validate().map_err(|e| e.to_string())?;
    let store = S3ObjectStore::new(&settings).await;

    let objects = store.list_objects("").await.map_err(|e| e.to_string())?;
    let backups = summarize_archives(
        objects
            .into_iter()
            .map(|o| (o.key, o.size, o.last_modified)),
    );

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&backups).map_err(|e| e.to_string())?
        );
        return Ok(());
    }

    if backups.is_empty() {
        println!("no archives in s3://{}", settings.bucket);
        return Ok(());
    }
    for b in &backups {
        println!(
            "{}\t{}\t{}\t{}\t{}",
            b.date,
            b.project_name,
            b.dataset,
            human_size(b.size),
            b.key
        );
    }
    Ok(())
}

async fn download_backup(key: &str, output: Option<PathBuf>) -> Result<(), String> {
    if key.trim().is_empty() {
        return Err("key must not be empty".to_string());
    }
    let settings = Settings::from_env();
    settings.validate().map_err(|e| e.to_string())?;
    let store = S3ObjectStore::new(&settings).await;

    let download = store.download(key).await.map_err(|e| e.to_string())?;

    let output = output
        .unwrap_or_else(|| PathBuf::from(key.rsplit('/').next().unwrap_or(key)));
    let mut file = tokio::fs::File::create(&output)
        .await
        .map_err(|e| format!("create {}: {e}", output.display()))?;

    let mut stream = download.stream;
    let mut written: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| format!("download stream failed: {e}"))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| format!("write {}: {e}", output.display()))?;
        written += chunk.len() as u64;
    }
    file.flush()
        .await
        .map_err(|e| format!("flush {}: {e}", output.display()))?;

    println!("saved {} ({})", output.display(), human_size(written));
    Ok(())
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_size_picks_sensible_units() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(2048), "2.0 KiB");
        assert_eq!(human_size(5 * 1024 * 1024), "5.0 MiB");
    }

    #[test]
    fn status_view_parses_daemon_payload() {
        let body = r#"{
            "status": "uploading",
            "message": "uploading archive",
            "progress": 42,
            "startTime": 1700000000000,
            "duration": 12
        }"#;
        let view: StatusView = serde_json::from_str(body).unwrap();
        assert!(!view.status.is_terminal());
        assert_eq!(view.progress, Some(42));
    }

    #[test]
    fn terminal_states_stop_the_poller() {
        let completed = r#"{
            "status": "completed",
            "message": "backup completed",
            "progress": 100,
            "s3Location": "s3://bucket/acme-2025-01-15-production-abc123.tar.gz",
            "startTime": 1700000000000,
            "duration": 80
        }"#;
        let view: StatusView = serde_json::from_str(completed).unwrap();
        assert!(view.status.is_terminal());
        assert!(view.s3_location.is_some());
    }
}

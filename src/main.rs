use std::path::Path;

use futures_util::stream;
use serde_json::json;
use transcript_rs::config::{load_config, AppConfig};
use transcript_rs::observability::init_tracing;
use transcript_rs::protocol::canonical::StreamEvent;
use transcript_rs::stream::StreamDriver;

const CONFIG_ENV: &str = "TRANSCRIPT_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config.yaml";

fn main() {
    let Some(events_path) = std::env::args().nth(1) else {
        eprintln!("Usage: transcript <events.jsonl>");
        std::process::exit(2);
    };

    let config = resolve_config().unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        eprintln!("Please copy 'config.example.yaml' to 'config.yaml' and modify as needed.");
        std::process::exit(1);
    });

    init_tracing(&config.features.log_level);

    let contents = std::fs::read_to_string(&events_path).unwrap_or_else(|e| {
        eprintln!("Failed to read {events_path}: {e}");
        std::process::exit(1);
    });

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap_or_else(|e| {
            eprintln!("Failed to build tokio runtime: {e}");
            std::process::exit(1);
        });

    let code = runtime.block_on(replay(config, &contents));
    std::process::exit(code);
}

fn resolve_config() -> Result<AppConfig, transcript_rs::config::ConfigError> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return load_config(&path);
    }
    if Path::new(DEFAULT_CONFIG_PATH).exists() {
        return load_config(DEFAULT_CONFIG_PATH);
    }
    Ok(AppConfig::default())
}

/// Each non-blank line is one event; a malformed line fails the source.
fn decode_lines(contents: &str) -> impl Iterator<Item = Result<StreamEvent, String>> + '_ {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str::<StreamEvent>(line)
                .map_err(|e| format!("line {}: invalid event: {e}", idx + 1))
        })
}

async fn replay(config: AppConfig, contents: &str) -> i32 {
    let mut outcome = None;
    let result = StreamDriver::new(config.stream)
        .run(
            stream::iter(decode_lines(contents)),
            |snapshot| {
                tracing::debug!(
                    revision = %snapshot.revision,
                    messages = snapshot.message_count(),
                    sidecar = snapshot.sidecar.len(),
                    "snapshot"
                );
            },
            |completed| outcome = Some(completed),
        )
        .await;

    match result {
        Ok(transcript) => {
            print_json(&json!({ "outcome": outcome, "transcript": transcript }));
            0
        }
        Err(abort) => {
            eprintln!("Stream aborted: {abort}");
            if let Some(transcript) = abort.transcript {
                print_json(&json!({ "outcome": null, "transcript": transcript }));
            }
            1
        }
    }
}

fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("Failed to serialize output: {e}"),
    }
}

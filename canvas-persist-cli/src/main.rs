/*!
Canvas Persist CLI - Command-line interface for canvas snapshot history.

This CLI inspects and edits the history and undo stack kept in a
directory-backed store, the same layout the editor writes.
*/

use base64::{engine::general_purpose::STANDARD, Engine as _};
use canvas_persist_core::{
    create_persistence_from_config, default_transform, keys,
    observability::{init_observability, PersistMetrics},
    CanvasPersistenceInterface, PersistConfig, PersistConfigOverrides, StorageConfig,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tabled::{Table, Tabled};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "canvas-persist")]
#[command(about = "CLI for canvas snapshot history and undo persistence")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Print Prometheus metrics after the command completes
    #[arg(long, global = true)]
    print_metrics: bool,

    /// Store location (a directory, `memory://` or `disabled://`)
    #[arg(
        short,
        long,
        global = true,
        env = "CANVAS_PERSIST_PATH",
        default_value = "./canvas-store"
    )]
    path: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the saved canvas states, newest first
    List,
    /// Show the undo stack, newest first
    Undo,
    /// Save an image file as the current state or onto the undo stack
    Save {
        /// Image file to store
        image: PathBuf,
        /// Push onto the undo stack instead of saving as the current state
        #[arg(long)]
        undo: bool,
        /// Lossy compression quality in (0, 1]
        #[arg(short, long)]
        quality: Option<f32>,
    },
    /// Write the current state (or newest undo entry) to a file
    Load {
        /// Read the newest undo entry instead of the current state
        #[arg(long)]
        undo: bool,
        /// Output file
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Remove every persisted canvas record
    Clear {
        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Tabled)]
struct StateInfo {
    #[tabled(rename = "")]
    marker: &'static str,
    #[tabled(rename = "Timestamp")]
    timestamp: u64,
    #[tabled(rename = "Saved (UTC)")]
    saved: String,
    #[tabled(rename = "Chunks")]
    chunks: String,
    #[tabled(rename = "Size")]
    size: String,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    // Initialize logging
    if cli.json_logs {
        init_observability(true)?;
    } else {
        init_logging(cli.verbose);
    }

    let storage_config = StorageConfig::from_uri(&cli.path)?;

    match cli.command {
        Commands::List => list_states(&storage_config).await?,
        Commands::Undo => show_undo_stack(&storage_config).await?,
        Commands::Save {
            image,
            undo,
            quality,
        } => save_image(&storage_config, &image, undo, quality).await?,
        Commands::Load { undo, out } => load_image(&storage_config, undo, &out).await?,
        Commands::Clear { force } => clear_history(&storage_config, force).await?,
    }

    if cli.print_metrics {
        eprintln!("{}", PersistMetrics::global().gather_metrics()?);
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"))
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn open_canvas(
    storage_config: &StorageConfig,
    quality: Option<f32>,
) -> Result<Box<dyn CanvasPersistenceInterface>, anyhow::Error> {
    let config = PersistConfig::from_overrides(PersistConfigOverrides {
        compression_quality: quality,
        ..Default::default()
    })?;
    let canvas = create_persistence_from_config(storage_config, config, default_transform())?;
    if !canvas.is_enabled() {
        warn!("Store at {:?} is not usable; nothing will be persisted", storage_config);
    }
    Ok(canvas)
}

async fn list_states(storage_config: &StorageConfig) -> Result<(), anyhow::Error> {
    info!("Listing canvas states from {:?}", storage_config);

    let canvas = open_canvas(storage_config, None)?;
    let current = canvas.current_timestamp();

    let rows: Vec<StateInfo> = canvas
        .states()
        .into_iter()
        .map(|ts| {
            let payload = canvas.load_state(ts).into_value();
            StateInfo {
                marker: if Some(ts) == current { "*" } else { "" },
                timestamp: ts,
                saved: format_timestamp(ts),
                chunks: format_chunks(canvas.chunk_count(&keys::state_key(ts))),
                size: payload
                    .map(|p| format_size(p.len() as u64))
                    .unwrap_or_else(|| "Unknown".to_string()),
            }
        })
        .collect();

    if rows.is_empty() {
        println!("No canvas states found");
    } else {
        println!("{}", Table::new(rows));
    }

    Ok(())
}

async fn show_undo_stack(storage_config: &StorageConfig) -> Result<(), anyhow::Error> {
    info!("Showing undo stack from {:?}", storage_config);

    let canvas = open_canvas(storage_config, None)?;
    let entries = canvas.undo_entries();
    let top = entries.last().copied();

    let rows: Vec<StateInfo> = entries
        .iter()
        .rev()
        .map(|&ts| StateInfo {
            marker: if Some(ts) == top { "*" } else { "" },
            timestamp: ts,
            saved: format_timestamp(ts),
            chunks: format_chunks(canvas.chunk_count(&keys::undo_key(ts))),
            size: "-".to_string(),
        })
        .collect();

    if rows.is_empty() {
        println!("Undo stack is empty");
    } else {
        println!("{}", Table::new(rows));
    }

    Ok(())
}

async fn save_image(
    storage_config: &StorageConfig,
    image: &Path,
    undo: bool,
    quality: Option<f32>,
) -> Result<(), anyhow::Error> {
    let bytes = std::fs::read(image)?;
    let payload = to_data_uri(image, &bytes);
    info!("Saving {} ({})", image.display(), format_size(bytes.len() as u64));

    let mut canvas = open_canvas(storage_config, quality)?;
    let outcome = if undo {
        canvas.save_to_undo_stack(&payload).await
    } else {
        canvas.save_canvas_state(&payload).await
    };
    canvas.destroy().await;

    match outcome.diagnostic {
        Some(e) if e.is_quota_exceeded() => {
            return Err(anyhow::anyhow!("Snapshot was not saved: {e}"));
        }
        Some(e) => warn!("Snapshot saved with a warning: {}", e),
        None => {}
    }

    let target = if undo { "undo stack" } else { "current state" };
    println!("✓ Saved {} to the {target}", image.display());
    Ok(())
}

async fn load_image(
    storage_config: &StorageConfig,
    undo: bool,
    out: &Path,
) -> Result<(), anyhow::Error> {
    let canvas = open_canvas(storage_config, None)?;
    let outcome = if undo {
        canvas.load_from_undo_stack().await
    } else {
        canvas.load_canvas_state().await
    };

    if let Some(e) = &outcome.diagnostic {
        warn!("Snapshot read reported: {}", e);
    }
    let Some(payload) = outcome.value else {
        println!("Nothing saved");
        return Ok(());
    };

    let bytes = from_data_uri(&payload)?;
    std::fs::write(out, &bytes)?;
    println!("✓ Wrote {} to {}", format_size(bytes.len() as u64), out.display());
    Ok(())
}

async fn clear_history(storage_config: &StorageConfig, force: bool) -> Result<(), anyhow::Error> {
    if !force {
        print!("Are you sure you want to remove all canvas history? (y/N): ");
        use std::io::{self, Write};
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !input.trim().to_lowercase().starts_with('y') {
            println!("Clear cancelled");
            return Ok(());
        }
    }

    let mut canvas = open_canvas(storage_config, None)?;
    let outcome = canvas.clear();
    canvas.destroy().await;

    if let Some(e) = outcome.diagnostic {
        return Err(e.into());
    }
    println!("✓ Canvas history cleared");
    Ok(())
}

fn to_data_uri(path: &Path, bytes: &[u8]) -> String {
    let mime = match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    };
    format!("data:{mime};base64,{}", STANDARD.encode(bytes))
}

/// Bytes of a stored snapshot; payloads that are not data URIs are written as text
fn from_data_uri(payload: &str) -> Result<Vec<u8>, anyhow::Error> {
    match payload.split_once(',') {
        Some((header, body)) if header.starts_with("data:") && header.ends_with(";base64") => {
            Ok(STANDARD.decode(body)?)
        }
        _ => Ok(payload.as_bytes().to_vec()),
    }
}

fn format_chunks(count: Option<usize>) -> String {
    count
        .map(|c| c.to_string())
        .unwrap_or_else(|| "?".to_string())
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

fn format_timestamp(millis: u64) -> String {
    use chrono::{TimeZone, Utc};

    match i64::try_from(millis)
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        None => millis.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_uri_roundtrip() {
        let uri = to_data_uri(Path::new("sketch.PNG"), b"\x89PNG");
        assert!(uri.starts_with("data:image/png;base64,"));
        assert_eq!(from_data_uri(&uri).unwrap(), b"\x89PNG");
    }

    #[test]
    fn test_plain_payload_is_written_as_text() {
        assert_eq!(from_data_uri("state-1").unwrap(), b"state-1");
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(1_700_000_000_123), "2023-11-14 22:13:20.123");
        assert_eq!(format_timestamp(u64::MAX), u64::MAX.to_string());
    }

    #[test]
    fn test_cli_parses_save() {
        let cli = Cli::try_parse_from([
            "canvas-persist",
            "--path",
            "/tmp/store",
            "save",
            "img.png",
            "--undo",
            "--quality",
            "0.8",
        ])
        .unwrap();
        assert_eq!(cli.path, "/tmp/store");
        match cli.command {
            Commands::Save {
                image,
                undo,
                quality,
            } => {
                assert_eq!(image, PathBuf::from("img.png"));
                assert!(undo);
                assert_eq!(quality, Some(0.8));
            }
            _ => panic!("expected save"),
        }
    }
}

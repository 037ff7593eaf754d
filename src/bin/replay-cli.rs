use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::net::TcpListener;
use tokio::time::Instant;

use llm_replay_proxy::http::replay::serve_replay;
use llm_replay_proxy::lifecycle::{signals, Shutdown};
use llm_replay_proxy::observability::content_log::ContentLogger;
use llm_replay_proxy::observability::logging;
use llm_replay_proxy::recording::{Interaction, RecordingStore, Replay};

#[derive(Parser)]
#[command(name = "replay-cli")]
#[command(about = "Inspect and replay recorded LLM interactions", long_about = None)]
struct Cli {
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List recordings in a directory (defaults to the proxy's directory)
    List { dir: Option<PathBuf> },
    /// Print a recording's request, response head and chunk timing
    Show { file: PathBuf },
    /// Write the recorded body to stdout at the recorded pace
    Play {
        file: PathBuf,
        #[arg(short, long, default_value_t = 1.0)]
        speed: f64,
        /// Print assistant text instead of raw bytes
        #[arg(long)]
        text: bool,
    },
    /// Answer every HTTP request with the recording
    Serve {
        file: PathBuf,
        #[arg(short, long, default_value_t = 11434)]
        port: u16,
        #[arg(short, long, default_value_t = 1.0)]
        speed: f64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logging::init_tracing(&cli.log_level);

    match cli.command {
        Commands::List { dir } => {
            let store = RecordingStore::new(dir.unwrap_or_else(RecordingStore::default_directory));
            let files = store.list().await?;
            if files.is_empty() {
                eprintln!("No recordings in {}", store.directory().display());
            }
            for path in files {
                match RecordingStore::load(&path).await {
                    Ok(interaction) => println!("{}  {}", file_label(&path), summary(&interaction)),
                    Err(e) => println!("{}  <unreadable: {}>", file_label(&path), e),
                }
            }
        }
        Commands::Show { file } => {
            let interaction = RecordingStore::load(&file).await?;
            show(&interaction);
        }
        Commands::Play { file, speed, text } => {
            let interaction = RecordingStore::load(&file).await?;
            let replay = Replay::with_speed(interaction, speed)?;
            play(&replay, text).await?;
        }
        Commands::Serve { file, port, speed } => {
            let interaction = RecordingStore::load(&file).await?;
            let replay = Replay::with_speed(interaction, speed)?;

            let listener = TcpListener::bind(("0.0.0.0", port)).await?;
            eprintln!("Serving {} on {}", file.display(), listener.local_addr()?);

            let shutdown = Shutdown::new();
            signals::spawn_signal_listener(shutdown.clone());
            serve_replay(listener, replay, shutdown.subscribe()).await?;
        }
    }

    Ok(())
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn summary(interaction: &Interaction) -> String {
    let request = &interaction.request;
    match &interaction.response {
        Some(response) => format!(
            "{} {} -> {} ({} chunks, {} bytes, {} ms)",
            request.method,
            request.url,
            response.status.as_u16(),
            response.body_chunks.len(),
            response.body_len(),
            response.last_arrival().since(request.start_time).as_millis()
        ),
        None => format!("{} {} -> no response", request.method, request.url),
    }
}

fn show(interaction: &Interaction) {
    let request = &interaction.request;
    println!("{} {}", request.method, request.url);
    for (name, value) in request.headers.iter() {
        println!("  {}: {}", name, value);
    }
    if let Some(body) = &request.body {
        println!("  body: {}", String::from_utf8_lossy(body));
    }

    let Some(response) = &interaction.response else {
        println!("(no response recorded)");
        return;
    };
    println!();
    println!(
        "{:?} {} at +{} ms",
        response.version,
        response.status,
        response.header_arrival.offset().as_millis()
    );
    for (name, value) in response.headers.iter() {
        println!("  {}: {}", name, value);
    }
    let mut previous = response.header_arrival;
    for (i, chunk) in response.body_chunks.iter().enumerate() {
        println!(
            "  #{:<4} +{:>8.1} ms (Δ {:>7.1} ms) {:>6} bytes",
            i,
            chunk.arrival.offset().as_secs_f64() * 1000.0,
            chunk.arrival.since(previous).as_secs_f64() * 1000.0,
            chunk.bytes.len()
        );
        previous = chunk.arrival;
    }
    match response.end_time {
        Some(end) => println!("  end at +{} ms", end.offset().as_millis()),
        None => println!("  (incomplete)"),
    }
}

async fn play(replay: &Replay, text: bool) -> std::io::Result<()> {
    let interaction = replay.interaction();
    let path = url::Url::parse(&interaction.request.url)
        .map(|u| u.path().to_string())
        .unwrap_or_default();
    let mut content_log = ContentLogger::new(&interaction.request.method, &path);

    let start = Instant::now();
    let mut stdout = std::io::stdout();
    let mut chunks = replay.chunks();
    while let Some(bytes) = chunks.next().await {
        if text {
            for piece in content_log.observe_chunk(&bytes) {
                write!(stdout, "{}", piece)?;
            }
        } else {
            stdout.write_all(&bytes)?;
        }
        stdout.flush()?;
    }
    if text {
        writeln!(stdout)?;
    }

    eprintln!(
        "Replayed at {}x in {} ms (scheduled {} ms)",
        replay.speed().get(),
        start.elapsed().as_millis(),
        replay.total_duration().as_millis()
    );
    Ok(())
}

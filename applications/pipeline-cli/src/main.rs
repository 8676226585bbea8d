/// soul-pipeline - play a source through one pipeline controller
use anyhow::Context;
use clap::{Parser, Subcommand};
use soul_pipeline::{
    FaderCurve, FaderDirection, GraphState, PipelineController, PipelineEvent, PipelineSettings,
    SoftwareRuntime,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

const MS: u64 = 1_000_000;

#[derive(Parser)]
#[command(name = "soul-pipeline")]
#[command(about = "Play audio through a Soul pipeline", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "SOUL_PIPELINE_CONFIG")]
    config: Option<PathBuf>,

    /// Sink element (autoaudiosink, cpalsink, fakesink)
    #[arg(long)]
    sink: Option<String>,

    /// Output device name substring
    #[arg(long, default_value = "")]
    device: String,

    /// Volume in percent
    #[arg(long, default_value_t = 100)]
    volume: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play a file or URL
    Play {
        /// File path or URL
        source: String,

        /// Stop at this position (milliseconds)
        #[arg(long, default_value_t = 0)]
        end_ms: u64,

        /// Start at this position (milliseconds)
        #[arg(long, default_value_t = 0)]
        start_ms: u64,

        /// Source to continue with gaplessly
        #[arg(long)]
        next: Option<String>,

        /// Where the next source begins (milliseconds)
        #[arg(long, default_value_t = 0)]
        next_begin_ms: u64,

        /// Where the next source ends (milliseconds, 0 for its end)
        #[arg(long, default_value_t = 0)]
        next_end_ms: u64,

        /// Fade in over this many milliseconds
        #[arg(long)]
        fade_in_ms: Option<u64>,
    },
    /// Run a raw graph description, e.g. "audiotestsrc num-buffers=100"
    Launch {
        description: String,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "soul_pipeline=info,pipeline_cli=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let settings = PipelineSettings::load(cli.config.as_deref())?;
    settings.validate()?;
    let runtime = Arc::new(SoftwareRuntime::new(&settings));
    let mut pipeline = PipelineController::new(runtime, settings.clone());

    let sink = cli.sink.unwrap_or_else(|| settings.output.sink.clone());
    pipeline.set_output_device(&sink, &cli.device)?;
    pipeline.set_volume(cli.volume);

    match cli.command {
        Commands::Play {
            source,
            end_ms,
            start_ms,
            next,
            next_begin_ms,
            next_end_ms,
            fade_in_ms,
        } => {
            let url = parse_source(&source)?;
            tracing::info!(url = %url, "Playing");
            pipeline.init_from_url(url, end_ms * MS)?;

            if start_ms > 0 {
                pipeline.seek(start_ms * MS);
            }
            if let Some(next) = next {
                pipeline.set_next_url(parse_source(&next)?, next_begin_ms * MS, next_end_ms * MS);
            }
            if let Some(fade) = fade_in_ms {
                pipeline.start_fader(
                    Duration::from_millis(fade),
                    FaderDirection::Forward,
                    FaderCurve::EaseInOut,
                );
            }
        }
        Commands::Launch { description } => {
            pipeline.init_from_description(&description)?;
        }
    }

    pipeline.request_state(GraphState::Playing);
    run(&mut pipeline)
}

/// Pump the controller until the stream ends or fails
fn run(pipeline: &mut PipelineController) -> anyhow::Result<()> {
    let events = pipeline.events();
    let mut last_report = 0;

    loop {
        pipeline.wait_and_dispatch(Duration::from_millis(100));

        for event in events.try_iter() {
            match event {
                PipelineEvent::EndOfStreamReached {
                    has_next_track: true,
                    ..
                } => {
                    println!("→ {}", pipeline.url().map_or("?", Url::as_str));
                }
                PipelineEvent::EndOfStreamReached { .. } => {
                    println!("End of stream");
                    return Ok(());
                }
                PipelineEvent::MetadataFound { bundle, .. } => {
                    println!("♪ {} - {} ({})", bundle.artist, bundle.title, bundle.album);
                }
                PipelineEvent::Error {
                    message,
                    domain,
                    code,
                    ..
                } => {
                    anyhow::bail!("{message} (domain {domain}, code {code})");
                }
                PipelineEvent::FaderFinished { .. } => {
                    tracing::debug!("Fade finished");
                }
            }
        }

        let seconds = pipeline.position() / 1_000_000_000;
        if seconds != last_report {
            last_report = seconds;
            let length = pipeline.length() / 1_000_000_000;
            println!("{}:{:02} / {}:{:02}", seconds / 60, seconds % 60, length / 60, length % 60);
        }
    }
}

fn parse_source(source: &str) -> anyhow::Result<Url> {
    if let Ok(url) = Url::parse(source) {
        if url.scheme().len() > 1 {
            return Ok(url);
        }
    }
    let path = Path::new(source);
    let path = path
        .canonicalize()
        .with_context(|| format!("No such file: {source}"))?;
    Url::from_file_path(&path).map_err(|()| anyhow::anyhow!("Not a file path: {}", path.display()))
}

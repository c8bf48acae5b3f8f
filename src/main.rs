use anyhow::{anyhow, Context};
use chunked_tts::tts::{scratch_dir, write_empty_wav, AudioSink, RodioSink, WavFileSink};
use chunked_tts::{EngineBuilder, Language, PipelineConfig, RequestOutcome, TextInspector, TtsEngine};
use clap::{Parser, Subcommand};
use log::{debug, info, warn};
use std::path::PathBuf;

/// Long-text speech synthesis with gapless chunked playback
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Language of the input text (ja, en)
    #[arg(short, long, global = true, default_value = "ja")]
    lang: Language,

    /// Pipeline config file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log pipeline progress at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Speak text through the default output device (`@path` reads a file)
    Speak { input: String },

    /// Render text to a WAV file
    Save {
        input: String,
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Print the comma-separated phonemes of the text
    Phonemes { text: String },

    /// Print the chunks the text is split into
    Segment { input: String },

    /// Write a zero-length WAV container
    EmptyWav { path: PathBuf },
}

fn read_input(input: &str) -> anyhow::Result<String> {
    match input.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read input file {}", path)),
        None => Ok(input.to_string()),
    }
}

/// Run one request to completion; Ctrl-C cancels it.
async fn run_request(engine: &TtsEngine, text: String, language: Language) -> anyhow::Result<()> {
    let (tx, mut rx) = tokio::sync::oneshot::channel();
    let handle = engine.synthesize_long_text(
        text,
        language,
        |played| info!("[CLI] chunk {}/{} played", played.index, played.total),
        move |outcome| {
            let _ = tx.send(outcome);
        },
    );

    let outcome = tokio::select! {
        outcome = &mut rx => outcome,
        _ = tokio::signal::ctrl_c() => {
            info!("[CLI] interrupted, cancelling");
            handle.cancel();
            rx.await
        }
    }
    .context("Request ended without reporting an outcome")?;

    match outcome {
        RequestOutcome::Completed { played } => {
            debug!("[CLI] {} chunks played", played);
            Ok(())
        }
        RequestOutcome::Cancelled { played } => {
            warn!("[CLI] cancelled after {} chunks", played);
            Ok(())
        }
        RequestOutcome::Failed { played, error } => Err(anyhow!(error))
            .with_context(|| format!("Synthesis stopped after {} chunks", played)),
    }
}

fn engine(config: &PipelineConfig, sink: Box<dyn AudioSink>) -> anyhow::Result<TtsEngine> {
    TtsEngine::placeholder(config.clone(), sink).context("Failed to build the TTS engine")
}

fn inspector(config: &PipelineConfig) -> anyhow::Result<TextInspector> {
    EngineBuilder::new(config.clone())
        .inspector()
        .context("Failed to build the text front-end")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let dotenv = dotenvy::dotenv();
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
    match dotenv {
        Ok(path) => debug!("[ENV] Loaded .env from: {:?}", path),
        Err(e) => debug!("[ENV] No .env loaded: {}", e),
    }

    let config = PipelineConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let format = config.audio_format();

    match cli.command {
        Commands::Speak { input } => {
            let text = read_input(&input)?;
            let sink = RodioSink::open(format).context("Failed to open the audio output device")?;
            let engine = engine(&config, Box::new(sink))?;
            run_request(&engine, text, cli.lang).await?;
        }
        Commands::Save { input, output } => {
            let text = read_input(&input)?;
            let sink = WavFileSink::scratch(format)
                .with_context(|| format!("Failed to create scratch audio in {}", scratch_dir().display()))?
                .persist_on_finish(&output);
            let engine = engine(&config, Box::new(sink))?;
            run_request(&engine, text, cli.lang).await?;
            if output.exists() {
                println!("{}", output.display());
            }
        }
        Commands::Phonemes { text } => {
            let inspector = inspector(&config)?;
            println!("{}", inspector.inspect_phonemes(&text, cli.lang)?);
        }
        Commands::Segment { input } => {
            let text = read_input(&input)?;
            let inspector = inspector(&config)?;
            for chunk in inspector.segment(&text, cli.lang)? {
                let span = chunk.span();
                println!("{:>4} [{}..{}] {}", chunk.index(), span.start, span.end, chunk.text());
            }
        }
        Commands::EmptyWav { path } => {
            write_empty_wav(&path, format)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("{}", path.display());
        }
    }

    Ok(())
}

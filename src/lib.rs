//! Landmark Guide
//!
//! Identifies a landmark from a photo and narrates its story in short
//! synthesized segments, with a guide chat and per-user scan history.

pub mod ai;
pub mod commands;
pub mod config;
pub mod history;
pub mod tour;
pub mod tts;

use ai::GeminiClient;
use anyhow::{anyhow, Context};
use clap::Parser;
use commands::{describe_status, image_mime_type, AppState, Command, Outcome};
use config::{Cli, Config};
use history::{FileStorage, HistoryStore};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tour::TourGuide;
use tts::{AudioDecoder, AudioOutput, ChunkFetcher, FallbackNarrator, NarrationSession, ProcessVoice};

pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?.with_cli(&cli);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    if cli.silent {
        return runtime.block_on(run_tour(cli, config, tts::SilentOutput::new()));
    }

    #[cfg(feature = "speaker")]
    let outcome = runtime.block_on(run_tour(cli, config, tts::RodioOutput::new()));
    #[cfg(not(feature = "speaker"))]
    let outcome = {
        log::warn!("Built without audio output, narration will be silent");
        runtime.block_on(run_tour(cli, config, tts::SilentOutput::new()))
    };
    outcome
}

async fn run_tour<O: AudioOutput>(cli: Cli, config: Config, output: O) -> anyhow::Result<()> {
    let mime_type = image_mime_type(&cli.image)
        .ok_or_else(|| anyhow!("unsupported image type: {}", cli.image.display()))?;
    let image = tokio::task::spawn_blocking({
        let path = cli.image.clone();
        move || std::fs::read(path)
    })
    .await?
    .with_context(|| format!("failed to read {}", cli.image.display()))?;

    let client = Arc::new(GeminiClient::new(config.gemini.clone()));
    let fetcher = ChunkFetcher::new(client.clone(), AudioDecoder::default());
    let fallback = config.fallback_voice.as_ref().map(|program| {
        log::info!("Using {} as fallback voice", program);
        FallbackNarrator::new(Arc::new(ProcessVoice::new(program.clone())))
    });

    let mut app = AppState::new(
        TourGuide::new(client, config.retry),
        NarrationSession::new(output, fetcher, fallback),
        HistoryStore::new(FileStorage::new(&config.history_dir, config.history_quota_bytes)),
        cli.user,
        config.language,
    );

    println!("Identifying landmark...");
    let result = app.scan(&image, mime_type).await?;
    println!(
        "\n{} ({:.0}% confidence)",
        result.landmark.name,
        result.landmark.confidence * 100.0
    );
    if !result.landmark.alternatives.is_empty() {
        println!("Could also be: {}", result.landmark.alternatives.join(", "));
    }
    println!("\n{}\n", result.details.text);
    for source in &result.details.sources {
        println!("  - {} <{}>", source.title, source.uri);
    }
    println!("\n[enter] play/pause  [r] restart  [h] history  [c] clear history  [q] quit");
    println!("Anything else is a question for the guide.\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut last_status = app.session.status();
    println!("{}", describe_status(last_status));

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    app.session.close();
                    break;
                };
                match app.execute(Command::parse(&line)).await {
                    Ok(Outcome::Reply(text)) => println!("{}", text),
                    Ok(Outcome::Done) => {}
                    Ok(Outcome::Quit) => break,
                    Err(e) => eprintln!("{}", e),
                }
                last_status = app.session.status();
            }
            Some(status) = app.session.next_event() => {
                if status != last_status {
                    println!("{}", describe_status(status));
                    last_status = status;
                }
            }
        }
    }

    Ok(())
}

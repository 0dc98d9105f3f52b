use anyhow::{Context, Result};
use clap::Parser;
use murmur::config::SpeechConfig;
use murmur::playback::{
    open_output_device, EngineParts, Pacing, PlaybackEngine, SpectrumAnalyzer, SpectrumEvent,
};
use murmur::{
    Gender, OrchestratorService, SpeechEvent, ToneBackend, Utterance, UtteranceStatus,
    VoiceDescriptor,
};
use std::path::PathBuf;
use std::thread;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "murmur", version, about = "Speak text as tone bursts, one per word")]
struct Cli {
    /// Text to speak; each argument is queued as its own utterance
    #[arg(required = true)]
    text: Vec<String>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Render headless at realtime pace instead of using the sound card
    #[arg(long = "virtual")]
    headless: bool,

    /// Log the dominant frequency of what is playing
    #[arg(long)]
    spectrum: bool,

    #[arg(long, default_value = "en-US")]
    locale: String,

    /// Speaking rate, 1.0 is normal
    #[arg(long)]
    rate: Option<f32>,

    /// Pitch multiplier, 1.0 is normal
    #[arg(long)]
    pitch: Option<f32>,
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "murmur=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => SpeechConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SpeechConfig::default(),
    };
    if cli.headless {
        config = config.headless(Pacing::Realtime);
    }
    config.validate()?;

    info!("Starting murmur");

    let device = open_output_device(&config.output)?;
    let mut parts = EngineParts::new(device);
    if cli.spectrum {
        let analyzer = SpectrumAnalyzer::new(2048);
        let frames = analyzer.subscribe();
        thread::Builder::new()
            .name("murmur-spectrum".into())
            .spawn(move || {
                while let Some(event) = frames.recv() {
                    match event {
                        SpectrumEvent::Frame(frame) => {
                            if let Some(peak) = frame.peak_frequency() {
                                info!("Spectrum peak {:.0} Hz", peak);
                            }
                        }
                        SpectrumEvent::End => debug!("Spectrum session ended"),
                    }
                }
            })
            .context("spawning spectrum logger")?;
        parts = parts.with_spectrum(analyzer);
    }

    let (engine, engine_join) = PlaybackEngine::spawn(config.engine.clone(), parts)?;
    let backend = ToneBackend::new("tone", config.tone.clone(), engine.clone())?;

    let service = OrchestratorService::new(&config.service);
    let orchestrator = service.handle();
    let events = orchestrator.subscribe();
    let orchestrator_join = service.start_worker()?;
    orchestrator.register_backend(backend, true)?;

    let mut voice = VoiceDescriptor::new(cli.locale.clone(), Gender::Other);
    voice.rate = cli.rate;
    voice.pitch = cli.pitch;

    let utterances: Vec<_> = cli
        .text
        .iter()
        .map(|text| Utterance::new(text.clone(), voice.clone()))
        .collect();
    orchestrator.enqueue_all(utterances.clone())?;

    let mut failed = 0;
    while let Some(event) = events.recv() {
        match event {
            SpeechEvent::Status { utterance, status } => {
                info!("{} is {}", utterance, status);
                if status == UtteranceStatus::Speaking {
                    debug!("Played {:?} so far", engine.elapsed());
                }
            }
            SpeechEvent::WordBoundary { boundary, .. } => info!("Word: {}", boundary.word),
            SpeechEvent::Failed { utterance, error } => {
                warn!("{} failed: {}", utterance, error);
                failed += 1;
            }
            SpeechEvent::QueueDrained => break,
        }
    }

    orchestrator.shutdown()?;
    let _ = orchestrator_join.join();
    engine.shutdown()?;
    let _ = engine_join.join();

    if failed > 0 {
        anyhow::bail!("{} of {} utterance(s) failed", failed, utterances.len());
    }
    info!("Done");
    Ok(())
}

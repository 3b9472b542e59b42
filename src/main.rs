use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use secrecy::SecretString;

use parley_engine::characters::Catalog;
use parley_llm::{OpenAiCompatConfig, OpenAiCompatProvider};
use parley_server::collaborators::{MockStt, MockTts, PassthroughCodec};
use parley_server::settings::{self, Settings};
use parley_server::{ServerConfig, SessionDeps, SessionOptions};
use parley_telemetry::{init_telemetry, TelemetryConfig};

/// Session orchestration server for real-time voice characters.
#[derive(Debug, Parser)]
#[command(name = "parley", version)]
struct Args {
    /// Settings file (JSON). Defaults to ~/.parley/settings.json.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    port: Option<u16>,

    /// Directory of character files loaded into every new session.
    #[arg(long)]
    characters_dir: Option<PathBuf>,

    #[arg(long)]
    log_level: Option<String>,
}

fn load(args: &Args) -> anyhow::Result<Settings> {
    let path = args.config.clone().unwrap_or_else(settings::settings_path);
    let mut settings = settings::load_settings_from_path(&path)
        .with_context(|| format!("loading settings from {}", path.display()))?;
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    if let Some(dir) = &args.characters_dir {
        settings.characters.default_directory = dir.clone();
    }
    if let Some(level) = &args.log_level {
        settings.logging.level = level.clone();
    }
    Ok(settings)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let settings = load(&args)?;

    let log_level = settings
        .logging
        .level
        .parse::<tracing::Level>()
        .with_context(|| format!("invalid log level '{}'", settings.logging.level))?;
    let telemetry = init_telemetry(TelemetryConfig {
        log_level,
        json: settings.logging.json,
        ..Default::default()
    });

    let provider = OpenAiCompatProvider::new(OpenAiCompatConfig {
        base_url: settings.llm.base_url.clone(),
        model: settings.llm.model.clone(),
        api_key: settings.llm.api_key.clone().map(SecretString::from),
    })
    .context("building chat-completion client")?;

    // Speech services are external; the text-over-PCM stand-ins keep the
    // server usable end to end without them.
    let deps = SessionDeps {
        provider: Arc::new(provider),
        stt: Arc::new(MockStt::new()),
        tts: Arc::new(MockTts::new()),
        codec: Arc::new(PassthroughCodec),
        catalog: Arc::new(Catalog::builtin()),
        metrics: telemetry.metrics(),
        options: SessionOptions::from_settings(&settings),
    };

    tracing::info!(
        model = %settings.llm.model,
        characters = %settings.characters.default_directory.display(),
        "starting parley"
    );
    let handle = parley_server::start(ServerConfig::from_settings(&settings.server), deps)
        .await
        .context("starting server")?;
    tracing::info!(port = handle.port, "parley ready");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!(active_sessions = handle.active_sessions(), "shutting down");
    handle.shutdown().await;
    Ok(())
}

mod config;
mod context;
mod engine;
mod logging;
mod platform;
mod provider;
mod rules;
mod server;
mod session;
mod tools;

use crate::config::Config;
use crate::context::ContextBuilder;
use crate::engine::ChatEngine;
use crate::platform::memory::InMemoryPlatform;
use crate::platform::PipelinePlatform;
use crate::rules::RuleManager;
use crate::session::SessionManager;
use crate::tools::ToolRegistry;
use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "flowpilot", version)]
#[command(about = "AI copilot server for the ML pipeline control plane", long_about = None)]
struct Cli {
    /// Path to the config file. If omitted, discovered via FLOWPILOT_CONFIG,
    /// ./flowpilot.toml, or the user config directory.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Port for the HTTP server.
    #[arg(long)]
    port: Option<u16>,

    /// Directory of markdown rule files.
    #[arg(long)]
    rules_dir: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, config_path) = Config::load_with_path(cli.config.clone()).unwrap_or_else(|e| {
        eprintln!("Warning: failed to load config, using defaults: {e}");
        (Config::default(), None)
    });
    config.apply_env_overrides();

    let log_dir = match logging::setup_tracing(logging::LoggingSettings {
        level: config.logging.level.as_deref(),
        directory: config.logging.directory.as_deref(),
        retention_days: config.logging.retention_days,
    }) {
        Ok(path) => Some(path),
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    info!("--- flowpilot startup ---");
    match config_path.as_ref() {
        Some(path) => info!("Config File: {}", path.display()),
        None => info!("Config File: (default)"),
    }
    if let Some(dir) = log_dir.as_ref() {
        info!("Log Directory: {}", dir.display());
    }
    info!("Provider: {}", config.provider.kind);
    info!("Model: {}", config.provider.model);
    info!("Multi-user Mode: {}", config.auth.multi_user);

    let platform: Arc<dyn PipelinePlatform> = Arc::new(InMemoryPlatform::new(config.auth.clone()));
    let chat_model = provider::new_chat_model(&config.provider)?;

    let registry = Arc::new(ToolRegistry::new());
    tools::builtin::register_all(&registry, platform.clone());
    info!("Registered Tools: {:?}", registry.tool_names());

    let rules = Arc::new(RuleManager::new());
    let rules_dir = cli.rules_dir.or_else(|| config.rules_dir.clone());
    if let Some(dir) = rules_dir.as_ref() {
        rules.load_rules(dir)?;
    }

    let sessions = Arc::new(SessionManager::new());
    let _cleanup = SessionManager::spawn_cleanup(sessions.clone());

    let engine = Arc::new(ChatEngine::new(
        chat_model,
        registry,
        sessions,
        ContextBuilder::new(platform.clone()),
        rules,
    ));

    let state = Arc::new(server::AppState::new(engine, platform, &config.limits));
    let port = cli.port.unwrap_or(config.server.port);
    info!("-------------------------");

    server::start_server(state, port).await
}

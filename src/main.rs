//! Scribe CLI entry point

use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use scribe::adapters::{ChatServer, StreamChatServer};
use scribe::agent::{ModelClient, PromptBuilder, PromptRequest, ProviderRegistry};
use scribe::auth::{ClerkIdentity, DisabledIdentity, IdentityProvider, TokenSigner};
use scribe::config::Config;
use scribe::gateway::{self, AppState};
use scribe::registry::{AgentRegistry, RegistrySettings};
use scribe::ui;

#[derive(Parser)]
#[command(name = "scribe")]
#[command(about = "✎ Scribe - AI writing assistant for chat channels")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect credentials and write ~/.scribe/config.json
    Onboard,

    /// Send one prompt to the model and stream the answer to stdout
    Ask {
        /// Prompt text
        #[arg(short, long)]
        message: String,
    },

    /// Start the HTTP gateway and agent registry
    Gateway {
        /// Port to listen on (defaults to config / PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Show configuration status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Onboard => {
            scribe::config::onboard()?;
            ui::print_success("Scribe is ready!");
            println!("\nNext steps:");
            println!("  1. Try the model: scribe ask -m \"Tighten this sentence\"");
            println!("  2. Run the server: scribe gateway");
        }

        Commands::Ask { message } => {
            let config = scribe::config::load()?;
            run_ask(&config, &message).await?;
        }

        Commands::Gateway { port } => {
            let config = scribe::config::load()?;
            let port = port.unwrap_or(config.port);
            run_gateway(config, port).await?;
        }

        Commands::Status => {
            let config = scribe::config::load()?;
            print_status(&config);
        }
    }

    Ok(())
}

async fn run_ask(config: &Config, message: &str) -> Result<()> {
    let client = ProviderRegistry::create(config)?;
    let request = PromptRequest::new(message).with_system(PromptBuilder::new().build());

    ui::print_thinking(&format!("Asking {}", client.default_model()));
    let mut chunks = client.stream(&request).await?;

    let mut stdout = std::io::stdout();
    while let Some(chunk) = chunks.next().await {
        write!(stdout, "{}", chunk?)?;
        stdout.flush()?;
    }
    println!();
    Ok(())
}

async fn run_gateway(config: Config, port: u16) -> Result<()> {
    ui::print_header("Gateway");
    config.validate_gateway()?;

    let server: Arc<dyn ChatServer> = Arc::new(StreamChatServer::from_config(&config)?);
    let signer = Arc::new(TokenSigner::new(&config.stream_api_secret)?);

    let identity: Arc<dyn IdentityProvider> = match ClerkIdentity::from_config(&config) {
        Ok(clerk) => Arc::new(clerk),
        Err(e) => {
            warn!("Sign-in disabled, /token will reject every request: {}", e);
            ui::print_warning("Clerk is not configured; /token is disabled");
            Arc::new(DisabledIdentity)
        }
    };
    if config.gemini_api_key.is_empty() {
        ui::print_warning("GEMINI_API_KEY is not set; starting an agent will fail");
    }

    let registry = Arc::new(AgentRegistry::new(
        Arc::clone(&server),
        ProviderRegistry::factory(config.clone()),
        RegistrySettings::from_config(&config),
    ));
    registry.spawn_sweeper();

    let state = AppState {
        registry: Arc::clone(&registry),
        server,
        identity,
        signer,
        api_key: config.stream_api_key.clone(),
        default_channel_type: config.default_channel_type.clone(),
    };

    ui::print_success(&format!("Server is running on http://localhost:{}", port));
    gateway::serve(state, port, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
        }
    })
    .await?;

    ui::print_step("Shutting down agents");
    registry.shutdown().await;
    println!("\n👋 Bye!");
    Ok(())
}

fn print_status(config: &Config) {
    ui::print_header("Status");
    ui::print_field("Config", scribe::config::config_path().display());
    ui::print_field("Port", config.port);
    ui::print_field("Model", &config.model);
    ui::print_field("Stream key", ui::presence(&config.stream_api_key));
    ui::print_field("Stream secret", ui::presence(&config.stream_api_secret));
    ui::print_field("Gemini key", ui::presence(&config.gemini_api_key));
    ui::print_field("Clerk secret", ui::presence(&config.clerk_secret_key));
    ui::print_field("Clerk JWT key", ui::presence(&config.clerk_jwt_key));
    ui::print_field(
        "Idle sweep",
        format!(
            "every {}s, threshold {} min",
            config.sweep_interval_secs, config.idle_threshold_mins
        ),
    );
}

mod ask;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use ampere_config::{AppConfig, Strategy};
use ampere_llm::OpenAiClient;
use ampere_runtime::prompts::DEFAULT_QUESTION;
use ampere_tools::default_registry;

#[derive(Debug, Parser)]
#[command(
    name = "ampere",
    version,
    about = "Tool-augmented assistant for household energy data"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "config/default.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the chat endpoints over HTTP.
    Serve,
    /// Ask one question and print the answer.
    Ask {
        /// Defaults to a general analysis request.
        question: Option<String>,
        #[arg(long, value_enum)]
        strategy: Option<CliStrategy>,
        /// Talk to a running `ampere serve` instead of answering in-process.
        #[arg(long, value_name = "URL")]
        remote: Option<String>,
    },
    /// List the tools offered to the model.
    Tools,
    /// Check that the configured provider answers.
    Check,
    /// Write a default configuration file to the `--config` path.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliStrategy {
    Streaming,
    TwoPhase,
    Debug,
}

impl From<CliStrategy> for Strategy {
    fn from(value: CliStrategy) -> Self {
        match value {
            CliStrategy::Streaming => Strategy::Streaming,
            CliStrategy::TwoPhase => Strategy::TwoPhase,
            CliStrategy::Debug => Strategy::Debug,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.telemetry.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve => ampere_runtime::serve(&config).await?,
        Commands::Ask {
            question,
            strategy,
            remote,
        } => {
            let question = question.unwrap_or_else(|| DEFAULT_QUESTION.to_string());
            let strategy = strategy.map(Strategy::from).unwrap_or(config.pipeline.strategy);
            let remote = remote.or_else(|| config.remote_url().map(str::to_string));
            ask::run(&config, &question, strategy, remote.as_deref()).await?;
        }
        Commands::Tools => {
            let registry = default_registry(&config.backend);
            for spec in registry.list_specs() {
                println!("{}", spec.name);
                println!("  {}", spec.description);
                for param in &spec.params {
                    let marker = if param.required { "required" } else { "optional" };
                    println!(
                        "  - {} ({}, {marker}): {}",
                        param.name,
                        param.param_type.as_str(),
                        param.description
                    );
                }
            }
        }
        Commands::Check => {
            if !config.llm.has_api_key() {
                anyhow::bail!("OpenAI API key not configured (set OPENAI_API_KEY)");
            }
            let client = OpenAiClient::new(&config.llm);
            let reply = client.check_liveness(config.llm.health_timeout()).await?;
            println!("model   : {}", client.model());
            println!("reply   : {reply}");
        }
        Commands::Init { force } => {
            if cli.config.exists() && !force {
                anyhow::bail!("{} already exists (use --force to overwrite)", cli.config.display());
            }
            AppConfig::default().save_to(&cli.config)?;
            println!("wrote {}", cli.config.display());
        }
    }

    Ok(())
}

mod commands;

use anyhow::anyhow;
use brulary::fetch::HttpFetcher;
use brulary::platform::{Arch, MacOsVersion, Os, Platform};
use brulary::{Api, EnvConfig, Formulary, MetadataCache};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use colored::Colorize;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "brulary")]
#[command(author, version, about = "Resolve Homebrew formulae and casks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Evaluate definitions for another OS (linux, macos, sonoma, ...)
    #[arg(long, global = true, value_name = "OS")]
    simulate_os: Option<String>,

    /// Evaluate definitions for another architecture (arm64, x86_64)
    #[arg(long, global = true, value_name = "ARCH")]
    simulate_arch: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show how references resolve, without compiling them
    Resolve {
        /// Names, tap-qualified names, paths, URLs or bottle files
        references: Vec<String>,
    },

    /// Show information about a formula
    Info {
        /// Formula reference
        formula: String,

        /// Use the head spec
        #[arg(long)]
        head: bool,

        /// Print the compiled definition as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show information about a cask
    Cask {
        /// Cask token, tap-qualified token, path or URL
        cask: String,

        /// Print the cask's definition source
        #[arg(long)]
        source: bool,

        /// Treat auto-updating and unversioned casks as upgradable
        #[arg(long)]
        greedy: bool,
    },

    /// Refresh the local copy of the API indexes
    Update {
        /// Rewrite the names files even if nothing changed
        #[arg(long)]
        force: bool,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate for
        shell: Shell,
    },
}

fn simulated_platform(os: Option<&str>, arch: Option<&str>) -> anyhow::Result<Platform> {
    let mut platform = Platform::current();

    if let Some(os) = os {
        platform.os = match os {
            "linux" => Os::Linux,
            "macos" => match platform.os {
                Os::MacOs(version) => Os::MacOs(version),
                Os::Linux => Os::MacOs(MacOsVersion::Sequoia),
            },
            name => Os::MacOs(
                MacOsVersion::from_name(name).ok_or_else(|| anyhow!("unknown OS: {}", name))?,
            ),
        };
    }
    if let Some(arch) = arch {
        platform.arch = Arch::from_name(arch).ok_or_else(|| anyhow!("unknown architecture: {}", arch))?;
    }

    Ok(platform)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let Some(command) = cli.command else {
        println!("Run {} to see available commands.", "brulary --help".cyan());
        return Ok(());
    };

    if let Commands::Completions { shell } = command {
        commands::completions(shell, &mut Cli::command());
        return Ok(());
    }

    let platform = simulated_platform(cli.simulate_os.as_deref(), cli.simulate_arch.as_deref())?;

    let mut config = EnvConfig::from_env();
    config.auto_update_command = matches!(command, Commands::Update { .. });
    let api = Api::new(
        Arc::new(HttpFetcher::new()?),
        Arc::new(config),
        Arc::new(MetadataCache::new()),
    )?;

    match command {
        Commands::Resolve { references } => {
            let formulary = Formulary::new(api, platform);
            commands::resolve(&formulary, &references).await?;
        }
        Commands::Info { formula, head, json } => {
            let formulary = Formulary::new(api, platform);
            commands::info(&formulary, &formula, head, json).await?;
        }
        Commands::Cask {
            cask,
            source,
            greedy,
        } => {
            let loader = brulary::CaskLoader::new(api, platform);
            commands::cask(&loader, &cask, source, greedy).await?;
        }
        Commands::Update { force } => {
            commands::update(&api, force).await?;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

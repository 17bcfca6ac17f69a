use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "telephony-mcp")]
#[command(about = "Vonage voice and SMS as MCP tools", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config file.
    Init {
        /// Config file path (default: TELEPHONY_CONFIG_PATH or ~/.telephony-mcp/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Run the MCP server and the callback receiver. Vonage credentials come from the config file or VONAGE_* environment variables (a .env file is read too).
    Serve {
        /// Config file path (default: TELEPHONY_CONFIG_PATH or ~/.telephony-mcp/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// MCP HTTP port (default from config or 8000)
        #[arg(long)]
        mcp_port: Option<u16>,

        /// Callback receiver port (default from config or 8080)
        #[arg(long)]
        callback_port: Option<u16>,

        /// Serve MCP over stdin/stdout instead of HTTP
        #[arg(long)]
        stdio: bool,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("telephony-mcp {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Serve {
            config,
            mcp_port,
            callback_port,
            stdio,
        }) => {
            if let Err(e) = run_serve(config, mcp_port, callback_port, stdio).await {
                log::error!("server failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(telephony::config::default_config_path);
    let dir = telephony::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_serve(
    config_path: Option<std::path::PathBuf>,
    mcp_port: Option<u16>,
    callback_port: Option<u16>,
    stdio: bool,
) -> anyhow::Result<()> {
    let (mut config, path) = telephony::config::load_config(config_path)?;
    if let Some(p) = mcp_port {
        config.mcp.port = p;
    }
    if let Some(p) = callback_port {
        config.callback.port = p;
    }
    log::info!("using config {}", path.display());
    telephony::server::run_server(config, stdio).await
}

use std::process::ExitCode;

use clap::Parser;
use log::error;

use socket_hub::config::{ServerConfig, CONFIG_FILE};
use socket_hub::server::WebSocketServer;
use socket_hub::service::{EchoService, StaticServiceLoader};

/// Multi-service WebSocket server. With no arguments the server runs as
/// configured in `server.config`.
#[derive(Parser, Debug)]
#[command(name = "socket-hub", disable_help_flag = true, disable_version_flag = true)]
struct Cli {
    /// Override configured port number
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Override configured host
    #[arg(short = 'h', long)]
    host: Option<String>,

    /// Override configured document root
    #[arg(short = 'd', long = "document-root")]
    document_root: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let config = match ServerConfig::load(CONFIG_FILE) {
        Ok(config) => config.apply_overrides(cli.port, cli.host, cli.document_root),
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let loader = StaticServiceLoader::new(&config.document_root)
        .register("index.ws", || EchoService)
        .register("echo.ws", || EchoService);

    let server = WebSocketServer::new(config, Box::new(loader));
    let shutdown = server.shutdown_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.set();
        }
    });

    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

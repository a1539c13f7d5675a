use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use mazurka::{logging, Config, Server};

#[derive(Parser)]
#[command(name = "mazurka")]
#[command(about = "Epoll reactor HTTP/1.1 static file server")]
#[command(version)]
struct Cli {
    /// Load environment variables from this file instead of ./.env
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Listening TCP port
    #[arg(long)]
    port: Option<u16>,

    /// Trigger mode: 0 LT/LT, 1 LT/ET, 2 ET/LT, 3 ET/ET
    #[arg(long)]
    trig_mode: Option<u8>,

    /// Idle connection timeout in milliseconds (0 disables)
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Worker threads (0 uses all cores)
    #[arg(long)]
    threads: Option<usize>,

    /// Static asset root
    #[arg(long)]
    src_dir: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Some(path) = &cli.env_file {
        if let Err(err) = dotenvy::from_path(path) {
            eprintln!("failed to load {}: {}", path.display(), err);
            return ExitCode::FAILURE;
        }
    }

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {}", err);
            return ExitCode::FAILURE;
        }
    };
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(trig_mode) = cli.trig_mode {
        config.trig_mode = trig_mode;
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.timeout_ms = timeout_ms;
    }
    if let Some(threads) = cli.threads {
        config.thread_num = threads;
    }
    if let Some(src_dir) = cli.src_dir {
        config.src_dir = Some(src_dir);
    }

    let _logger = match logging::init(&config) {
        Ok(logger) => logger,
        Err(err) => {
            eprintln!("failed to initialise logging: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let mut server = match Server::new(config) {
        Ok(server) => server,
        Err(err) => {
            error!(%err, "server init failed");
            eprintln!("server init failed: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let stop = server.stop_handle();
    if let Err(err) = ctrlc::set_handler(move || stop.stop()) {
        error!(%err, "failed to install SIGINT handler");
        return ExitCode::FAILURE;
    }

    server.run();
    ExitCode::SUCCESS
}

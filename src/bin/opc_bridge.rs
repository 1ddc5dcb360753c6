use std::path::PathBuf;
use std::process::exit;

use clap::Parser;
use opc_bridge::config::load_config;
use opc_bridge::ServerCore;

/// OPC-over-USB bridge: listens for Open Pixel Control frames and fans
/// pixel data out to attached Fadecandy and DMX-512 USB devices.
#[derive(Parser, Debug)]
struct Cli {
    /// Path to the JSON configuration document.
    config: PathBuf,
    /// Override the configured listen address (host:port).
    #[arg(short = 'l', long = "listen")]
    listen: Option<String>,
    /// Force verbose logging regardless of the configured value.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn parse_listen(spec: &str) -> std::io::Result<(String, u16)> {
    let (host, port) = spec.rsplit_once(':').ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("expected host:port, got {spec}"),
        )
    })?;
    let port: u16 = port
        .parse()
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid port"))?;
    Ok((host.to_string(), port))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::io::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            exit(1);
        }
    };

    if cli.verbose {
        config.verbose = true;
    }
    if let Some(listen) = &cli.listen {
        config.listen = match parse_listen(listen) {
            Ok(addr) => addr,
            Err(e) => {
                eprintln!("invalid --listen value: {e}");
                exit(1);
            }
        };
    }

    let listen = config.listen.clone();
    let core = match ServerCore::new(config, cli.config.clone()) {
        Ok(core) => core,
        Err(e) => {
            eprintln!("failed to initialize USB context: {e}");
            exit(1);
        }
    };

    println!("opc-bridge listening on {}:{}", listen.0, listen.1);
    core.run(listen).await
}

use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use portway::client::Client;
use portway::config::{ClientConfig, ServerConfig};
use portway::server::Server;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs the public tunnel server.
    Server {
        /// Path to the server JSON config file.
        #[clap(short, long, value_name = "FILE", env = "PORTWAY_SERVER_CONFIG")]
        config: PathBuf,
    },

    /// Runs the in-network client.
    Client {
        /// Path to the client JSON config file.
        #[clap(short, long, value_name = "FILE", env = "PORTWAY_CLIENT_CONFIG")]
        config: PathBuf,
    },
}

/// Blocking operator prompt; the line `exit` stops the server.
fn spawn_operator_prompt(shutdown: CancellationToken) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            print!("Enter 'exit' to stop server: ");
            let _ = std::io::stdout().flush();
            line.clear();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) if line.trim().eq_ignore_ascii_case("exit") => {
                    shutdown.cancel();
                    break;
                }
                Ok(_) => continue,
            }
        }
    });
}

async fn run(command: Command) -> Result<()> {
    match command {
        Command::Server { config } => {
            let config = ServerConfig::load(config)?;
            let shutdown = CancellationToken::new();
            let server = Server::new(config, shutdown.clone())?;
            spawn_operator_prompt(shutdown);
            server.listen().await?;
        }
        Command::Client { config } => {
            let config = ClientConfig::load(config)?;
            let client = Client::connect(config, CancellationToken::new()).await?;
            client.listen().await?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    run(Args::parse().command).await
}

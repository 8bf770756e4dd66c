//! `anonchat` binary entrypoint.
//!
//! Configuration is layered: built-in defaults, then `ANONCHAT_*` / `PORT`
//! environment variables, then the optional YAML file, then these flags.

use std::path::PathBuf;

use anonchat::{serve, ProxyConfig};
use anonchat_telemetry::{init_subscriber, TelemetryConfig};
use clap::Parser;

/// OpenAI-compatible proxy for the anonymous chat backend
#[derive(Parser, Debug)]
#[command(name = "anonchat")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// SOCKS or HTTP proxy for upstream traffic (e.g. socks5://127.0.0.1:1080)
    #[arg(long)]
    proxy: Option<String>,

    /// YAML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Upstream base URL
    #[arg(long)]
    base_url: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn load_config(&self) -> anyhow::Result<ProxyConfig> {
        let mut config = match &self.config {
            Some(path) => ProxyConfig::from_yaml_file(path)?,
            None => ProxyConfig::default(),
        };

        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(proxy) = &self.proxy {
            config.proxy = Some(proxy.clone());
        }
        if let Some(base_url) = &self.base_url {
            config.base_url = base_url.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_subscriber(&TelemetryConfig::default().with_json_output(cli.json_logs));

    let config = cli.load_config()?;
    serve(config).await
}

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use pairlink::config;

#[derive(Parser, Debug)]
#[command(name = "pairlink")]
#[command(version)]
#[command(about = "Code-based peer pairing over WebRTC data channels", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "pairlink.toml")]
    pub config: PathBuf,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,

    #[command(subcommand)]
    pub mode: Mode,
}

#[derive(Subcommand, Debug)]
pub enum Mode {
    /// Run the rendezvous server
    Serve {
        /// Listen port
        #[arg(short, long)]
        port: Option<u16>,

        /// Listen address
        #[arg(long)]
        host: Option<String>,
    },

    /// Register a pairing code and print everything the sender sends
    Receive {
        /// Rendezvous WebSocket URL
        #[arg(long)]
        url: Option<String>,
    },

    /// Pair with a receiver and send commands read from stdin
    Send {
        /// Six-digit pairing code shown by the receiver
        code: String,

        /// Rendezvous WebSocket URL
        #[arg(long)]
        url: Option<String>,

        /// Image to send as a screenshot once connected
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, Box<dyn std::error::Error>> {
        config::Config::load(&self.config)
    }

    /// Fold command line overrides into `config`
    pub fn apply_overrides(&self, config: &mut config::Config) {
        match &self.mode {
            Mode::Serve { port, host } => {
                if let Some(port) = port {
                    config.server.port = *port;
                }
                if let Some(host) = host {
                    config.server.host = host.clone();
                }
            }
            Mode::Receive { url } | Mode::Send { url, .. } => {
                if let Some(url) = url {
                    config.endpoint.signaling_url = url.clone();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_parses_code_and_overrides_url() {
        let args = Args::parse_from([
            "pairlink",
            "send",
            "482913",
            "--url",
            "ws://10.0.0.5:8080/signaling",
        ]);
        let mut config = config::Config::default();
        args.apply_overrides(&mut config);
        assert_eq!(config.endpoint.signaling_url, "ws://10.0.0.5:8080/signaling");
        match args.mode {
            Mode::Send { code, file, .. } => {
                assert_eq!(code, "482913");
                assert!(file.is_none());
            }
            other => panic!("unexpected mode {:?}", other),
        }
    }

    #[test]
    fn test_serve_port_override() {
        let args = Args::parse_from(["pairlink", "-v", "serve", "--port", "9000"]);
        assert!(args.verbose);
        let mut config = config::Config::default();
        args.apply_overrides(&mut config);
        assert_eq!(config.server.port, 9000);
    }
}

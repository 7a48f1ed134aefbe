//! Command-line surface.

use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;

/// HTTP egress filtering proxy.
#[derive(Debug, Parser)]
#[command(name = "ferryman", version, about)]
pub struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0")]
    pub ip: IpAddr,

    /// Port to listen on.
    #[arg(long, default_value_t = 4750)]
    pub port: u16,

    /// Path to a JSON configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["ferryman"]);
        assert_eq!(cli.ip, "0.0.0.0".parse::<IpAddr>().unwrap());
        assert_eq!(cli.port, 4750);
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_flags() {
        let cli = Cli::parse_from([
            "ferryman",
            "--ip",
            "127.0.0.1",
            "--port",
            "8888",
            "--config",
            "/etc/ferryman.json",
        ]);
        assert_eq!(cli.ip, "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(cli.port, 8888);
        assert_eq!(cli.config.unwrap(), PathBuf::from("/etc/ferryman.json"));
    }
}

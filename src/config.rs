//! CLI configuration: flags and env fallbacks per spec §6.

use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "wikimd", about = "A local-first wiki server", version)]
pub struct Config {
    /// Directory of markdown documents to serve.
    #[arg(short = 'r', long, env = "WIKIMD_ROOT", default_value = ".")]
    pub root: PathBuf,

    /// Port to bind; 0 auto-assigns.
    #[arg(short = 'p', long, env = "WIKIMD_PORT", default_value_t = 0)]
    pub port: u16,

    /// Open the default browser once the server is listening.
    #[arg(long, env = "WIKIMD_AUTO_OPEN", default_value_t = true)]
    pub auto_open: bool,

    /// Serve the dark theme by default.
    #[arg(long, env = "WIKIMD_DARK", default_value_t = true)]
    pub dark: bool,

    /// Override the embedded static asset directory.
    #[arg(long, env = "WIKIMD_ASSETS")]
    pub assets: Option<PathBuf>,

    /// Enable request logging.
    #[arg(short = 'v', long, env = "WIKIMD_VERBOSE", default_value_t = false)]
    pub verbose: bool,
}

impl Config {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), self.port)
    }

    pub fn server_url(&self, bound_port: u16) -> String {
        format!("http://127.0.0.1:{bound_port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = Config::parse_from(["wikimd"]);
        assert_eq!(config.root, PathBuf::from("."));
        assert_eq!(config.port, 0);
        assert!(config.auto_open);
        assert!(config.dark);
        assert!(!config.verbose);
        assert!(config.assets.is_none());
    }

    #[test]
    fn flags_override_defaults() {
        let config = Config::parse_from([
            "wikimd", "--root", "./wiki", "--port", "8080", "--verbose",
        ]);
        assert_eq!(config.root, PathBuf::from("./wiki"));
        assert_eq!(config.port, 8080);
        assert!(config.verbose);
    }

    #[test]
    fn server_url_uses_bound_port() {
        let config = Config::parse_from(["wikimd"]);
        assert_eq!(config.server_url(8080), "http://127.0.0.1:8080");
    }
}

use super::Parser;

#[derive(Parser, Debug)]
#[command(name = "stormgate", about = "Realtime HTTP/WebSocket/SSE gateway to a message bus")]
pub struct Cli {
    /// Settings file; defaults to settings/dev.toml (debug) or settings/release.toml.
    #[arg(long)]
    pub settings: Option<String>,

    /// Listen address, overriding `http.address`.
    #[arg(long, value_name = "HOST:PORT")]
    pub address: Option<String>,

    /// Load and validate the settings, then exit.
    #[arg(long)]
    pub check: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_flags() {
        let cli = Cli::parse_from(["stormgate", "--settings", "a.toml", "--address", "0.0.0.0:9000"]);
        assert_eq!(cli.settings.as_deref(), Some("a.toml"));
        assert_eq!(cli.address.as_deref(), Some("0.0.0.0:9000"));
        assert!(!cli.check);

        let cli = Cli::parse_from(["stormgate", "--check"]);
        assert!(cli.check);
        assert!(cli.settings.is_none());
    }
}

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Use this config file instead of the default location
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Override the directory holding the game's console log
    #[arg(long)]
    pub log_base_path: Option<PathBuf>,
    /// Override the port to host the HTTP API on
    #[arg(long)]
    pub web_port: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_overrides() {
        let args = Args::parse_from([
            "jk_chat_bridge",
            "--config",
            "/tmp/bridge.yaml",
            "--web-port",
            "4000",
        ]);
        assert_eq!(args.config, Some(PathBuf::from("/tmp/bridge.yaml")));
        assert_eq!(args.web_port, Some(4000));
        assert_eq!(args.log_base_path, None);
    }
}

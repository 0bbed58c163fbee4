use std::path::PathBuf;

use clap::Parser;

/// Bridge a Miniserver to an MQTT bus.
#[derive(Debug, Parser)]
#[command(name = "halox", version, about)]
pub struct Cli {
    /// Configuration file to use.
    #[arg(short, long, default_value = "configuration.yaml")]
    pub config: PathBuf,

    /// Print Home-Assistant switch YAML for the controller's devices and
    /// exit.
    #[arg(long)]
    pub print_hass: bool,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::parse_from(["halox"]);
        assert_eq!(cli.config, PathBuf::from("configuration.yaml"));
        assert!(!cli.print_hass);
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn flags_parse() {
        let cli = Cli::parse_from(["halox", "-c", "/etc/halox.yaml", "--print-hass", "-vv"]);
        assert_eq!(cli.config, PathBuf::from("/etc/halox.yaml"));
        assert!(cli.print_hass);
        assert_eq!(cli.verbose, 2);
    }
}

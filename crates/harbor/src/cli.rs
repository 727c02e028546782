//! Command line shared by every harbor service.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::overlay::parse_assignment;
use crate::config::OverrideEntry;

#[derive(Debug, Parser)]
#[command(version, about = "Run or check a harbor service", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the service until Ctrl-C or SIGTERM
    Server(ConfigArgs),
    /// Load and validate the configuration, then exit
    Check(ConfigArgs),
}

impl Command {
    pub fn config_args(&self) -> &ConfigArgs {
        match self {
            Command::Server(args) | Command::Check(args) => args,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    /// YAML (.yaml, .yml) or JSON configuration file; defaults apply when omitted
    pub file: Option<PathBuf>,

    /// Override a configuration value, e.g. `-D server.min_threads=4`
    #[arg(short = 'D', long = "define", value_name = "PATH=VALUE", value_parser = parse_assignment)]
    pub overrides: Vec<OverrideEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_file_and_overrides_in_order() {
        let cli = Cli::try_parse_from([
            "harbor",
            "server",
            "hello.yml",
            "-D",
            "server.min_threads=4",
            "--define",
            "logging.level=debug",
        ])
        .unwrap();
        let Command::Server(args) = cli.command else {
            panic!("expected the server command");
        };
        assert_eq!(args.file, Some(PathBuf::from("hello.yml")));
        assert_eq!(
            args.overrides,
            [
                OverrideEntry::new("server.min_threads", "4"),
                OverrideEntry::new("logging.level", "debug"),
            ]
        );
    }

    #[test]
    fn check_without_file_and_malformed_override() {
        let cli = Cli::try_parse_from(["harbor", "check"]).unwrap();
        assert!(matches!(cli.command, Command::Check(_)));
        assert!(cli.command.config_args().file.is_none());

        assert!(Cli::try_parse_from(["harbor", "check", "-D", "novalue"]).is_err());
    }
}

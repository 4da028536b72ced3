//! Command-line surface: `serve`, `work`, `cleanup`.

use clap::{ArgAction, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "docflow", version, about = "Asynchronous document processing pipeline")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the HTTP intake server.
    Serve,
    /// Run the background processing worker.
    Work,
    /// Sweep expired blobs past the retention window.
    Cleanup,
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as Parser>::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_flags_accumulate() {
        let cli = Cli::try_parse_from(["docflow", "-vv", "work"]).expect("parse");
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Some(Commands::Work)));
    }

    #[test]
    fn bare_invocation_has_no_command() {
        let cli = Cli::try_parse_from(["docflow"]).expect("parse");
        assert!(cli.command.is_none());
    }
}

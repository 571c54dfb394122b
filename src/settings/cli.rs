use super::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "portal-link", about = "Operator tool for the portal client core")]
pub struct Cli {
    #[arg(long)]
    pub settings: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Issue one authenticated GET and print the envelope's data.
    Get { path: String },
    /// Follow the realtime channel until Ctrl-C.
    Watch,
    /// Forget the persisted session.
    Logout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subcommands() {
        let cli = Cli::try_parse_from(["portal-link", "--settings", "a.toml", "get", "/merchants"])
            .unwrap();
        assert_eq!(cli.settings.as_deref(), Some("a.toml"));
        assert_eq!(
            cli.command,
            Some(Command::Get {
                path: "/merchants".to_string()
            })
        );

        let cli = Cli::try_parse_from(["portal-link", "watch"]).unwrap();
        assert_eq!(cli.command, Some(Command::Watch));
    }
}

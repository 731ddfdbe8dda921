use clap::{Args, Parser, Subcommand};

/// CLI surface for inspecting and maintaining the data key store.
#[derive(Parser, Debug)]
#[command(
    name = "datakeys",
    about = "Durable store for envelope-encryption data keys",
    version,
    propagate_version = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print version and exit.
    Version,
    /// Round-trip a probe key through the configured database.
    Health,
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Inspect and maintain data keys.
    #[command(subcommand)]
    Key(KeyCommand),
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum KeyCommand {
    /// List every stored key, active or not.
    List {
        /// Emit JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Show the active key with the given name.
    Get { name: String },
    /// Store a new active key.
    Create(CreateArgs),
    /// Delete every key with the given name.
    Delete { name: String },
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct CreateArgs {
    #[arg(long)]
    pub name: String,
    /// Provider that wrapped the key material.
    #[arg(long)]
    pub provider: String,
    /// Wrapped key material, base64-encoded.
    #[arg(long)]
    pub data: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_health_subcommand() {
        let cli = Cli::try_parse_from(["datakeys", "health"]).expect("parse should succeed");
        assert_eq!(cli.command, Command::Health);
    }

    #[test]
    fn requires_a_subcommand() {
        assert!(Cli::try_parse_from(["datakeys"]).is_err());
    }

    #[test]
    fn parses_config_init_subcommand() {
        let cli =
            Cli::try_parse_from(["datakeys", "config", "init"]).expect("parse should succeed");
        assert_eq!(cli.command, Command::Config(ConfigCommand::Init));
    }

    #[test]
    fn parses_key_list_json() {
        let cli = Cli::try_parse_from(["datakeys", "key", "list", "--json"])
            .expect("parse should succeed");
        assert_eq!(cli.command, Command::Key(KeyCommand::List { json: true }));
    }

    #[test]
    fn parses_key_create() {
        let cli = Cli::try_parse_from([
            "datakeys", "key", "create", "--name", "k1", "--provider", "p1", "--data", "AQI=",
        ])
        .expect("parse should succeed");
        assert_eq!(
            cli.command,
            Command::Key(KeyCommand::Create(CreateArgs {
                name: "k1".into(),
                provider: "p1".into(),
                data: "AQI=".into(),
            }))
        );
    }

    #[test]
    fn create_requires_provider() {
        let err = Cli::try_parse_from([
            "datakeys", "key", "create", "--name", "k1", "--data", "AQI=",
        ])
        .expect_err("missing provider");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }
}

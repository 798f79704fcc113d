use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "fieldsync",
    version,
    about = "CRM sync, inventory, team KPIs and billing for cleaning crews"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the HTTP server (default if no subcommand given).
    Serve {
        #[arg(long, env = "FIELDSYNC_HOST", default_value = "0.0.0.0")]
        host: String,
        #[arg(long, env = "FIELDSYNC_PORT", default_value = "8000")]
        port: u16,

        /// Data directory (SQLite database + master key) when no DATABASE_URL is set.
        #[arg(long, env = "FIELDSYNC_DATA_DIR", default_value = ".fieldsync")]
        data_dir: PathBuf,
    },

    /// Apply the database schema.
    Migrate {
        /// Overrides DATABASE_URL.
        #[arg(long)]
        database_url: Option<String>,

        #[arg(long, env = "FIELDSYNC_DATA_DIR", default_value = ".fieldsync")]
        data_dir: PathBuf,
    },

    /// Print the effective configuration (secrets redacted).
    Config {
        #[arg(long, env = "FIELDSYNC_DATA_DIR", default_value = ".fieldsync")]
        data_dir: PathBuf,
    },

    /// Check connectivity of the configured database.
    Check {
        #[arg(long, env = "FIELDSYNC_DATA_DIR", default_value = ".fieldsync")]
        data_dir: PathBuf,
    },
}

impl Commands {
    pub fn default_serve() -> Self {
        Commands::Serve {
            host: "0.0.0.0".to_string(),
            port: 8000,
            data_dir: PathBuf::from(".fieldsync"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_flags_parse() {
        let cli = Cli::try_parse_from(["fieldsync", "serve", "--port", "9000"]).unwrap();
        match cli.command {
            Some(Commands::Serve { port, .. }) => assert_eq!(port, 9000),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn no_subcommand_is_allowed() {
        let cli = Cli::try_parse_from(["fieldsync"]).unwrap();
        assert!(cli.command.is_none());
    }
}

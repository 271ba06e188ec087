//! CLI module for direct command-line usage
//!
//! Thin front end over [`Session`](crate::Session): every command connects,
//! does one thing and closes the session again.

mod runner;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

pub use runner::{resolve_target, run_auth_methods, run_capture, run_exec, run_fingerprint};

/// sshmux - run commands over multiplexed SSH channels
#[derive(Parser)]
#[command(name = "sshmux")]
#[command(about = "Run commands and inspect hosts over SSH")]
#[command(version)]
#[command(after_help = "EXAMPLES:
    # Run a command on a host profile from the config file
    sshmux exec build-box \"uname -a\"

    # Run a command on a raw host, password taken from the environment
    sshmux exec 10.0.0.5 --user deploy --password-env DEPLOY_PW \"uptime\" --chomp

    # Capture stdout and stderr separately
    sshmux capture build-box \"make check\"

    # Ask which authentication methods the server offers
    sshmux auth-methods build-box deploy

    # Show the host key fingerprint
    sshmux fingerprint build-box")]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// How to reach a host that has no profile, or overrides for one that does
#[derive(Args, Debug, Clone, Default)]
pub struct TargetArgs {
    /// Login user
    #[arg(short, long)]
    pub user: Option<String>,

    /// SSH port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Private key file
    #[arg(short, long)]
    pub key: Option<String>,

    /// Environment variable holding the login password
    #[arg(long, value_name = "VAR")]
    pub password_env: Option<String>,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run a command and print its output
    Exec {
        /// Host profile alias or hostname
        host: String,

        /// Command to execute
        command: String,

        /// Strip the trailing line terminator
        #[arg(long)]
        chomp: bool,

        /// Read at most this many bytes
        #[arg(short, long)]
        limit: Option<usize>,

        #[command(flatten)]
        target: TargetArgs,
    },

    /// Run a command, printing stdout and stderr separately
    Capture {
        /// Host profile alias or hostname
        host: String,

        /// Command to execute
        command: String,

        #[command(flatten)]
        target: TargetArgs,
    },

    /// List the authentication methods the server offers
    AuthMethods {
        /// Host profile alias or hostname
        host: String,

        /// User to ask for
        #[arg(value_name = "USER")]
        login: String,

        #[command(flatten)]
        target: TargetArgs,
    },

    /// Print the host key fingerprint
    Fingerprint {
        /// Host profile alias or hostname
        host: String,

        #[command(flatten)]
        target: TargetArgs,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_exec() {
        let cli = Cli::parse_from([
            "sshmux", "exec", "box", "uname -a", "--chomp", "--user", "demo", "-p", "2222",
        ]);
        match cli.command {
            Commands::Exec {
                host,
                command,
                chomp,
                limit,
                target,
            } => {
                assert_eq!(host, "box");
                assert_eq!(command, "uname -a");
                assert!(chomp);
                assert!(limit.is_none());
                assert_eq!(target.user.as_deref(), Some("demo"));
                assert_eq!(target.port, Some(2222));
            }
            _ => panic!("Expected Exec"),
        }
    }

    #[test]
    fn test_parse_auth_methods_with_config() {
        let cli = Cli::parse_from(["sshmux", "-c", "/tmp/c.yaml", "auth-methods", "box", "root"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.yaml")));
        assert!(matches!(
            cli.command,
            Commands::AuthMethods { ref host, ref login, .. } if host == "box" && login == "root"
        ));
    }
}

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{ConfigError, ProctorConfig};
use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "proctor",
    about = "Signaling client for proctored exam sessions",
    author,
    version
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "PROCTOR_SIGNALING_URL",
        value_name = "URL",
        help = "Base websocket url of the signaling server"
    )]
    pub signaling_url: Option<String>,

    #[arg(
        long,
        global = true,
        env = "PROCTOR_API_URL",
        value_name = "URL",
        help = "Base url of the exam backend REST api"
    )]
    pub api_url: Option<String>,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Environment configuration with the url flags layered on top.
    pub fn load_config(&self) -> Result<ProctorConfig, ConfigError> {
        ProctorConfig::from_lookup(|key| match key {
            "PROCTOR_SIGNALING_URL" => self
                .signaling_url
                .clone()
                .or_else(|| std::env::var(key).ok()),
            "PROCTOR_API_URL" => self.api_url.clone().or_else(|| std::env::var(key).ok()),
            _ => std::env::var(key).ok(),
        })
    }
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "PROCTOR_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "PROCTOR_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Follow lifecycle updates for one or more events on the shared status channel
    Status(StatusArgs),
    /// Open the primary session connection and print everything it carries
    Monitor(SessionArgs),
    /// Join a session as the secondary device and keep the presence alive
    Phone(PhoneArgs),
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(required = true, value_name = "EVENT_ID")]
    pub event_ids: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct SessionArgs {
    #[arg(long = "task", value_name = "ID")]
    pub task_id: String,

    #[arg(long = "session", value_name = "ID")]
    pub session_id: String,

    #[arg(long = "user", value_name = "ID")]
    pub user_id: String,

    #[arg(
        long = "send-link",
        value_name = "EMAIL",
        help = "Ask the backend to send the pairing link to this address"
    )]
    pub send_link: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct PhoneArgs {
    #[arg(long = "task", value_name = "ID")]
    pub task_id: String,

    #[arg(long = "session", value_name = "ID")]
    pub session_id: String,

    #[arg(long = "user", value_name = "ID")]
    pub user_id: String,

    #[arg(
        long,
        env = "PROCTOR_PASSCODE",
        hide_env_values = true,
        help = "Passcode presented in the verify message"
    )]
    pub passcode: String,

    #[arg(long, value_name = "TOKEN", help = "Pairing token from the emailed link")]
    pub token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phone_subcommand_parses() {
        let cli = Cli::try_parse_from([
            "proctor",
            "--signaling-url",
            "ws://exams.example.com/ws",
            "phone",
            "--task",
            "7",
            "--session",
            "42",
            "--user",
            "9",
            "--passcode",
            "1234",
            "--token",
            "abc",
        ])
        .unwrap();
        assert_eq!(cli.signaling_url.as_deref(), Some("ws://exams.example.com/ws"));
        match cli.command {
            Command::Phone(args) => {
                assert_eq!(args.session_id, "42");
                assert_eq!(args.token.as_deref(), Some("abc"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn status_needs_an_event_id() {
        assert!(Cli::try_parse_from(["proctor", "status"]).is_err());
        let cli = Cli::try_parse_from(["proctor", "status", "3", "4", "--log-level", "debug"]).unwrap();
        assert_eq!(cli.logging.level, LogLevel::Debug);
        assert!(matches!(cli.command, Command::Status(ref args) if args.event_ids == ["3", "4"]));
    }

    #[test]
    fn url_flags_override_the_environment() {
        let cli = Cli::try_parse_from([
            "proctor",
            "--api-url",
            "http://backend.test/api",
            "monitor",
            "--task",
            "7",
            "--session",
            "42",
            "--user",
            "9",
        ])
        .unwrap();
        let config = cli.load_config().unwrap();
        assert_eq!(config.api_url.as_str(), "http://backend.test/api/");
    }
}

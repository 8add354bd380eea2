//! Command-line surface and exit-code mapping.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chat_provider::{ChatError, Model};
use clap::{Parser, Subcommand};
use history_store::HistoryStore;

use crate::backends::BackendError;
use crate::commands::ExportFormat;
use crate::cookies::CookieError;
use crate::error::storage_error;
use crate::runtime::export_conversation;

pub const EXIT_OK: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_AUTH_REQUIRED: u8 = 2;
pub const EXIT_USAGE: u8 = 3;

#[derive(Debug, Parser)]
#[command(name = "gem-chat", version, about = "Chat with the web assistant from a terminal")]
pub struct Cli {
    /// Resume a stored conversation.
    #[arg(long, value_name = "ID")]
    pub conversation: Option<String>,

    /// Bind a persona by id or name.
    #[arg(long, value_name = "ID")]
    pub gem: Option<String>,

    /// Model for new turns; overrides the configured default.
    #[arg(long, value_name = "MODEL", value_parser = parse_model)]
    pub model: Option<Model>,

    /// Configuration root (cookies, config, history).
    #[arg(long, value_name = "DIR")]
    pub config_dir: Option<PathBuf>,

    /// Log to stderr instead of the log file.
    #[arg(long)]
    pub log_stderr: bool,

    #[command(subcommand)]
    pub command: Option<CliCommand>,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum CliCommand {
    /// List stored conversations.
    List,
    /// Export a conversation to a file.
    Export {
        id: String,
        path: PathBuf,
        #[arg(short = 'f', long, value_enum)]
        format: Option<ExportFormat>,
    },
    /// Delete a stored conversation.
    Delete { id: String },
}

fn parse_model(value: &str) -> Result<Model, String> {
    value.parse()
}

/// Prints one line per stored conversation.
pub fn list_conversations(history: &HistoryStore, out: &mut impl Write) -> Result<()> {
    for summary in history.list() {
        let star = if summary.favorite { "*" } else { " " };
        writeln!(
            out,
            "{star} {}\t{}\t{}\t{}",
            summary.id, summary.title, summary.model, summary.updated_at
        )?;
    }
    Ok(())
}

/// Exports `id` to `path`. Without `-f` the format follows the extension.
pub fn export_to_path(
    history: &HistoryStore,
    id: &str,
    path: &std::path::Path,
    format: Option<ExportFormat>,
) -> Result<ExportFormat> {
    let format = format.unwrap_or_else(|| {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ExportFormat::Json,
            _ => ExportFormat::Md,
        }
    });
    export_conversation(history, id, path, format)
        .with_context(|| format!("exporting conversation {id}"))?;
    Ok(format)
}

pub fn delete_conversation(history: &HistoryStore, id: &str) -> Result<()> {
    history
        .delete(id)
        .map_err(storage_error)
        .with_context(|| format!("deleting conversation {id}"))
}

/// Maps a top-level failure to the process exit code.
#[must_use]
pub fn exit_code_for(error: &anyhow::Error) -> u8 {
    for cause in error.chain() {
        let auth_required = matches!(
            cause.downcast_ref::<ChatError>(),
            Some(ChatError::AuthRequired)
        )
            || cause.downcast_ref::<CookieError>().is_some()
            || matches!(
                cause.downcast_ref::<BackendError>(),
                Some(BackendError::Cookies(_) | BackendError::Backend(ChatError::AuthRequired))
            );
        if auth_required {
            return EXIT_AUTH_REQUIRED;
        }
        if let Some(clap_error) = cause.downcast_ref::<clap::Error>() {
            return clap_exit_code(clap_error);
        }
    }
    EXIT_FAILURE
}

/// Prints a parse failure (or help text) and returns the exit code. Falls
/// back to plain stderr when clap cannot write its styled output.
pub fn report_clap_error(error: &clap::Error) -> u8 {
    if error.print().is_err() {
        eprintln!("{error}");
    }
    clap_exit_code(error)
}

/// Help and version requests succeed; everything else is a usage error.
#[must_use]
pub fn clap_exit_code(error: &clap::Error) -> u8 {
    use clap::error::ErrorKind;
    match error.kind() {
        ErrorKind::DisplayHelp
        | ErrorKind::DisplayVersion
        | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => EXIT_OK,
        _ => EXIT_USAGE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_start_options() {
        let cli = Cli::try_parse_from([
            "gem-chat",
            "--conversation",
            "abc",
            "--gem",
            "Tutor",
            "--model",
            "gemini-2.5-flash",
            "--log-stderr",
        ])
        .expect("valid args");

        assert_eq!(cli.conversation.as_deref(), Some("abc"));
        assert_eq!(cli.gem.as_deref(), Some("Tutor"));
        assert_eq!(cli.model, Some(Model::Flash25));
        assert!(cli.log_stderr);
        assert_eq!(cli.command, None);
    }

    #[test]
    fn parses_subcommands() {
        let cli = Cli::try_parse_from(["gem-chat", "export", "abc", "out.json", "-f", "json"])
            .expect("valid args");
        assert_eq!(
            cli.command,
            Some(CliCommand::Export {
                id: "abc".to_owned(),
                path: PathBuf::from("out.json"),
                format: Some(ExportFormat::Json),
            })
        );

        let cli = Cli::try_parse_from(["gem-chat", "delete", "abc"]).expect("valid args");
        assert_eq!(cli.command, Some(CliCommand::Delete { id: "abc".to_owned() }));
    }

    #[test]
    fn usage_errors_map_to_exit_three() {
        let error = Cli::try_parse_from(["gem-chat", "--model", "gpt"]).expect_err("bad model");
        assert_eq!(clap_exit_code(&error), EXIT_USAGE);

        let error = Cli::try_parse_from(["gem-chat", "--help"]).expect_err("help exits");
        assert_eq!(clap_exit_code(&error), EXIT_OK);
    }

    #[test]
    fn reported_clap_errors_keep_their_exit_code() {
        let error = Cli::try_parse_from(["gem-chat", "--version"]).expect_err("version exits");
        assert_eq!(report_clap_error(&error), EXIT_OK);

        let error =
            Cli::try_parse_from(["gem-chat", "delete"]).expect_err("missing id is a usage error");
        assert_eq!(report_clap_error(&error), EXIT_USAGE);
    }

    #[test]
    fn auth_failures_map_to_exit_two() {
        let error = anyhow::Error::new(ChatError::AuthRequired).context("sending");
        assert_eq!(exit_code_for(&error), EXIT_AUTH_REQUIRED);

        let error = anyhow::Error::new(ChatError::Transient("x".to_owned()));
        assert_eq!(exit_code_for(&error), EXIT_FAILURE);
    }
}

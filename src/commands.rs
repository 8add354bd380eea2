use std::path::PathBuf;

use chat_provider::Model;
use clap::ValueEnum;

/// Conversation export format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ExportFormat {
    #[default]
    Md,
    Json,
}

impl ExportFormat {
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Md => "md",
            Self::Json => "json",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Help,
    History,
    Gems,
    /// Binds a persona by id or name; `None` clears it.
    Gem(Option<String>),
    Model(Model),
    File(PathBuf),
    Image(PathBuf),
    /// Drops pending attachments.
    Clear,
    Export { path: PathBuf, format: ExportFormat },
    Choose(usize),
    Exit,
    /// A known command with bad arguments.
    Invalid { command: String, reason: String },
    Unknown(String),
}

pub const HELP_TEXT: &str = "\
/history                    list stored conversations
/gems                       list personas
/gem [ID|NAME]              bind a persona, or clear it
/model MODEL                switch the model for later turns
/file PATH                  attach a file to the next message
/image PATH                 attach an image to the next message
/clear                      drop pending attachments
/export PATH [-f md|json]   export this conversation
/choose N                   pick reply candidate N
/exit                       leave";

/// Parses a slash command. Returns `None` for ordinary prompts.
pub fn parse_chat_command(input: &str) -> Option<ChatCommand> {
    let trimmed = input.trim_start();
    if !trimmed.starts_with('/') {
        return None;
    }

    let (head, rest) = match trimmed.find(char::is_whitespace) {
        Some(split) => (&trimmed[..split], trimmed[split..].trim()),
        None => (trimmed.trim_end(), ""),
    };
    let command = head.to_ascii_lowercase();

    let parsed = match command.as_str() {
        "/help" => ChatCommand::Help,
        "/history" => ChatCommand::History,
        "/gems" => ChatCommand::Gems,
        "/gem" => ChatCommand::Gem((!rest.is_empty()).then(|| rest.to_owned())),
        "/model" => match rest.parse::<Model>() {
            Ok(model) => ChatCommand::Model(model),
            Err(reason) => invalid(&command, reason),
        },
        "/file" => match path_argument(rest) {
            Some(path) => ChatCommand::File(path),
            None => invalid(&command, "expected a path"),
        },
        "/image" => match path_argument(rest) {
            Some(path) => ChatCommand::Image(path),
            None => invalid(&command, "expected a path"),
        },
        "/clear" => ChatCommand::Clear,
        "/export" => parse_export(rest).unwrap_or_else(|reason| invalid(&command, reason)),
        "/choose" => match rest.parse::<usize>() {
            Ok(index) => ChatCommand::Choose(index),
            Err(_) => invalid(&command, "expected a candidate number"),
        },
        "/exit" | "/quit" => ChatCommand::Exit,
        _ => ChatCommand::Unknown(head.to_owned()),
    };

    Some(parsed)
}

fn parse_export(rest: &str) -> Result<ChatCommand, String> {
    let mut path = None;
    let mut format = None;
    let arguments = split_arguments(rest)?;
    let mut tokens = arguments.iter().map(String::as_str);
    while let Some(token) = tokens.next() {
        if token == "-f" || token == "--format" {
            let value = tokens.next().ok_or("-f needs md or json")?;
            format = Some(
                ExportFormat::from_str(value, true)
                    .map_err(|_| format!("unknown format '{value}'; expected md or json"))?,
            );
        } else if path.is_none() {
            path = Some(PathBuf::from(token));
        } else {
            return Err(format!("unexpected argument '{token}'"));
        }
    }

    let path = path.ok_or("expected a path")?;
    let format = format.unwrap_or_else(|| format_from_extension(&path));
    Ok(ChatCommand::Export { path, format })
}

fn format_from_extension(path: &std::path::Path) -> ExportFormat {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("json") => ExportFormat::Json,
        _ => ExportFormat::Md,
    }
}

/// Splits on whitespace; a double-quoted run stays one argument.
fn split_arguments(rest: &str) -> Result<Vec<String>, String> {
    let mut arguments = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quoted = false;

    for ch in rest.chars() {
        match ch {
            '"' => {
                quoted = !quoted;
                in_word = true;
            }
            ch if ch.is_whitespace() && !quoted => {
                if in_word {
                    arguments.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            ch => {
                current.push(ch);
                in_word = true;
            }
        }
    }

    if quoted {
        return Err("unterminated quote".to_owned());
    }
    if in_word {
        arguments.push(current);
    }
    Ok(arguments)
}

fn path_argument(rest: &str) -> Option<PathBuf> {
    let unquoted = rest
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(rest);
    (!unquoted.is_empty()).then(|| PathBuf::from(unquoted))
}

fn invalid(command: &str, reason: impl Into<String>) -> ChatCommand {
    ChatCommand::Invalid {
        command: command.to_owned(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn plain_prompts_are_not_commands() {
        assert_eq!(parse_chat_command("hello /file"), None);
        assert_eq!(parse_chat_command(""), None);
    }

    #[test]
    fn heads_are_case_insensitive_and_whitespace_tolerant() {
        assert_eq!(parse_chat_command("  /HISTORY  "), Some(ChatCommand::History));
        assert_eq!(parse_chat_command("\t/Gems"), Some(ChatCommand::Gems));
        assert_eq!(parse_chat_command("/Exit"), Some(ChatCommand::Exit));
        assert_eq!(parse_chat_command("/clear"), Some(ChatCommand::Clear));
    }

    #[test]
    fn attachments_take_the_rest_of_the_line() {
        assert_eq!(
            parse_chat_command("/file  my notes.txt "),
            Some(ChatCommand::File(PathBuf::from("my notes.txt")))
        );
        assert_eq!(
            parse_chat_command("/IMAGE \"shot 1.png\""),
            Some(ChatCommand::Image(PathBuf::from("shot 1.png")))
        );
        assert!(matches!(
            parse_chat_command("/file"),
            Some(ChatCommand::Invalid { .. })
        ));
    }

    #[test]
    fn export_paths_may_be_quoted() {
        assert_eq!(
            parse_chat_command(r#"/export "my chats/week 1.json""#),
            Some(ChatCommand::Export {
                path: PathBuf::from("my chats/week 1.json"),
                format: ExportFormat::Json,
            })
        );
        assert_eq!(
            parse_chat_command(r#"/export -f md "notes dir/out.txt""#),
            Some(ChatCommand::Export {
                path: PathBuf::from("notes dir/out.txt"),
                format: ExportFormat::Md,
            })
        );
        assert!(matches!(
            parse_chat_command(r#"/export "half open.md"#),
            Some(ChatCommand::Invalid { .. })
        ));
        assert!(matches!(
            parse_chat_command("/export two words.md"),
            Some(ChatCommand::Invalid { .. })
        ));
    }

    #[test]
    fn export_accepts_format_flag_or_extension() {
        assert_eq!(
            parse_chat_command("/export out.txt -f json"),
            Some(ChatCommand::Export {
                path: PathBuf::from("out.txt"),
                format: ExportFormat::Json,
            })
        );
        assert_eq!(
            parse_chat_command("/export chat.json"),
            Some(ChatCommand::Export {
                path: PathBuf::from("chat.json"),
                format: ExportFormat::Json,
            })
        );
        assert_eq!(
            parse_chat_command("/export chat"),
            Some(ChatCommand::Export {
                path: PathBuf::from("chat"),
                format: ExportFormat::Md,
            })
        );
        assert!(matches!(
            parse_chat_command("/export chat -f pdf"),
            Some(ChatCommand::Invalid { .. })
        ));
    }

    #[test]
    fn model_gem_and_choose_arguments() {
        assert_eq!(
            parse_chat_command("/model gemini-2.5-pro"),
            Some(ChatCommand::Model(Model::Pro25))
        );
        assert_eq!(
            parse_chat_command("/gem Code Tutor"),
            Some(ChatCommand::Gem(Some("Code Tutor".to_owned())))
        );
        assert_eq!(parse_chat_command("/gem"), Some(ChatCommand::Gem(None)));
        assert_eq!(parse_chat_command("/choose 2"), Some(ChatCommand::Choose(2)));
        assert!(matches!(
            parse_chat_command("/choose two"),
            Some(ChatCommand::Invalid { .. })
        ));
    }

    #[test]
    fn unknown_commands_keep_their_head() {
        assert_eq!(
            parse_chat_command("/frobnicate now"),
            Some(ChatCommand::Unknown("/frobnicate".to_owned()))
        );
    }
}

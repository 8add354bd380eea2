use std::io::{self, IsTerminal};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use gem_chat::backends::backend_for_config;
use gem_chat::cli::{
    delete_conversation, exit_code_for, export_to_path, list_conversations, report_clap_error,
    Cli, CliCommand,
};
use gem_chat::config::{process_env, resolve_config_root, Config};
use gem_chat::error::storage_error;
use gem_chat::logging::{init_logging, LogTarget};
use gem_chat::{AttachmentManager, ChatController, GemRegistry, Session, Shell};
use history_store::{history_root, HistoryStore};
use tracing::info;

const RESUME_TAIL: usize = 6;

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => return ExitCode::from(report_clap_error(&error)),
    };

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(exit_code_for(&error))
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let root = resolve_config_root(cli.config_dir.as_deref(), process_env)?;
    let mut config = Config::load_or_init(&root)?;
    config.apply_env_overrides(process_env)?;

    let log_target = if cli.log_stderr {
        LogTarget::Stderr
    } else {
        LogTarget::in_config_root(&root)
    };
    init_logging(&log_target, config.verbose).context("initializing logging")?;

    let history = Arc::new(HistoryStore::open(&history_root(&root))?);
    match cli.command {
        Some(CliCommand::List) => return list_conversations(&history, &mut io::stdout().lock()),
        Some(CliCommand::Export { id, path, format }) => {
            let format = export_to_path(&history, &id, &path, format)?;
            println!("Exported {} to {}.", format.extension(), path.display());
            return Ok(());
        }
        Some(CliCommand::Delete { id }) => {
            delete_conversation(&history, &id)?;
            println!("Deleted {id}.");
            return Ok(());
        }
        None => {}
    }

    let backend = backend_for_config(&config, &root)?;
    let resumed = match cli.conversation.as_deref() {
        Some(id) => Some(history.get(id).map_err(storage_error)?),
        None => None,
    };
    let session = match &resumed {
        Some(conversation) => {
            let session = Session::restore(Arc::clone(&backend), Arc::clone(&history), conversation);
            if let Some(model) = cli.model {
                session.set_model(model)?;
            }
            session
        }
        None => Session::with_history(
            Arc::clone(&backend),
            Arc::clone(&history),
            cli.model.unwrap_or(config.default_model),
        ),
    };

    let gems = GemRegistry::new(Arc::clone(&backend));
    if let Some(id_or_name) = cli.gem.as_deref() {
        gems.fetch(false).context("fetching gems")?;
        let gem = gems
            .get(id_or_name)
            .with_context(|| format!("no gem matches '{id_or_name}'"))?;
        session.set_gem(Some(gem.id))?;
    }

    let attachments =
        AttachmentManager::new(Arc::clone(&backend)).with_max_bytes(config.max_upload_bytes);
    let (controller, events) =
        ChatController::new(Arc::new(session), attachments, gems, Some(history));

    #[cfg(unix)]
    install_interrupt_handler(Arc::clone(&controller))?;

    info!(backend = %backend.profile().backend_id, "shell starting");
    let stdout = io::stdout();
    let styled = stdout.is_terminal();
    let mut shell = Shell::new(Arc::clone(&controller), events, io::stdin().lock(), stdout)
        .with_styling(styled);
    if let Some(conversation) = &resumed {
        shell.print_transcript(conversation, RESUME_TAIL)?;
    }
    shell.run()?;

    controller.session().close();
    Ok(())
}

/// First Ctrl-C cancels the active send; with nothing in flight it exits.
#[cfg(unix)]
fn install_interrupt_handler(controller: Arc<ChatController>) -> Result<()> {
    use signal_hook::consts::SIGINT;
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT]).context("registering SIGINT handler")?;
    std::thread::Builder::new()
        .name("gem-chat-sigint".to_owned())
        .spawn(move || {
            for _ in signals.forever() {
                if !controller.cancel_send() {
                    std::process::exit(130);
                }
            }
        })
        .context("spawning SIGINT thread")?;
    Ok(())
}

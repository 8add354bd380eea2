//! Line-mode chat shell.
//!
//! Reads prompts and slash commands from any `BufRead`, hands work to the
//! [`ChatController`] and renders the resulting [`UiEvent`]s. Every command
//! waits for its own completion event, so output stays in input order.

use std::io::{self, BufRead, Write};
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use chat_provider::{AttachmentKind, ChatError, ModelOutput};
use history_store::{Conversation, Role};

use crate::commands::{parse_chat_command, ChatCommand, HELP_TEXT};
use crate::runtime::{ChatController, SendId, UiEvent};

const PROMPT: &str = "> ";
const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";

pub struct Shell<R, W> {
    controller: Arc<ChatController>,
    events: Receiver<UiEvent>,
    input: R,
    output: W,
    styled: bool,
}

impl<R: BufRead, W: Write> Shell<R, W> {
    #[must_use]
    pub fn new(
        controller: Arc<ChatController>,
        events: Receiver<UiEvent>,
        input: R,
        output: W,
    ) -> Self {
        Self {
            controller,
            events,
            input,
            output,
            styled: false,
        }
    }

    /// Enables ANSI dimming of orphaned turns.
    #[must_use]
    pub fn with_styling(mut self, styled: bool) -> Self {
        self.styled = styled;
        self
    }

    /// Prints the tail of a resumed conversation.
    pub fn print_transcript(&mut self, conversation: &Conversation, last: usize) -> io::Result<()> {
        writeln!(
            self.output,
            "Resumed \"{}\" ({} messages, model {})",
            conversation.title,
            conversation.messages.len(),
            conversation.model
        )?;
        let skip = conversation.messages.len().saturating_sub(last);
        for message in conversation.messages.iter().skip(skip) {
            let label = match message.role {
                Role::User => "you",
                Role::Assistant => "assistant",
            };
            if message.orphaned {
                let (dim, reset) = self.style();
                writeln!(self.output, "{dim}{label}: {} (no reply){reset}", message.content)?;
            } else {
                writeln!(self.output, "{label}: {}", message.content)?;
            }
        }
        Ok(())
    }

    /// Runs until `/exit` or end of input.
    pub fn run(&mut self) -> io::Result<()> {
        let mut line = String::new();
        loop {
            write!(self.output, "{PROMPT}")?;
            self.output.flush()?;

            line.clear();
            if self.input.read_line(&mut line)? == 0 {
                writeln!(self.output)?;
                return Ok(());
            }

            match parse_chat_command(&line) {
                Some(ChatCommand::Exit) => return Ok(()),
                Some(command) => self.dispatch(command)?,
                None if line.trim().is_empty() => {}
                None => self.send(line.trim_end_matches(['\r', '\n']))?,
            }
        }
    }

    fn dispatch(&mut self, command: ChatCommand) -> io::Result<()> {
        match command {
            ChatCommand::Help => writeln!(self.output, "{HELP_TEXT}"),
            ChatCommand::History => {
                self.controller.load_history();
                self.await_task()
            }
            ChatCommand::Gems => {
                self.controller.load_gems(false);
                self.await_task()
            }
            ChatCommand::Gem(id_or_name) => {
                self.controller.set_gem(id_or_name);
                self.await_task()
            }
            ChatCommand::Model(model) => {
                self.controller.set_model(model);
                self.await_task()
            }
            ChatCommand::File(path) => {
                self.controller.attach(path, Some(AttachmentKind::File));
                self.await_task()
            }
            ChatCommand::Image(path) => {
                self.controller.attach(path, Some(AttachmentKind::Image));
                self.await_task()
            }
            ChatCommand::Clear => {
                let dropped = self.controller.clear_attachments();
                writeln!(self.output, "Cleared {dropped} pending attachment(s).")
            }
            ChatCommand::Export { path, format } => {
                self.controller.export(path, format);
                self.await_task()
            }
            ChatCommand::Choose(index) => {
                self.controller.choose_candidate(index);
                self.await_task()
            }
            ChatCommand::Invalid { command, reason } => {
                writeln!(self.output, "{command}: {reason}")
            }
            ChatCommand::Unknown(head) => {
                writeln!(self.output, "Unknown command {head}; try /help")
            }
            ChatCommand::Exit => Ok(()),
        }
    }

    fn send(&mut self, prompt: &str) -> io::Result<()> {
        match self.controller.submit(prompt) {
            Ok(send_id) => self.await_send(send_id),
            Err(error) => self.render_error(&error),
        }
    }

    fn await_send(&mut self, send_id: SendId) -> io::Result<()> {
        loop {
            let Some(event) = self.next_event() else {
                return Ok(());
            };
            let done = event.ends_send(send_id);
            self.render(event)?;
            if done {
                return Ok(());
            }
        }
    }

    /// Waits for the completion event of one background task.
    fn await_task(&mut self) -> io::Result<()> {
        loop {
            let Some(event) = self.next_event() else {
                return Ok(());
            };
            let done = !matches!(event, UiEvent::SendStarted { .. });
            self.render(event)?;
            if done {
                return Ok(());
            }
        }
    }

    fn next_event(&self) -> Option<UiEvent> {
        self.events.recv().ok()
    }

    fn render(&mut self, event: UiEvent) -> io::Result<()> {
        match event {
            UiEvent::SendStarted { attachments, .. } => {
                if attachments > 0 {
                    writeln!(self.output, "(sending with {attachments} attachment(s))")?;
                }
                Ok(())
            }
            UiEvent::Reply { output, .. } => self.render_output(&output),
            UiEvent::SendFailed { error, .. } => self.render_error(&error),
            UiEvent::AttachmentAdded(handle) => writeln!(
                self.output,
                "Attached {} ({}, {}); it goes with your next message.",
                handle.name,
                handle.kind.as_str(),
                handle.mime
            ),
            UiEvent::GemsLoaded(jar) => {
                if jar.is_empty() {
                    return writeln!(self.output, "No gems available.");
                }
                for gem in &jar {
                    let marker = if gem.predefined { " (predefined)" } else { "" };
                    match &gem.description {
                        Some(description) => writeln!(
                            self.output,
                            "{}  {}{marker} - {description}",
                            gem.id, gem.name
                        )?,
                        None => writeln!(self.output, "{}  {}{marker}", gem.id, gem.name)?,
                    }
                }
                Ok(())
            }
            UiEvent::GemSelected(Some(gem)) => {
                writeln!(self.output, "Using gem {} ({}).", gem.name, gem.id)
            }
            UiEvent::GemSelected(None) => writeln!(self.output, "Gem cleared."),
            UiEvent::HistoryLoaded(summaries) => {
                if summaries.is_empty() {
                    return writeln!(self.output, "No stored conversations.");
                }
                for summary in summaries {
                    let star = if summary.favorite { "*" } else { " " };
                    writeln!(
                        self.output,
                        "{star} {}  {}  [{}]  {}",
                        summary.id, summary.title, summary.model, summary.updated_at
                    )?;
                }
                Ok(())
            }
            UiEvent::Exported { path, format } => writeln!(
                self.output,
                "Exported {} to {}.",
                format.extension(),
                path.display()
            ),
            UiEvent::CandidateChosen { index, candidate } => {
                writeln!(self.output, "Candidate {index}:")?;
                writeln!(self.output, "{}", candidate.text)
            }
            UiEvent::ModelChanged(model) => writeln!(self.output, "Model set to {model}."),
            UiEvent::TaskFailed { error, .. } => self.render_error(&error),
        }
    }

    fn render_output(&mut self, output: &ModelOutput) -> io::Result<()> {
        let candidate = output.chosen_candidate();
        if let Some(thoughts) = candidate.thoughts.as_deref() {
            let (dim, reset) = self.style();
            writeln!(self.output, "{dim}[thoughts] {thoughts}{reset}")?;
        }
        writeln!(self.output, "{}", candidate.text)?;
        for image in &candidate.web_images {
            let label = if image.title.is_empty() {
                &image.url
            } else {
                &image.title
            };
            writeln!(self.output, "  image: {label} <{}>", image.url)?;
        }
        for image in &candidate.generated_images {
            let label = image.title.as_deref().unwrap_or("generated image");
            writeln!(self.output, "  image: {label} <{}>", image.url)?;
        }
        let count = output.candidates().len();
        if count > 1 {
            writeln!(
                self.output,
                "({count} candidates; /choose 0-{} to switch)",
                count - 1
            )?;
        }
        Ok(())
    }

    fn render_error(&mut self, error: &ChatError) -> io::Result<()> {
        writeln!(self.output, "error: {}", error.banner())
    }

    fn style(&self) -> (&'static str, &'static str) {
        if self.styled {
            (DIM, RESET)
        } else {
            ("", "")
        }
    }
}

use std::fmt::Write as _;

use crate::schema::{Conversation, ImageKind, Role};

/// Renders a conversation as a standalone markdown document.
#[must_use]
pub fn render_markdown(conversation: &Conversation) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "# {}", conversation.title);
    out.push('\n');
    let _ = writeln!(out, "- **Model:** {}", conversation.model);
    if let Some(gem_id) = &conversation.gem_id {
        let _ = writeln!(out, "- **Gem:** {gem_id}");
    }
    let _ = writeln!(out, "- **Created:** {}", conversation.created_at);
    let _ = writeln!(out, "- **Updated:** {}", conversation.updated_at);

    for message in &conversation.messages {
        out.push('\n');
        let role = match message.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
        };
        let _ = writeln!(out, "## {role} · {}", message.created_at);
        out.push('\n');
        let _ = writeln!(out, "{}", message.content.trim_end());

        if !message.attachments.is_empty() {
            out.push('\n');
            let _ = writeln!(out, "_Attachments: {}_", message.attachments.join(", "));
        }

        if !message.images.is_empty() {
            out.push('\n');
            for image in &message.images {
                let label = image.title.as_deref().unwrap_or(match image.kind {
                    ImageKind::Web => "image",
                    ImageKind::Generated => "generated image",
                });
                let _ = writeln!(out, "![{label}]({})", image.url);
            }
        }

        if let Some(thoughts) = &message.thoughts {
            out.push('\n');
            out.push_str("<details>\n<summary>Thoughts</summary>\n\n");
            let _ = writeln!(out, "{}", thoughts.trim_end());
            out.push_str("\n</details>\n");
        }

        if message.orphaned {
            out.push('\n');
            out.push_str("_No reply was recorded for this message._\n");
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use chat_provider::{ContinuationTokens, Model};

    use super::render_markdown;
    use crate::schema::{Conversation, ImageKind, ImageRef, Message, Role};

    fn message(role: Role, content: &str) -> Message {
        Message {
            role,
            content: content.to_owned(),
            thoughts: None,
            created_at: "2026-02-01T10:00:00Z".to_owned(),
            attachments: Vec::new(),
            images: Vec::new(),
            candidate_index: None,
            orphaned: false,
        }
    }

    fn conversation(messages: Vec<Message>) -> Conversation {
        Conversation {
            version: 1,
            id: "c1".to_owned(),
            title: "Tides".to_owned(),
            model: Model::Pro25,
            gem_id: None,
            tokens: ContinuationTokens::default(),
            created_at: "2026-02-01T09:00:00Z".to_owned(),
            updated_at: "2026-02-01T10:00:00Z".to_owned(),
            favorite: false,
            order: 0,
            messages,
        }
    }

    #[test]
    fn markdown_has_title_metadata_and_one_heading_per_message() {
        let markdown = render_markdown(&conversation(vec![
            message(Role::User, "why tides?"),
            message(Role::Assistant, "the moon"),
        ]));

        assert!(markdown.starts_with("# Tides\n"));
        assert!(markdown.contains("- **Model:** gemini-2.5-pro\n"));
        assert!(markdown.contains("- **Created:** 2026-02-01T09:00:00Z\n"));
        assert!(markdown.contains("## User · 2026-02-01T10:00:00Z\n\nwhy tides?\n"));
        assert!(markdown.contains("## Assistant · 2026-02-01T10:00:00Z\n\nthe moon\n"));
        assert!(!markdown.contains("<details>"));
    }

    #[test]
    fn thoughts_render_in_a_details_block() {
        let mut reply = message(Role::Assistant, "answer");
        reply.thoughts = Some("step one".to_owned());
        reply.images.push(ImageRef {
            kind: ImageKind::Generated,
            url: "https://img/1".to_owned(),
            title: None,
        });
        let markdown = render_markdown(&conversation(vec![message(Role::User, "q"), reply]));

        assert!(markdown.contains("<details>\n<summary>Thoughts</summary>\n\nstep one\n\n</details>\n"));
        assert!(markdown.contains("![generated image](https://img/1)"));
    }

    #[test]
    fn orphaned_turns_are_marked() {
        let mut orphan = message(Role::User, "lost");
        orphan.orphaned = true;
        let markdown = render_markdown(&conversation(vec![orphan]));
        assert!(markdown.contains("_No reply was recorded for this message._"));
    }
}

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chat_provider::{ContinuationTokens, Model};
use fs2::FileExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::HistoryStoreError;
use crate::export::render_markdown;
use crate::paths::{
    conversation_file_name, conversation_id_from_file_name, is_temp_file_name,
    is_valid_conversation_id, temp_sibling, INDEX_FILE, LOCK_FILE,
};
use crate::schema::{
    listing_order, not_before, now_rfc3339, title_from_content, Conversation,
    ConversationSummary, IndexFile, Message, NewMessage, Role, RECORD_VERSION, UNTITLED,
};

/// Durable conversation history rooted at one directory.
///
/// Layout: `index.json` holds one summary per conversation and
/// `<id>.json` holds the full record. Every write goes to a temporary
/// sibling that is synced and renamed over the target, so readers only ever
/// see complete files. Updates write the index first and the record second;
/// the record is authoritative and [`HistoryStore::open`] rebuilds index
/// entries from it. Deletes remove the record first.
///
/// One process owns a history directory at a time, enforced with an
/// advisory lock on `.lock`. Within the process, mutations are serialized
/// by an internal mutex, so the store can be shared behind an `Arc`.
pub struct HistoryStore {
    root: PathBuf,
    index_path: PathBuf,
    summaries: Mutex<Vec<ConversationSummary>>,
    _lock: File,
}

impl std::fmt::Debug for HistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryStore")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl HistoryStore {
    pub fn open(root: &Path) -> Result<Self, HistoryStoreError> {
        let root = root.to_path_buf();
        fs::create_dir_all(&root)
            .map_err(|source| HistoryStoreError::io("creating history directory", &root, source))?;

        let lock = acquire_lock(&root)?;
        let index_path = root.join(INDEX_FILE);
        let summaries = reconcile(&root, &index_path)?;
        info!(root = %root.display(), conversations = summaries.len(), "history store opened");

        Ok(Self {
            root,
            index_path,
            summaries: Mutex::new(summaries),
            _lock: lock,
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Summaries ordered by `order`, then favorites, then most recent update.
    #[must_use]
    pub fn list(&self) -> Vec<ConversationSummary> {
        let mut summaries = lock_unpoisoned(&self.summaries).clone();
        summaries.sort_by(listing_order);
        summaries
    }

    pub fn create(&self, model: Model) -> Result<Conversation, HistoryStoreError> {
        let now = now_rfc3339()?;
        let conversation = Conversation {
            version: RECORD_VERSION,
            id: uuid::Uuid::new_v4().to_string(),
            title: UNTITLED.to_owned(),
            model,
            gem_id: None,
            tokens: ContinuationTokens::default(),
            created_at: now.clone(),
            updated_at: now,
            favorite: false,
            order: 0,
            messages: Vec::new(),
        };

        let mut summaries = lock_unpoisoned(&self.summaries);
        let mut staged = summaries.clone();
        staged.push(conversation.summary());
        self.commit(&mut summaries, staged, &[&conversation])?;
        info!(conversation = %conversation.id, %model, "conversation created");
        Ok(conversation)
    }

    pub fn get(&self, id: &str) -> Result<Conversation, HistoryStoreError> {
        let _summaries = lock_unpoisoned(&self.summaries);
        self.read_conversation(id)
    }

    /// Appends a message and returns it as stored.
    ///
    /// An assistant message must answer a user message. A user message that
    /// follows another user message marks the earlier one as orphaned. The
    /// first user message names the conversation.
    pub fn append_message(
        &self,
        id: &str,
        message: NewMessage,
    ) -> Result<Message, HistoryStoreError> {
        self.mutate(id, true, |conversation, stamp| {
            let previous = conversation
                .messages
                .iter()
                .rposition(|existing| !existing.orphaned);
            let previous_role = previous.map(|index| conversation.messages[index].role);

            match (message.role, previous_role) {
                (Role::Assistant, None) => {
                    return Err(out_of_turn(id, "there is no user message to answer"));
                }
                (Role::Assistant, Some(Role::Assistant)) => {
                    return Err(out_of_turn(id, "the last message is already an answer"));
                }
                (Role::User, Some(Role::User)) => {
                    if let Some(index) = previous {
                        conversation.messages[index].orphaned = true;
                        debug!(conversation = %id, index, "user turn left without reply");
                    }
                }
                _ => {}
            }

            if message.role == Role::User && !conversation.has_user_message() {
                conversation.title = title_from_content(&message.content);
            }

            let stored = message.stamp(stamp.to_owned());
            conversation.messages.push(stored.clone());
            Ok(stored)
        })
    }

    /// Merges received tokens; empty components never blank stored ones.
    pub fn update_tokens(
        &self,
        id: &str,
        tokens: &ContinuationTokens,
    ) -> Result<ContinuationTokens, HistoryStoreError> {
        self.mutate(id, true, |conversation, _| {
            conversation.tokens.merge(tokens);
            Ok(conversation.tokens.clone())
        })
    }

    pub fn set_model(&self, id: &str, model: Model) -> Result<(), HistoryStoreError> {
        self.mutate(id, true, |conversation, _| {
            conversation.model = model;
            Ok(())
        })
    }

    pub fn set_gem(&self, id: &str, gem_id: Option<&str>) -> Result<(), HistoryStoreError> {
        self.mutate(id, true, |conversation, _| {
            conversation.gem_id = gem_id.map(str::to_owned);
            Ok(())
        })
    }

    /// Renames a conversation. A blank title becomes "Untitled".
    pub fn update_title(&self, id: &str, title: &str) -> Result<String, HistoryStoreError> {
        self.mutate(id, true, |conversation, _| {
            let title = title.trim();
            conversation.title = if title.is_empty() {
                UNTITLED.to_owned()
            } else {
                title.to_owned()
            };
            Ok(conversation.title.clone())
        })
    }

    pub fn toggle_favorite(&self, id: &str) -> Result<bool, HistoryStoreError> {
        self.mutate(id, false, |conversation, _| {
            conversation.favorite = !conversation.favorite;
            Ok(conversation.favorite)
        })
    }

    pub fn set_order(&self, id: &str, position: i64) -> Result<(), HistoryStoreError> {
        self.mutate(id, false, |conversation, _| {
            conversation.order = position;
            Ok(())
        })
    }

    pub fn swap_order(&self, first: &str, second: &str) -> Result<(), HistoryStoreError> {
        let mut summaries = lock_unpoisoned(&self.summaries);
        let mut left = self.read_conversation(first)?;
        let mut right = self.read_conversation(second)?;
        std::mem::swap(&mut left.order, &mut right.order);

        let mut staged = summaries.clone();
        replace_summary(&mut staged, left.summary());
        replace_summary(&mut staged, right.summary());
        self.commit(&mut summaries, staged, &[&left, &right])
    }

    pub fn delete(&self, id: &str) -> Result<(), HistoryStoreError> {
        let mut summaries = lock_unpoisoned(&self.summaries);
        let path = self.conversation_path(id)?;
        fs::remove_file(&path).map_err(|source| {
            if source.kind() == ErrorKind::NotFound {
                HistoryStoreError::not_found(id)
            } else {
                HistoryStoreError::io("deleting conversation", &path, source)
            }
        })?;

        // The record is gone, so the summary goes too even if the index
        // write fails; the next open drops the stale index entry.
        summaries.retain(|summary| summary.id != id);
        self.write_index(&summaries)?;
        info!(conversation = %id, "conversation deleted");
        Ok(())
    }

    /// Replaces the content of the latest assistant message with another
    /// candidate of the same turn. The original timestamp is kept.
    pub fn record_candidate_choice(
        &self,
        id: &str,
        replacement: NewMessage,
    ) -> Result<Message, HistoryStoreError> {
        self.mutate(id, true, |conversation, _| {
            let Some(current) = conversation
                .messages
                .iter_mut()
                .rev()
                .find(|message| !message.orphaned)
                .filter(|message| message.role == Role::Assistant)
            else {
                return Err(HistoryStoreError::NoAssistantTurn { id: id.to_owned() });
            };

            let created_at = std::mem::take(&mut current.created_at);
            let mut updated = replacement.stamp(created_at);
            updated.role = Role::Assistant;
            *current = updated.clone();
            Ok(updated)
        })
    }

    /// Stores an exported conversation under a fresh id.
    pub fn import_json(&self, bytes: &[u8]) -> Result<Conversation, HistoryStoreError> {
        let mut conversation: Conversation = serde_json::from_slice(bytes)
            .map_err(|source| HistoryStoreError::InvalidImport(source.to_string()))?;
        if conversation.version != RECORD_VERSION {
            return Err(HistoryStoreError::InvalidImport(format!(
                "unsupported record version {}",
                conversation.version
            )));
        }
        validate_turns(&conversation.messages).map_err(|reason| {
            HistoryStoreError::InvalidImport(format!("messages out of turn: {reason}"))
        })?;

        conversation.id = uuid::Uuid::new_v4().to_string();
        if conversation.title.trim().is_empty() {
            conversation.title = UNTITLED.to_owned();
        }
        conversation.updated_at = not_before(
            conversation.updated_at.clone(),
            &conversation.created_at,
        );

        let mut summaries = lock_unpoisoned(&self.summaries);
        let mut staged = summaries.clone();
        staged.push(conversation.summary());
        self.commit(&mut summaries, staged, &[&conversation])?;
        info!(conversation = %conversation.id, "conversation imported");
        Ok(conversation)
    }

    pub fn export_markdown(&self, id: &str) -> Result<String, HistoryStoreError> {
        Ok(render_markdown(&self.get(id)?))
    }

    /// The stored record, pretty-printed with two-space indentation.
    pub fn export_json(&self, id: &str) -> Result<Vec<u8>, HistoryStoreError> {
        let conversation = self.get(id)?;
        let path = self.conversation_path(id)?;
        let mut bytes = serde_json::to_vec_pretty(&conversation)
            .map_err(|source| HistoryStoreError::json_serialize(&path, source))?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Read-modify-write of one record under the store mutex. `touch`
    /// advances `updated_at`; the closure receives the stamp it will get.
    fn mutate<T>(
        &self,
        id: &str,
        touch: bool,
        apply: impl FnOnce(&mut Conversation, &str) -> Result<T, HistoryStoreError>,
    ) -> Result<T, HistoryStoreError> {
        let mut summaries = lock_unpoisoned(&self.summaries);
        let mut conversation = self.read_conversation(id)?;

        let stamp = not_before(now_rfc3339()?, &conversation.updated_at);
        let result = apply(&mut conversation, &stamp)?;
        if touch {
            conversation.updated_at = stamp;
        }

        let mut staged = summaries.clone();
        replace_summary(&mut staged, conversation.summary());
        self.commit(&mut summaries, staged, &[&conversation])?;
        debug!(conversation = %id, "conversation updated");
        Ok(result)
    }

    /// Writes the staged index, then the records, and only then publishes
    /// the staged summaries. A failed write leaves `current` untouched.
    fn commit(
        &self,
        current: &mut Vec<ConversationSummary>,
        staged: Vec<ConversationSummary>,
        records: &[&Conversation],
    ) -> Result<(), HistoryStoreError> {
        self.write_index(&staged)?;
        for record in records {
            self.write_conversation(record)?;
        }
        *current = staged;
        Ok(())
    }

    fn conversation_path(&self, id: &str) -> Result<PathBuf, HistoryStoreError> {
        if !is_valid_conversation_id(id) {
            return Err(HistoryStoreError::not_found(id));
        }
        Ok(self.root.join(conversation_file_name(id)))
    }

    fn read_conversation(&self, id: &str) -> Result<Conversation, HistoryStoreError> {
        let path = self.conversation_path(id)?;
        match read_record::<Conversation>(&path)? {
            Some(conversation) => {
                check_version(&path, conversation.version)?;
                Ok(conversation)
            }
            None => Err(HistoryStoreError::not_found(id)),
        }
    }

    fn write_conversation(&self, conversation: &Conversation) -> Result<(), HistoryStoreError> {
        let path = self.conversation_path(&conversation.id)?;
        write_atomic(&path, conversation)
    }

    fn write_index(&self, summaries: &[ConversationSummary]) -> Result<(), HistoryStoreError> {
        let index = IndexFile {
            version: RECORD_VERSION,
            conversations: summaries.to_vec(),
        };
        write_atomic(&self.index_path, &index)
    }
}

fn acquire_lock(root: &Path) -> Result<File, HistoryStoreError> {
    let path = root.join(LOCK_FILE);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(|source| HistoryStoreError::io("opening history lock", &path, source))?;

    file.try_lock_exclusive()
        .map_err(|_| HistoryStoreError::Locked {
            path: root.to_path_buf(),
        })?;
    Ok(file)
}

/// Rebuilds the summary list from record files, keeping the index's order
/// for known ids. Stray temporary files are removed on the way.
fn reconcile(
    root: &Path,
    index_path: &Path,
) -> Result<Vec<ConversationSummary>, HistoryStoreError> {
    let indexed = match read_record::<IndexFile>(index_path) {
        Ok(Some(index)) => index.conversations,
        Ok(None) => Vec::new(),
        Err(error) => {
            warn!(%error, "history index unreadable; rebuilding from records");
            Vec::new()
        }
    };

    let mut from_files = BTreeMap::new();
    let entries = fs::read_dir(root)
        .map_err(|source| HistoryStoreError::io("listing history directory", root, source))?;
    for entry in entries {
        let entry = entry
            .map_err(|source| HistoryStoreError::io("listing history directory", root, source))?;
        let path = entry.path();
        let file_name = entry.file_name().to_string_lossy().into_owned();

        if is_temp_file_name(&file_name) {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "removed interrupted write"),
                Err(error) => warn!(path = %path.display(), %error, "could not remove temp file"),
            }
            continue;
        }

        let Some(id) = conversation_id_from_file_name(&file_name) else {
            continue;
        };
        match read_record::<Conversation>(&path) {
            Ok(Some(conversation)) if conversation.id == id => {
                if conversation.version == RECORD_VERSION {
                    from_files.insert(conversation.id.clone(), conversation.summary());
                } else {
                    warn!(path = %path.display(), version = conversation.version, "skipping record with unsupported version");
                }
            }
            Ok(Some(conversation)) => {
                warn!(path = %path.display(), stored_id = %conversation.id, "skipping record whose id does not match its file");
            }
            Ok(None) => {}
            Err(error) => warn!(path = %path.display(), %error, "skipping unreadable record"),
        }
    }

    let mut summaries = Vec::with_capacity(from_files.len());
    for summary in &indexed {
        if let Some(fresh) = from_files.remove(&summary.id) {
            summaries.push(fresh);
        }
    }
    let reindexed = from_files.len();
    summaries.extend(from_files.into_values());

    if summaries != indexed {
        let dropped = indexed
            .iter()
            .filter(|old| !summaries.iter().any(|summary| summary.id == old.id))
            .count();
        info!(dropped, reindexed, "history index reconciled with records");
        let index = IndexFile {
            version: RECORD_VERSION,
            conversations: summaries.clone(),
        };
        write_atomic(index_path, &index)?;
    }

    Ok(summaries)
}

/// Checks that non-orphaned messages alternate user, assistant, starting
/// with a user message, and that only user messages are orphaned.
fn validate_turns(messages: &[Message]) -> Result<(), &'static str> {
    let mut expected = Role::User;
    for message in messages {
        if message.orphaned {
            if message.role != Role::User {
                return Err("only user messages can be orphaned");
            }
            continue;
        }
        if message.role != expected {
            return Err("roles must alternate starting with a user message");
        }
        expected = match expected {
            Role::User => Role::Assistant,
            Role::Assistant => Role::User,
        };
    }
    Ok(())
}

fn out_of_turn(id: &str, reason: &'static str) -> HistoryStoreError {
    HistoryStoreError::OutOfTurn {
        id: id.to_owned(),
        role: Role::Assistant.as_str(),
        reason,
    }
}

fn replace_summary(summaries: &mut Vec<ConversationSummary>, summary: ConversationSummary) {
    match summaries.iter_mut().find(|existing| existing.id == summary.id) {
        Some(existing) => *existing = summary,
        None => summaries.push(summary),
    }
}

fn check_version(path: &Path, found: u32) -> Result<(), HistoryStoreError> {
    if found == RECORD_VERSION {
        Ok(())
    } else {
        Err(HistoryStoreError::UnsupportedVersion {
            path: path.to_path_buf(),
            found,
        })
    }
}

fn read_record<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<Option<T>, HistoryStoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(source) if source.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(HistoryStoreError::io("reading record", path, source)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| HistoryStoreError::json_parse(path, source))
}

/// Writes `value` to a synced temporary sibling, then renames it over `path`.
fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), HistoryStoreError> {
    let mut bytes = serde_json::to_vec_pretty(value)
        .map_err(|source| HistoryStoreError::json_serialize(path, source))?;
    bytes.push(b'\n');

    let temp_path = temp_sibling(path);
    let mut file = File::create(&temp_path)
        .map_err(|source| HistoryStoreError::io("creating temp file", &temp_path, source))?;
    file.write_all(&bytes)
        .map_err(|source| HistoryStoreError::io("writing temp file", &temp_path, source))?;
    file.sync_all()
        .map_err(|source| HistoryStoreError::io("syncing temp file", &temp_path, source))?;
    drop(file);

    fs::rename(&temp_path, path)
        .map_err(|source| HistoryStoreError::io("renaming temp file", path, source))
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

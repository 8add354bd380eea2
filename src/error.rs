use chat_provider::ChatError;
use history_store::HistoryStoreError;

/// Maps a store failure onto the engine taxonomy.
#[must_use]
pub fn storage_error(error: HistoryStoreError) -> ChatError {
    match error {
        HistoryStoreError::NotFound { id } => ChatError::NotFound(format!("conversation {id}")),
        other => ChatError::Storage(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_conversation_maps_to_not_found() {
        let error = storage_error(HistoryStoreError::NotFound {
            id: "abc".to_owned(),
        });
        assert_eq!(error, ChatError::NotFound("conversation abc".to_owned()));
    }

    #[test]
    fn other_failures_map_to_storage() {
        let error = storage_error(HistoryStoreError::InvalidImport("no messages".to_owned()));
        assert!(matches!(error, ChatError::Storage(message) if message.contains("no messages")));
    }
}

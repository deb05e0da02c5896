//! The in-memory, currently-displayed message list of one conversation.
//!
//! Every source (cache snapshot, history pages, realtime events) funnels through
//! [`MessageList`], which keeps two invariants regardless of arrival order:
//! entries are strictly ordered by `(created_at, id)` and every id appears at most once.

use std::collections::HashSet;

use super::messages::Message;

/// Result of applying a single message to the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Replaced,
    Unchanged,
}

#[derive(Debug, Clone, Default)]
pub struct MessageList {
    messages: Vec<Message>,
    ids: HashSet<String>,
}

impl MessageList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a list from unordered input, keeping the most recently updated copy of duplicates.
    pub fn from_messages(messages: impl IntoIterator<Item = Message>) -> Self {
        let mut list = Self::new();
        list.merge(messages);
        list
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        if !self.contains(id) {
            return None;
        }
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn oldest(&self) -> Option<&Message> {
        self.messages.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    pub fn to_vec(&self) -> Vec<Message> {
        self.messages.clone()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.ids.clear();
    }

    /// Discards the current contents and replaces them with `messages`.
    pub fn replace_all(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.clear();
        self.merge(messages);
    }

    /// Merges a batch; returns how many new ids were inserted.
    pub fn merge(&mut self, messages: impl IntoIterator<Item = Message>) -> usize {
        let mut inserted = 0;
        for message in messages {
            if self.upsert(message) == MergeOutcome::Inserted {
                inserted += 1;
            }
        }
        inserted
    }

    /// Inserts `message`, or replaces the stored copy when `message` is at least as recent.
    pub fn upsert(&mut self, message: Message) -> MergeOutcome {
        if self.contains(&message.id) {
            if self.replace_existing(message) {
                MergeOutcome::Replaced
            } else {
                MergeOutcome::Unchanged
            }
        } else {
            self.insert_sorted(message);
            MergeOutcome::Inserted
        }
    }

    /// Inserts only when no entry with the same id exists.
    pub fn insert_if_absent(&mut self, message: Message) -> bool {
        if self.contains(&message.id) {
            return false;
        }
        self.insert_sorted(message);
        true
    }

    /// Replaces the entry with the same id in place. Absent ids and stale copies are ignored.
    pub fn replace_existing(&mut self, message: Message) -> bool {
        let Some(index) = self.position(&message.id) else {
            return false;
        };
        if !self.messages[index].is_superseded_by(&message) {
            return false;
        }
        if self.messages[index].created_at == message.created_at {
            self.messages[index] = message;
        } else {
            self.messages.remove(index);
            self.ids.remove(&message.id);
            self.insert_sorted(message);
        }
        true
    }

    pub fn remove(&mut self, id: &str) -> Option<Message> {
        let index = self.position(id)?;
        self.ids.remove(id);
        Some(self.messages.remove(index))
    }

    fn position(&self, id: &str) -> Option<usize> {
        if !self.contains(id) {
            return None;
        }
        self.messages.iter().position(|m| m.id == id)
    }

    fn insert_sorted(&mut self, message: Message) {
        let index = self
            .messages
            .partition_point(|existing| existing.sort_key() < message.sort_key());
        self.ids.insert(message.id.clone());
        self.messages.insert(index, message);
    }
}

impl From<MessageList> for Vec<Message> {
    fn from(list: MessageList) -> Self {
        list.messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::talk::test_utils::make_message;
    use chrono::Duration;

    fn ids(list: &MessageList) -> Vec<&str> {
        list.iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn merge_orders_by_created_then_id() {
        let list = MessageList::from_messages(vec![
            make_message("c", "chat", 3_000),
            make_message("b", "chat", 1_000),
            make_message("a", "chat", 1_000),
            make_message("d", "chat", 2_000),
        ]);

        assert_eq!(ids(&list), vec!["a", "b", "d", "c"]);
    }

    #[test]
    fn overlapping_pages_do_not_duplicate() {
        let mut list = MessageList::new();
        let page_one: Vec<_> = (0..5)
            .map(|i| make_message(&format!("m{i}"), "chat", i * 1_000))
            .collect();
        let page_two: Vec<_> = (3..8)
            .map(|i| make_message(&format!("m{i}"), "chat", i * 1_000))
            .collect();

        assert_eq!(list.merge(page_one), 5);
        assert_eq!(list.merge(page_two.clone()), 3);
        assert_eq!(list.merge(page_two), 0);
        assert_eq!(list.len(), 8);

        let keys: Vec<_> = list.iter().map(|m| m.created_at).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn insert_if_absent_rejects_duplicate_push() {
        let mut list = MessageList::new();
        let msg = make_message("x", "chat", 1_000);

        assert!(list.insert_if_absent(msg.clone()));
        assert!(!list.insert_if_absent(msg));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn replace_existing_ignores_unknown_ids() {
        let mut list = MessageList::from_messages(vec![make_message("a", "chat", 1_000)]);

        assert!(!list.replace_existing(make_message("zzz", "chat", 500)));
        assert_eq!(ids(&list), vec!["a"]);
    }

    #[test]
    fn replace_existing_is_last_write_wins() {
        let original = make_message("a", "chat", 1_000);
        let mut list = MessageList::from_messages(vec![original.clone()]);

        let mut edited = original.clone();
        edited.content = "edited".to_string();
        edited.updated_at = original.updated_at + Duration::seconds(5);
        assert!(list.replace_existing(edited.clone()));

        let mut stale = original.clone();
        stale.content = "stale".to_string();
        assert!(!list.replace_existing(stale));

        assert_eq!(list.get("a").unwrap().content, "edited");
    }

    #[test]
    fn replace_existing_repositions_when_created_changes() {
        let mut list = MessageList::from_messages(vec![
            make_message("a", "chat", 1_000),
            make_message("b", "chat", 2_000),
        ]);
        let mut moved = make_message("a", "chat", 3_000);
        moved.updated_at = moved.created_at;

        assert!(list.replace_existing(moved));
        assert_eq!(ids(&list), vec!["b", "a"]);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn remove_updates_id_index() {
        let mut list = MessageList::from_messages(vec![
            make_message("a", "chat", 1_000),
            make_message("b", "chat", 2_000),
        ]);

        assert!(list.remove("a").is_some());
        assert!(list.remove("a").is_none());
        assert!(!list.contains("a"));
        assert!(list.insert_if_absent(make_message("a", "chat", 1_000)));
        assert_eq!(ids(&list), vec!["a", "b"]);
    }

    #[test]
    fn replace_all_drops_previous_entries() {
        let mut list = MessageList::from_messages(vec![make_message("old", "chat", 1_000)]);
        list.replace_all(vec![make_message("new", "chat", 2_000)]);

        assert_eq!(ids(&list), vec!["new"]);
        assert!(!list.contains("old"));
    }
}

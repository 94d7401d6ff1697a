use std::collections::HashSet;

use super::types::{Item, ParsedEntry, ReaderState, ALL_CATEGORIES};

impl ReaderState {
    // ========================================================================
    // Merge & Eviction
    // ========================================================================

    /// Merges freshly parsed entries into the item store, returns the number
    /// of items inserted.
    ///
    /// The dedupe key is `(feed_id, link)`. Entries whose key is already
    /// stored, or appeared earlier in the same batch, are skipped; stored
    /// items (and their `read` flag) are never overwritten. Each new item is
    /// pushed to the front of the list, so insertion order doubles as
    /// recency.
    ///
    /// Afterwards the feed is capped at `max_items`: its items past the cap,
    /// counted from the front, are the oldest inserted and are evicted.
    pub fn merge_items<I>(&mut self, feed_id: &str, entries: I, max_items: usize) -> usize
    where
        I: IntoIterator<Item = ParsedEntry>,
    {
        let mut seen: HashSet<String> = self
            .items
            .iter()
            .filter(|item| item.feed_id == feed_id)
            .map(|item| item.link.clone())
            .collect();

        let mut added = 0;
        for entry in entries {
            if !seen.insert(entry.link.clone()) {
                continue;
            }
            self.items.push_front(Item {
                id: uuid::Uuid::new_v4().to_string(),
                feed_id: feed_id.to_string(),
                title: entry.title,
                summary: entry.summary,
                link: entry.link,
                published_at: entry.published_at,
                read: false,
            });
            added += 1;
        }

        let evicted = self.evict_overflow(feed_id, max_items);
        if evicted > 0 {
            tracing::debug!(
                feed_id = %feed_id,
                evicted = evicted,
                cap = max_items,
                "Evicted oldest items over per-feed cap"
            );
        }

        added
    }

    /// Drops the feed's items beyond the first `max_items` (newest first).
    fn evict_overflow(&mut self, feed_id: &str, max_items: usize) -> usize {
        let before = self.items.len();
        let mut kept = 0usize;
        self.items.retain(|item| {
            if item.feed_id != feed_id {
                return true;
            }
            kept += 1;
            kept <= max_items
        });
        before - self.items.len()
    }

    // ========================================================================
    // Item Queries
    // ========================================================================

    pub fn count_items(&self, feed_id: &str) -> usize {
        self.items.iter().filter(|i| i.feed_id == feed_id).count()
    }

    /// Items of one feed in insertion order (newest inserted first).
    pub fn items_for_feed<'a>(&'a self, feed_id: &'a str) -> impl Iterator<Item = &'a Item> + 'a {
        self.items.iter().filter(move |i| i.feed_id == feed_id)
    }

    /// Items for display: every feed for `"all"`, else only feeds in
    /// `category`. Sorted newest-first by publication time and capped at
    /// `limit`. Items published at the same second keep insertion order.
    pub fn items_for_category(&self, category: &str, limit: usize) -> Vec<&Item> {
        let mut items: Vec<&Item> = if category == ALL_CATEGORIES {
            self.items.iter().collect()
        } else {
            let feed_ids: HashSet<&str> = self
                .feeds
                .iter()
                .filter(|f| f.category == category)
                .map(|f| f.id.as_str())
                .collect();
            self.items
                .iter()
                .filter(|i| feed_ids.contains(i.feed_id.as_str()))
                .collect()
        };

        items.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        items.truncate(limit);
        items
    }

    pub fn item(&self, item_id: &str) -> Option<&Item> {
        self.items.iter().find(|i| i.id == item_id)
    }

    pub fn unread_count(&self) -> usize {
        self.items.iter().filter(|i| !i.read).count()
    }

    // ========================================================================
    // Read State
    // ========================================================================

    /// Marks one item read. Returns false for an unknown id.
    pub fn mark_item_read(&mut self, item_id: &str) -> bool {
        match self.items.iter_mut().find(|i| i.id == item_id) {
            Some(item) => {
                item.read = true;
                true
            }
            None => false,
        }
    }

    /// Flips an item's read flag, returning the new value.
    pub fn toggle_item_read(&mut self, item_id: &str) -> Option<bool> {
        let item = self.items.iter_mut().find(|i| i.id == item_id)?;
        item.read = !item.read;
        Some(item.read)
    }

    /// Marks every item read, returning how many changed.
    pub fn mark_all_read(&mut self) -> usize {
        let mut changed = 0;
        for item in self.items.iter_mut().filter(|i| !i.read) {
            item.read = true;
            changed += 1;
        }
        changed
    }
}

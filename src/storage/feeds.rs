use std::collections::BTreeSet;

use super::types::{Feed, ReaderState, ALL_CATEGORIES};

impl ReaderState {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    pub fn feed(&self, feed_id: &str) -> Option<&Feed> {
        self.feeds.iter().find(|f| f.id == feed_id)
    }

    pub fn feed_mut(&mut self, feed_id: &str) -> Option<&mut Feed> {
        self.feeds.iter_mut().find(|f| f.id == feed_id)
    }

    /// True if a feed with this source URL is already configured.
    pub fn has_feed_url(&self, url: &str) -> bool {
        let url = url.trim();
        self.feeds.iter().any(|f| f.url == url)
    }

    /// Appends a feed; refresh order follows insertion order.
    pub fn insert_feed(&mut self, feed: Feed) {
        self.feeds.push(feed);
    }

    /// Removes a feed and every item it owns.
    pub fn remove_feed(&mut self, feed_id: &str) -> Option<Feed> {
        let pos = self.feeds.iter().position(|f| f.id == feed_id)?;
        let feed = self.feeds.remove(pos);

        let before = self.items.len();
        self.items.retain(|item| item.feed_id != feed_id);
        tracing::debug!(
            feed_id = %feed_id,
            removed_items = before - self.items.len(),
            "Feed removed"
        );

        Some(feed)
    }

    /// Records a successful content retrieval.
    pub fn touch_feed(&mut self, feed_id: &str, fetched_at: i64) -> bool {
        match self.feed_mut(feed_id) {
            Some(feed) => {
                feed.last_fetched_at = Some(fetched_at);
                true
            }
            None => false,
        }
    }

    /// `"all"` followed by every distinct category, sorted.
    pub fn categories(&self) -> Vec<String> {
        let unique: BTreeSet<&str> = self.feeds.iter().map(|f| f.category.as_str()).collect();
        std::iter::once(ALL_CATEGORIES)
            .chain(unique)
            .map(str::to_string)
            .collect()
    }

    /// Ids of feeds never fetched or last fetched more than `max_age_secs`
    /// before `now`, in feed-list order.
    pub fn stale_feed_ids(&self, now: i64, max_age_secs: i64) -> Vec<String> {
        self.feeds
            .iter()
            .filter(|f| f.is_stale(now, max_age_secs))
            .map(|f| f.id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Item;
    use pretty_assertions::assert_eq;

    fn feed(url: &str, category: &str) -> Feed {
        Feed::new(url, "Feed", category).unwrap()
    }

    fn item(feed_id: &str, link: &str) -> Item {
        Item {
            id: uuid::Uuid::new_v4().to_string(),
            feed_id: feed_id.to_string(),
            title: "t".into(),
            summary: String::new(),
            link: link.to_string(),
            published_at: 0,
            read: false,
        }
    }

    #[test]
    fn test_remove_feed_cascades_to_items() {
        let mut state = ReaderState::default();
        let a = feed("https://a.example/rss", "Tech");
        let b = feed("https://b.example/rss", "News");
        let (a_id, b_id) = (a.id.clone(), b.id.clone());
        state.insert_feed(a);
        state.insert_feed(b);
        state.items.push_back(item(&a_id, "https://a.example/1"));
        state.items.push_back(item(&b_id, "https://b.example/1"));
        state.items.push_back(item(&a_id, "https://a.example/2"));

        let removed = state.remove_feed(&a_id).unwrap();
        assert_eq!(removed.id, a_id);
        assert_eq!(state.feeds.len(), 1);
        assert_eq!(state.items.len(), 1);
        assert_eq!(state.items[0].feed_id, b_id);

        assert!(state.remove_feed(&a_id).is_none());
    }

    #[test]
    fn test_categories_sorted_and_unique() {
        let mut state = ReaderState::default();
        state.insert_feed(feed("https://a.example/rss", "Tech"));
        state.insert_feed(feed("https://b.example/rss", "News"));
        state.insert_feed(feed("https://c.example/rss", "Tech"));

        assert_eq!(state.categories(), vec!["all", "News", "Tech"]);
    }

    #[test]
    fn test_categories_empty_state() {
        assert_eq!(ReaderState::default().categories(), vec!["all"]);
    }

    #[test]
    fn test_has_feed_url_trims() {
        let mut state = ReaderState::default();
        state.insert_feed(feed("https://a.example/rss", ""));
        assert!(state.has_feed_url(" https://a.example/rss "));
        assert!(!state.has_feed_url("https://b.example/rss"));
    }

    #[test]
    fn test_stale_feed_ids_in_list_order() {
        let mut state = ReaderState::default();
        let mut fresh = feed("https://a.example/rss", "");
        fresh.last_fetched_at = Some(9_000);
        let mut old = feed("https://b.example/rss", "");
        old.last_fetched_at = Some(1_000);
        let never = feed("https://c.example/rss", "");
        let expected = vec![old.id.clone(), never.id.clone()];
        state.insert_feed(fresh);
        state.insert_feed(old);
        state.insert_feed(never);

        assert_eq!(state.stale_feed_ids(10_000, 1_800), expected);
    }

    #[test]
    fn test_touch_feed() {
        let mut state = ReaderState::default();
        let f = feed("https://a.example/rss", "");
        let id = f.id.clone();
        state.insert_feed(f);

        assert!(state.touch_feed(&id, 123));
        assert_eq!(state.feed(&id).unwrap().last_fetched_at, Some(123));
        assert!(!state.touch_feed("missing", 123));
    }
}

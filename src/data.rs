//! Generic row records and paginated lists.
//!
//! Query results materialize as [`DataRow`]s (ordered column-name/value
//! maps) collected into a [`DataList`], which carries the bookkeeping
//! needed to serve a large result in fixed-size chunks: the total element
//! count, the start index of the chunk actually held, and the fetch size.

use serde_json::Value;

/// One row of a query result: column name to decoded value, in SELECT
/// order.
pub type DataRow = serde_json::Map<String, Value>;

/// A list of elements with pagination bookkeeping.
///
/// Indices are 0-based and local semantics follow the chunked-fetch model:
/// `total_size` counts all elements the full result would contain, `start`
/// is the absolute index of the first element held, `fetch_size` is the
/// chunk size used to fetch.
#[derive(Debug, Clone, Default)]
pub struct DataList<T> {
    items: Vec<T>,
    total_size: i64,
    start: i64,
    fetch_size: i64,
}

/// A [`DataList`] of generic rows.
pub type Dataset = DataList<DataRow>;

impl<T> DataList<T> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            total_size: 0,
            start: 0,
            fetch_size: 0,
        }
    }

    /// Builds a list over the items with the bookkeeping reset to the
    /// actual item count.
    pub fn complete(items: Vec<T>) -> Self {
        let total = items.len() as i64;
        Self {
            items,
            total_size: total,
            start: 0,
            fetch_size: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }

    pub fn push(&mut self, item: T) {
        self.items.push(item);
        self.total_size += 1;
    }

    /// Resets the total size to the number of items actually held.
    pub fn init(mut self) -> Self {
        self.total_size = self.items.len() as i64;
        self
    }

    pub fn set_total_size(&mut self, total_size: i64) {
        self.total_size = total_size;
    }

    pub fn set_start(&mut self, start: i64) {
        self.start = if self.total_size < 1 { -1 } else { start };
    }

    pub fn set_fetch_size(&mut self, fetch_size: i64) {
        self.fetch_size = fetch_size;
    }

    pub fn total_size(&self) -> i64 {
        if self.is_empty() {
            0
        } else if self.total_size < 1 {
            self.items.len() as i64
        } else {
            self.total_size
        }
    }

    pub fn fetch_size(&self) -> i64 {
        self.fetch_size
    }

    /// Absolute index of the first element held, -1 when empty.
    pub fn start(&self) -> i64 {
        if self.is_empty() { -1 } else { self.start }
    }

    /// Absolute index of the last element held, -1 when empty.
    pub fn end(&self) -> i64 {
        if self.is_empty() {
            -1
        } else {
            self.start + self.items.len() as i64 - 1
        }
    }

    /// Whether the full result holds more elements than this chunk.
    pub fn has_more(&self) -> bool {
        !self.is_empty() && (self.items.len() as i64) < self.total_size()
    }

    pub fn has_previous(&self) -> bool {
        self.has_more() && self.start > 0
    }

    pub fn has_next(&self) -> bool {
        self.has_more() && self.end() < self.total_size() - 1
    }
}

impl<T> IntoIterator for DataList<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a DataList<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// Pagination numbers computed by an `at_last` callback, applied to the
/// list the callback belongs to.
#[derive(Debug, Clone, Copy)]
pub struct Fetch {
    total_size: i64,
    start: i64,
    fetch_size: i64,
}

impl Fetch {
    pub fn new(total_size: i64, start: i64, fetch_size: i64) -> Self {
        Self {
            total_size,
            start: if total_size > 0 { start } else { -1 },
            fetch_size,
        }
    }

    pub fn apply<T>(&self, list: &mut DataList<T>) {
        list.set_total_size(self.total_size);
        list.set_start(self.start);
        list.set_fetch_size(self.fetch_size);
    }
}

impl Dataset {
    /// Rewrites underscored column names to camelCase across all rows.
    pub fn underscored_to_camel_case(mut self) -> Self {
        if self.is_empty() {
            return self;
        }
        let keymap: Vec<(String, String)> = self.items[0]
            .keys()
            .map(|k| (k.clone(), camel_case(k)))
            .collect();
        for row in &mut self.items {
            for (from, to) in &keymap {
                if from != to
                    && let Some(value) = row.remove(from)
                {
                    row.insert(to.clone(), value);
                }
            }
        }
        self
    }
}

fn camel_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for token in name.split('_') {
        if token.is_empty() {
            continue;
        }
        if out.is_empty() {
            out.push_str(&token.to_lowercase());
        } else {
            let mut chars = token.chars();
            if let Some(first) = chars.next() {
                out.extend(first.to_uppercase());
                out.push_str(chars.as_str().to_lowercase().as_str());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> DataRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn pagination_mid_window() {
        let mut list = DataList::complete(vec![1, 2, 3, 4, 5]);
        list.set_total_size(12);
        list.set_start(5);
        list.set_fetch_size(5);

        assert!(list.has_more());
        assert!(list.has_previous());
        assert!(list.has_next());
        assert_eq!(list.end(), 9);
    }

    #[test]
    fn pagination_last_window() {
        let mut list = DataList::complete(vec![1, 2]);
        list.set_total_size(12);
        list.set_start(10);
        list.set_fetch_size(5);

        assert!(list.has_more());
        assert!(list.has_previous());
        assert!(!list.has_next());
    }

    #[test]
    fn empty_list_invariants() {
        let list: DataList<i32> = DataList::new();
        assert!(!list.has_more());
        assert_eq!(list.start(), -1);
        assert_eq!(list.end(), -1);
        assert_eq!(list.total_size(), 0);
    }

    #[test]
    fn complete_resets_total_to_row_count() {
        let list = DataList::complete(vec!["a", "b", "c"]);
        assert_eq!(list.total_size(), 3);
        assert!(!list.has_more());
    }

    #[test]
    fn fetch_applies_numbers() {
        let mut list = DataList::complete(vec![1, 2, 3]);
        Fetch::new(30, 6, 3).apply(&mut list);
        assert_eq!(list.total_size(), 30);
        assert_eq!(list.start(), 6);
        assert!(list.has_next());
    }

    #[test]
    fn fetch_of_empty_result_clears_start() {
        let mut list: DataList<i32> = DataList::new();
        Fetch::new(0, 4, 10).apply(&mut list);
        assert_eq!(list.start(), -1);
        assert!(!list.has_more());
    }

    #[test]
    fn camel_case_rewrite() {
        let ds = Dataset::complete(vec![row(&[
            ("CUST_ID", json!(1)),
            ("FULL_NAME", json!("a")),
        ])])
        .underscored_to_camel_case();

        let first = ds.get(0).unwrap();
        assert!(first.contains_key("custId"));
        assert!(first.contains_key("fullName"));
        assert!(!first.contains_key("CUST_ID"));
    }
}

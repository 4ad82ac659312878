use serde::Serialize;
use uuid::Uuid;

/// Opaque pagination token: the id of the last item of a full page. Ids come
/// from `Uuid::now_v7`, which runs through a process-wide counter context,
/// so ids minted within the same millisecond still sort in creation order.
/// Pagination relies on this: the ordering key must be monotonic and
/// collision-free or pages could skip or repeat items.
pub type Cursor = Uuid;

/// One page of results. `cursor` is set only when the page came back full;
/// an absent cursor means there are no further pages.
#[derive(Debug, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub cursor: Option<Cursor>,
    pub has_more: bool,
}

impl<T> Page<T> {
    /// Build a page from a query that fetched at most `limit` rows, taking
    /// the next cursor from the last row's id when the page is full.
    pub fn new(items: Vec<T>, limit: usize, id_of: impl Fn(&T) -> Uuid) -> Self {
        let cursor = if items.len() == limit {
            items.last().map(&id_of)
        } else {
            None
        };
        Page {
            has_more: cursor.is_some(),
            cursor,
            items,
        }
    }
}

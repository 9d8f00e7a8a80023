//! Pagination over sorted listings.
//!
//! Volume listings page by the base name of the next entry. Snapshot
//! listings page by a 1-based numeric position.

use std::path::Path;

use crate::error::{Error, Result};
use crate::volume::base_name;

/// One page of a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Empty when the page reaches the end of the listing.
    pub next_token: String,
}

/// Cuts a page out of an already sorted listing.
pub trait Paginator<T> {
    fn paginate(&self, items: Vec<T>, starting_token: &str, max_entries: i32) -> Result<Page<T>>;
}

/// Page length for `max_entries`, where zero or less means the rest.
fn page_len(max_entries: i32, remaining: usize) -> usize {
    match usize::try_from(max_entries) {
        Ok(0) | Err(_) => remaining,
        Ok(max) => max.min(remaining),
    }
}

/// Tokens are the base name of the first entry of a page.
#[derive(Debug, Clone, Copy, Default)]
pub struct BaseNamePaginator;

impl<T: AsRef<Path>> Paginator<T> for BaseNamePaginator {
    fn paginate(&self, mut items: Vec<T>, starting_token: &str, max_entries: i32) -> Result<Page<T>> {
        if items.is_empty() {
            if !starting_token.is_empty() {
                return Err(Error::AbortedStartingToken(format!(
                    "volume {starting_token} not found"
                )));
            }
            return Ok(Page {
                items,
                next_token: String::new(),
            });
        }

        let start = if starting_token.is_empty() {
            0
        } else {
            items
                .iter()
                .position(|item| base_name(item.as_ref()) == starting_token)
                .ok_or_else(|| Error::InvalidStartingToken(starting_token.to_string()))?
        };

        let end = start + page_len(max_entries, items.len() - start);
        let next_token = items
            .get(end)
            .map(|item| base_name(item.as_ref()))
            .unwrap_or_default();

        items.truncate(end);
        Ok(Page {
            items: items.split_off(start),
            next_token,
        })
    }
}

/// Tokens are the 1-based position of the first entry of a page.
///
/// `""` and `"0"` both start at the first entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct OffsetPaginator;

impl<T> Paginator<T> for OffsetPaginator {
    fn paginate(&self, mut items: Vec<T>, starting_token: &str, max_entries: i32) -> Result<Page<T>> {
        if items.is_empty() {
            if !starting_token.is_empty() {
                return Err(Error::AbortedStartingToken(format!(
                    "snapshot {starting_token} not found"
                )));
            }
            return Ok(Page {
                items,
                next_token: String::new(),
            });
        }

        let position = match starting_token {
            "" => 1,
            token => token.parse::<u32>().map_err(|_| {
                Error::AbortedStartingToken(
                    "The type of startingToken should be integer".to_string(),
                )
            })?,
        };
        let start = position.saturating_sub(1) as usize;
        if start >= items.len() {
            return Err(Error::AbortedStartingToken(format!(
                "startingToken {starting_token} is out of range"
            )));
        }

        let end = start + page_len(max_entries, items.len() - start);
        let next_token = if end < items.len() {
            (end + 1).to_string()
        } else {
            String::new()
        };

        items.truncate(end);
        Ok(Page {
            items: items.split_off(start),
            next_token,
        })
    }
}

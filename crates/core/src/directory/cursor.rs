//! Draining paginated result sets.
//!
//! [`CursorConsumer`] pulls entries one at a time until the cursor is
//! exhausted or the configured cap is reached. Only a result set known to be
//! complete is sorted; a capped one keeps server order.

use std::cmp::Ordering;

use tracing::{debug, warn};

use super::{DirectoryCursor, DirectoryEntry};
use crate::errors::DirectoryError;

/// Why a drain stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainStop {
    /// The cursor ran out strictly before the cap.
    Exhausted,
    /// The cap was reached; more entries may exist.
    Capped,
    /// The server answered with a referral; entries gathered so far are kept.
    Referral(String),
}

/// Entries collected from one cursor.
#[derive(Debug, Clone)]
pub struct DrainedEntries {
    pub entries: Vec<DirectoryEntry>,
    pub stop: DrainStop,
}

impl DrainedEntries {
    /// Whether every matching entry was collected.
    pub fn is_complete(&self) -> bool {
        self.stop == DrainStop::Exhausted
    }

    /// The referral target, if the drain was cut short by one.
    pub fn referral(&self) -> Option<&str> {
        match &self.stop {
            DrainStop::Referral(target) => Some(target),
            _ => None,
        }
    }
}

/// Drains cursors with an optional result cap and identifier ordering.
#[derive(Debug, Clone, Default)]
pub struct CursorConsumer {
    max_results: Option<usize>,
    sort_attribute: Option<String>,
}

impl CursorConsumer {
    /// A consumer without a cap, ordering complete results by DN.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Stop after `max` entries.
    pub fn with_max_results(mut self, max: usize) -> Self {
        self.max_results = Some(max);
        self
    }

    /// Order complete results by this attribute (then by DN).
    pub fn sorted_by(mut self, attribute: impl Into<String>) -> Self {
        self.sort_attribute = Some(attribute.into());
        self
    }

    /// Drain `cursor`.
    ///
    /// Transport errors are returned as-is. A referral ends the drain but is
    /// reported through [`DrainStop::Referral`] together with the partial
    /// results, since the entries already read remain valid.
    pub fn drain(&self, cursor: &mut dyn DirectoryCursor) -> Result<DrainedEntries, DirectoryError> {
        let mut entries = Vec::new();

        if !cursor.has_more() {
            debug!("directory search returned no result (has_more is false)");
            return Ok(DrainedEntries {
                entries,
                stop: DrainStop::Exhausted,
            });
        }

        let stop = loop {
            if self.max_results.is_some_and(|max| entries.len() >= max) {
                break DrainStop::Capped;
            }
            match cursor.next() {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {
                    if entries.is_empty() {
                        debug!(
                            "directory search returned no result \
                             (has_more was true but the first next() returned nothing)"
                        );
                    }
                    break DrainStop::Exhausted;
                }
                Err(DirectoryError::Referral { target }) => {
                    warn!(target = %target, collected = entries.len(), "directory referral during search");
                    break DrainStop::Referral(target);
                }
                Err(e) => return Err(e),
            }
            if !cursor.has_more() {
                break DrainStop::Exhausted;
            }
        };

        if stop == DrainStop::Exhausted {
            self.sort(&mut entries);
        }
        debug!(count = entries.len(), ?stop, "drained directory cursor");
        Ok(DrainedEntries { entries, stop })
    }

    fn sort(&self, entries: &mut [DirectoryEntry]) {
        let key = self.sort_attribute.as_deref();
        entries.sort_by(|a, b| {
            let by_attr = match key {
                Some(attr) => a.get(attr).unwrap_or("").cmp(b.get(attr).unwrap_or("")),
                None => Ordering::Equal,
            };
            by_attr.then_with(|| a.dn.cmp(&b.dn))
        });
    }
}

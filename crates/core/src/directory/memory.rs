//! In-process directory.
//!
//! Holds a tree of [`DirectoryEntry`] values and answers searches with the
//! same cursor semantics as a real server, including the empty-result quirk
//! where `has_more` is `true` before the first `next`. Backs the test suites.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use super::{
    DirectoryConnector, DirectoryCursor, DirectoryEntry, DirectorySession, SearchQuery, SearchScope,
};
use crate::errors::DirectoryError;

#[derive(Debug, Default)]
struct DirectoryState {
    /// Keyed by normalized DN.
    entries: BTreeMap<String, DirectoryEntry>,
    /// Normalized subtree root -> referral URL.
    referrals: BTreeMap<String, String>,
    /// Normalized DN -> reads still served before it fails with a transport error.
    failing: BTreeMap<String, usize>,
    unreachable: bool,
    searches: usize,
}

/// A shared, cloneable in-memory directory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDirectory {
    state: Arc<Mutex<DirectoryState>>,
    open_sessions: Arc<AtomicUsize>,
    connects: Arc<AtomicUsize>,
}

fn normalize_dn(dn: &str) -> String {
    dn.split(',')
        .map(|rdn| rdn.trim().to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join(",")
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DirectoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or replace an entry.
    pub fn insert(&self, entry: DirectoryEntry) {
        let key = normalize_dn(&entry.dn);
        self.lock().entries.insert(key, entry);
    }

    /// Remove an entry. Returns whether it existed.
    pub fn remove(&self, dn: &str) -> bool {
        self.lock().entries.remove(&normalize_dn(dn)).is_some()
    }

    /// Answer searches under `subtree` with a referral to `target`.
    pub fn refer(&self, subtree: &str, target: &str) {
        self.lock()
            .referrals
            .insert(normalize_dn(subtree), target.to_string());
    }

    /// Make every search that reaches `dn` fail with a transport error.
    pub fn fail_on(&self, dn: &str) {
        self.fail_after(dn, 0);
    }

    /// Serve `dn` in `reads` more searches, then fail every later one.
    pub fn fail_after(&self, dn: &str, reads: usize) {
        self.lock().failing.insert(normalize_dn(dn), reads);
    }

    /// Make `connect` fail.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Sessions currently open.
    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }

    /// Successful connects so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Searches issued so far.
    pub fn search_count(&self) -> usize {
        self.lock().searches
    }

    fn run(&self, query: &SearchQuery) -> Result<VecDeque<Step>, DirectoryError> {
        let filter = parse_filter(&query.filter)?;
        let base = normalize_dn(&query.base);
        let mut state = self.lock();
        state.searches += 1;

        let matched: Vec<(String, DirectoryEntry)> = state
            .entries
            .iter()
            .filter(|(key, entry)| in_scope(key, &base, query.scope) && filter.matches(entry))
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect();

        let mut steps = VecDeque::new();
        for (key, entry) in matched {
            if let Some(remaining) = state.failing.get_mut(&key) {
                if *remaining == 0 {
                    steps.push_back(Step::Fail(format!(
                        "connection reset while reading '{}'",
                        entry.dn
                    )));
                    continue;
                }
                *remaining -= 1;
            }
            steps.push_back(Step::Entry(entry.project(&query.attributes)));
        }

        let referral = state
            .referrals
            .iter()
            .find(|(root, _)| in_scope(&base, root, SearchScope::Subtree))
            .map(|(_, target)| target.clone());
        if let Some(target) = referral {
            steps.push_back(Step::Refer(target));
        }

        debug!(base = %query.base, filter = %query.filter, steps = steps.len(), "in-memory search");
        Ok(steps)
    }
}

fn in_scope(dn: &str, base: &str, scope: SearchScope) -> bool {
    if base.is_empty() {
        return scope != SearchScope::Base || dn.is_empty();
    }
    match scope {
        SearchScope::Base => dn == base,
        SearchScope::OneLevel => dn
            .strip_suffix(base)
            .and_then(|rest| rest.strip_suffix(','))
            .is_some_and(|rdn| !rdn.is_empty() && !rdn.contains(',')),
        SearchScope::Subtree => {
            dn == base
                || dn
                    .strip_suffix(base)
                    .is_some_and(|rest| rest.ends_with(','))
        }
    }
}

impl DirectoryConnector for InMemoryDirectory {
    fn connect(&self) -> Result<Box<dyn DirectorySession>, DirectoryError> {
        if self.lock().unreachable {
            return Err(DirectoryError::Connection {
                url: self.describe(),
                detail: "directory unreachable".into(),
            });
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.open_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            directory: self.clone(),
        }))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

struct MemorySession {
    directory: InMemoryDirectory,
}

impl DirectorySession for MemorySession {
    fn search<'a>(
        &'a mut self,
        query: &SearchQuery,
    ) -> Result<Box<dyn DirectoryCursor + 'a>, DirectoryError> {
        let steps = self.directory.run(query)?;
        Ok(Box::new(MemoryCursor {
            steps,
            finished: false,
        }))
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.directory.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
enum Step {
    Entry(DirectoryEntry),
    Refer(String),
    Fail(String),
}

struct MemoryCursor {
    steps: VecDeque<Step>,
    finished: bool,
}

impl DirectoryCursor for MemoryCursor {
    // Like paged server cursors, this only learns the set is empty on the
    // first `next`.
    fn has_more(&mut self) -> bool {
        !self.finished
    }

    fn next(&mut self) -> Result<Option<DirectoryEntry>, DirectoryError> {
        match self.steps.pop_front() {
            Some(Step::Entry(entry)) => Ok(Some(entry)),
            Some(Step::Refer(target)) => {
                self.finished = true;
                Err(DirectoryError::Referral { target })
            }
            Some(Step::Fail(detail)) => {
                self.finished = true;
                Err(DirectoryError::Transport(detail))
            }
            None => {
                self.finished = true;
                Ok(None)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Filter evaluation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Present(String),
    /// Attribute plus the `*`-separated, unescaped pattern segments.
    Match(String, Vec<String>),
}

impl Filter {
    fn matches(&self, entry: &DirectoryEntry) -> bool {
        match self {
            Filter::And(parts) => parts.iter().all(|f| f.matches(entry)),
            Filter::Or(parts) => parts.iter().any(|f| f.matches(entry)),
            Filter::Not(inner) => !inner.matches(entry),
            Filter::Present(attr) => attr.eq_ignore_ascii_case("objectClass") || entry.has(attr),
            Filter::Match(attr, segments) => entry
                .values(attr)
                .iter()
                .any(|v| segments_match(segments, &v.to_lowercase())),
        }
    }
}

fn segments_match(segments: &[String], value: &str) -> bool {
    match segments {
        [] => true,
        [exact] => value == exact,
        [first, middle @ .., last] => {
            let Some(mut rest) = value.strip_prefix(first.as_str()) else {
                return false;
            };
            for part in middle {
                match rest.find(part.as_str()) {
                    Some(at) => rest = &rest[at + part.len()..],
                    None => return false,
                }
            }
            rest.len() >= last.len() && rest.ends_with(last.as_str())
        }
    }
}

fn parse_filter(input: &str) -> Result<Filter, DirectoryError> {
    let mut parser = FilterParser {
        bytes: input.trim().as_bytes(),
        pos: 0,
    };
    let filter = parser.filter()?;
    if parser.pos != parser.bytes.len() {
        return Err(parser.error("trailing characters"));
    }
    Ok(filter)
}

struct FilterParser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl FilterParser<'_> {
    fn error(&self, detail: &str) -> DirectoryError {
        DirectoryError::InvalidFilter(format!(
            "{detail} at offset {} in '{}'",
            self.pos,
            String::from_utf8_lossy(self.bytes)
        ))
    }

    fn expect(&mut self, byte: u8) -> Result<(), DirectoryError> {
        if self.bytes.get(self.pos) == Some(&byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", byte as char)))
        }
    }

    fn filter(&mut self) -> Result<Filter, DirectoryError> {
        self.expect(b'(')?;
        let filter = match self.bytes.get(self.pos) {
            Some(b'&') => {
                self.pos += 1;
                Filter::And(self.list()?)
            }
            Some(b'|') => {
                self.pos += 1;
                Filter::Or(self.list()?)
            }
            Some(b'!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.filter()?))
            }
            _ => self.item()?,
        };
        self.expect(b')')?;
        Ok(filter)
    }

    fn list(&mut self) -> Result<Vec<Filter>, DirectoryError> {
        let mut parts = Vec::new();
        while self.bytes.get(self.pos) == Some(&b'(') {
            parts.push(self.filter()?);
        }
        Ok(parts)
    }

    fn item(&mut self) -> Result<Filter, DirectoryError> {
        let start = self.pos;
        while let Some(&b) = self.bytes.get(self.pos) {
            if b == b'=' || b == b')' {
                break;
            }
            self.pos += 1;
        }
        let attr = String::from_utf8_lossy(&self.bytes[start..self.pos]).trim().to_string();
        if attr.is_empty() {
            return Err(self.error("missing attribute"));
        }
        self.expect(b'=')?;

        let value_start = self.pos;
        while let Some(&b) = self.bytes.get(self.pos) {
            if b == b')' {
                break;
            }
            self.pos += 1;
        }
        let raw = &self.bytes[value_start..self.pos];
        if raw == b"*" {
            return Ok(Filter::Present(attr));
        }
        let segments = raw
            .split(|&b| b == b'*')
            .map(|seg| unescape(seg).map(|s| s.to_lowercase()))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| self.error("bad escape sequence"))?;
        Ok(Filter::Match(attr, segments))
    }
}

fn unescape(raw: &[u8]) -> Option<String> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'\\' {
            let hex = std::str::from_utf8(raw.get(i + 1..i + 3)?).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(raw[i]);
            i += 1;
        }
    }
    Some(String::from_utf8_lossy(&out).into_owned())
}

//! LDAP-backed directory connector built on `ldap3`'s synchronous API.
//!
//! Searches run with the paged-results control so large groups are streamed
//! page by page; the cursor surfaces entries one at a time.

use std::time::Duration;

use ldap3::adapters::{Adapter, PagedResults};
use ldap3::{EntryStream, LdapConn, LdapConnSettings, LdapResult, RequestId, Scope, SearchEntry};
use tracing::{debug, info, warn};

use super::{
    DirectoryConnector, DirectoryCursor, DirectoryEntry, DirectorySession, SearchQuery, SearchScope,
};
use crate::config::LdapConfig;
use crate::errors::DirectoryError;

/// LDAP result code for invalid credentials.
const RC_INVALID_CREDENTIALS: u32 = 49;
/// LDAP result code for a referral.
const RC_REFERRAL: u32 = 10;
/// LDAP result code for "no such object".
const RC_NO_SUCH_OBJECT: u32 = 32;

/// Opens bound LDAP sessions from an [`LdapConfig`].
#[derive(Debug, Clone)]
pub struct LdapConnector {
    url: String,
    bind_dn: String,
    bind_password: String,
    page_size: i32,
    connect_timeout: Duration,
    starttls: bool,
}

impl LdapConnector {
    pub fn new(config: &LdapConfig) -> Self {
        Self {
            url: config.url.clone(),
            bind_dn: config.bind_dn.clone(),
            bind_password: config.bind_password.clone().unwrap_or_default(),
            page_size: config.page_size.max(1),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            starttls: config.starttls,
        }
    }
}

impl DirectoryConnector for LdapConnector {
    fn connect(&self) -> Result<Box<dyn DirectorySession>, DirectoryError> {
        debug!(url = %self.url, "connecting to LDAP server");

        let settings = LdapConnSettings::new()
            .set_conn_timeout(self.connect_timeout)
            .set_starttls(self.starttls);
        let mut conn =
            LdapConn::with_settings(settings, &self.url).map_err(|e| DirectoryError::Connection {
                url: self.url.clone(),
                detail: e.to_string(),
            })?;

        debug!(bind_dn = %self.bind_dn, "performing LDAP bind");
        let result = conn
            .simple_bind(&self.bind_dn, &self.bind_password)
            .map_err(|e| DirectoryError::Connection {
                url: self.url.clone(),
                detail: format!("bind request failed: {e}"),
            })?;

        if result.rc != 0 {
            let detail = if result.rc == RC_INVALID_CREDENTIALS {
                "invalid credentials".to_string()
            } else {
                result.text.clone()
            };
            if let Err(e) = conn.unbind() {
                warn!(error = %e, "error during LDAP unbind after failed bind");
            }
            return Err(DirectoryError::Bind {
                bind_dn: self.bind_dn.clone(),
                rc: result.rc,
                detail,
            });
        }

        info!(url = %self.url, "LDAP connection established");
        Ok(Box::new(LdapSession {
            conn,
            page_size: self.page_size,
            unfinished: None,
        }))
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// A bound connection. Unbinds on drop.
struct LdapSession {
    conn: LdapConn,
    page_size: i32,
    /// Message id of a search whose cursor was dropped before the final result.
    unfinished: Option<RequestId>,
}

impl LdapSession {
    /// Abandon the search left behind by a dropped cursor, if any.
    fn abandon_unfinished(&mut self) {
        if let Some(msgid) = self.unfinished.take() {
            debug!(msgid, "abandoning unfinished LDAP search");
            if let Err(e) = self.conn.abandon(msgid) {
                warn!(msgid, error = %e, "failed to abandon LDAP search");
            }
        }
    }
}

fn to_ldap_scope(scope: SearchScope) -> Scope {
    match scope {
        SearchScope::Base => Scope::Base,
        SearchScope::OneLevel => Scope::OneLevel,
        SearchScope::Subtree => Scope::Subtree,
    }
}

impl DirectorySession for LdapSession {
    fn search<'a>(
        &'a mut self,
        query: &SearchQuery,
    ) -> Result<Box<dyn DirectoryCursor + 'a>, DirectoryError> {
        self.abandon_unfinished();
        debug!(base = %query.base, filter = %query.filter, "searching LDAP");

        let attributes: Vec<String> = if query.attributes.is_empty() {
            vec!["*".to_string()]
        } else {
            query.attributes.clone()
        };
        let adapters: Vec<Box<dyn Adapter<'static, String, Vec<String>>>> =
            vec![Box::new(PagedResults::new(self.page_size))];

        let LdapSession {
            conn, unfinished, ..
        } = self;
        let stream = conn.streaming_search_with(
            adapters,
            &query.base,
            to_ldap_scope(query.scope),
            &query.filter,
            attributes,
        )?;

        Ok(Box::new(LdapCursor {
            stream: Some(stream),
            unfinished,
        }))
    }
}

impl Drop for LdapSession {
    fn drop(&mut self) {
        self.abandon_unfinished();
        if let Err(e) = self.conn.unbind() {
            warn!(error = %e, "error during LDAP unbind");
        } else {
            debug!("LDAP session closed");
        }
    }
}

/// Entries of one search. `stream` is `None` once the final result was read.
struct LdapCursor<'a> {
    stream: Option<EntryStream<'static, 'a, String, Vec<String>>>,
    unfinished: &'a mut Option<RequestId>,
}

impl LdapCursor<'_> {
    /// Collect the final search result once the stream is drained.
    fn finish(&mut self) -> Result<Option<DirectoryEntry>, DirectoryError> {
        match self.stream.take() {
            Some(stream) => search_outcome(stream.result()),
            None => Ok(None),
        }
    }

    /// Release the stream and leave its id for the session to abandon.
    fn abandon_on_drop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            *self.unfinished = Some(stream.last_id());
        }
    }
}

/// Map the final result of a search onto the cursor contract.
fn search_outcome(result: LdapResult) -> Result<Option<DirectoryEntry>, DirectoryError> {
    match result.rc {
        0 | RC_NO_SUCH_OBJECT => Ok(None),
        RC_REFERRAL => Err(DirectoryError::Referral {
            target: result.refs.join(" "),
        }),
        rc => Err(DirectoryError::Transport(format!(
            "search ended with rc={rc}: {}",
            result.text
        ))),
    }
}

impl DirectoryCursor for LdapCursor<'_> {
    fn has_more(&mut self) -> bool {
        self.stream.is_some()
    }

    fn next(&mut self) -> Result<Option<DirectoryEntry>, DirectoryError> {
        loop {
            let Some(stream) = self.stream.as_mut() else {
                return Ok(None);
            };
            let raw = match stream.next() {
                Ok(Some(raw)) => raw,
                Ok(None) => return self.finish(),
                Err(e) => {
                    self.stream = None;
                    return Err(e.into());
                }
            };
            if raw.is_intermediate() {
                continue;
            }
            if raw.is_ref() {
                let refs = ldap3::parse_refs(raw.0);
                self.abandon_on_drop();
                return Err(DirectoryError::Referral {
                    target: refs.join(" "),
                });
            }
            return Ok(Some(convert_entry(SearchEntry::construct(raw))));
        }
    }
}

impl Drop for LdapCursor<'_> {
    fn drop(&mut self) {
        self.abandon_on_drop();
    }
}

fn convert_entry(entry: SearchEntry) -> DirectoryEntry {
    let mut out = DirectoryEntry::new(entry.dn);
    for (name, values) in entry.attrs {
        for value in values {
            out.push(&name, value);
        }
    }
    for (name, values) in entry.bin_attrs {
        if let Some(first) = values.into_iter().next() {
            out = out.with_binary(&name, first);
        }
    }
    out
}

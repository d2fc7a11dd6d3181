//! Cookie storage.
//!
//! [`CookieJar`] plays the browser's part: it accepts assigned cookie strings
//! (`name=value; path=/; max-age=60`) and renders the script-visible cookie
//! header. [`CookieStorage`] is the backend containers use; it percent-encodes
//! values into cookie strings and parses them back out of the header.
//!
//! Cookie assignment cannot fail from the writer's point of view: a cookie the
//! jar rejects (HttpOnly from script, already expired) is dropped silently.
//! Cookies never produce change notifications, so containers on this backend
//! do not synchronize across tabs.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::{PersistError, Result};
use crate::store::{StorageBackend, StorageType};

/// Longest lifetime a cookie may have, in days.
pub const MAX_COOKIE_DAYS: u32 = 400;

/// Characters left alone by URI component encoding.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

const EXPIRES_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Cross-site sending policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SameSite {
    Strict,
    #[default]
    Lax,
    None,
}

impl fmt::Display for SameSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        })
    }
}

/// Attributes written with every cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CookieOptions {
    /// Lifetime in days from now. The jar caps it at [`MAX_COOKIE_DAYS`].
    pub expire_days: u32,
    /// Lifetime in seconds. Takes precedence over `expire_days`.
    pub max_age: Option<i64>,
    pub path: String,
    /// `None` scopes the cookie to the current host.
    pub domain: Option<String>,
    pub secure: bool,
    pub same_site: SameSite,
    /// Browsers ignore HttpOnly cookies assigned from script.
    pub http_only: bool,
}

impl Default for CookieOptions {
    fn default() -> Self {
        Self {
            expire_days: 365,
            max_age: None,
            path: "/".to_string(),
            domain: None,
            secure: false,
            same_site: SameSite::Lax,
            http_only: false,
        }
    }
}

impl CookieOptions {
    /// Render the attribute suffix of a cookie string.
    pub fn attributes(&self, now: DateTime<Utc>) -> String {
        let mut out = String::new();
        match self.max_age {
            Some(seconds) => out.push_str(&format!("; max-age={seconds}")),
            None => {
                let days = self.expire_days.min(MAX_COOKIE_DAYS);
                let expires = now + Duration::days(i64::from(days));
                out.push_str(&format!("; expires={}", expires.format(EXPIRES_FORMAT)));
            }
        }
        out.push_str(&format!("; path={}", self.path));
        if let Some(domain) = &self.domain {
            out.push_str(&format!("; domain={domain}"));
        }
        if self.secure {
            out.push_str("; Secure");
        }
        out.push_str(&format!("; SameSite={}", self.same_site));
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        out
    }
}

/// Build the cookie string that stores `value` under `name`.
pub fn encode_cookie(name: &str, value: &str, options: &CookieOptions, now: DateTime<Utc>) -> String {
    format!(
        "{}={}{}",
        utf8_percent_encode(name, COMPONENT),
        utf8_percent_encode(value, COMPONENT),
        options.attributes(now)
    )
}

/// Find `name` in a cookie header and percent-decode its value.
///
/// Returns `Ok(None)` when the header has no such cookie, and a parse error
/// when the stored value is not valid percent-encoded UTF-8.
pub fn decode_cookie(header: &str, name: &str) -> Result<Option<String>> {
    for pair in header.split(';') {
        let pair = pair.trim_start();
        let Some((raw_name, raw_value)) = pair.split_once('=') else {
            continue;
        };
        let matches = percent_decode_str(raw_name)
            .decode_utf8()
            .map_or(false, |decoded| decoded == name);
        if !matches {
            continue;
        }
        return percent_decode_str(raw_value)
            .decode_utf8()
            .map(|v| Some(v.into_owned()))
            .map_err(|e| PersistError::parse(name, e));
    }
    Ok(None)
}

#[derive(Debug, Clone)]
struct StoredCookie {
    name: String,
    value: String,
    path: String,
    domain: Option<String>,
    expires: Option<DateTime<Utc>>,
    secure: bool,
    same_site: SameSite,
}

impl StoredCookie {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires.map_or(true, |at| at > now)
    }

    fn visible_from(&self, document_path: &str) -> bool {
        path_matches(&self.path, document_path)
    }

    fn same_slot(&self, other: &StoredCookie) -> bool {
        self.name == other.name && self.path == other.path && self.domain == other.domain
    }
}

fn path_matches(cookie_path: &str, document_path: &str) -> bool {
    if cookie_path == document_path {
        return true;
    }
    document_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/') || document_path[cookie_path.len()..].starts_with('/'))
}

/// The cookies of one origin.
#[derive(Default)]
pub struct CookieJar {
    cookies: RwLock<Vec<StoredCookie>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign a cookie string, as a script assigning `document.cookie` does.
    pub fn assign(&self, cookie_string: &str) {
        self.assign_at(cookie_string, Utc::now());
    }

    /// Assign a cookie string as of `now`.
    pub fn assign_at(&self, cookie_string: &str, now: DateTime<Utc>) {
        let mut parts = cookie_string.split(';');
        let Some((name, value)) = parts.next().and_then(|p| p.trim().split_once('=')) else {
            debug!("ignoring malformed cookie string");
            return;
        };

        let mut cookie = StoredCookie {
            name: name.trim().to_string(),
            value: value.trim().to_string(),
            path: "/".to_string(),
            domain: None,
            expires: None,
            secure: false,
            same_site: SameSite::Lax,
        };
        let mut max_age: Option<i64> = None;
        let mut http_only = false;

        for attribute in parts {
            let (attr, arg) = match attribute.split_once('=') {
                Some((a, v)) => (a.trim(), v.trim()),
                None => (attribute.trim(), ""),
            };
            match attr.to_ascii_lowercase().as_str() {
                "expires" => {
                    cookie.expires = DateTime::parse_from_rfc2822(arg)
                        .ok()
                        .map(|at| at.with_timezone(&Utc));
                }
                "max-age" => max_age = arg.parse().ok(),
                "path" if arg.starts_with('/') => cookie.path = arg.to_string(),
                "domain" if !arg.is_empty() => {
                    cookie.domain = Some(arg.trim_start_matches('.').to_ascii_lowercase());
                }
                "secure" => cookie.secure = true,
                "httponly" => http_only = true,
                "samesite" => {
                    cookie.same_site = match arg.to_ascii_lowercase().as_str() {
                        "strict" => SameSite::Strict,
                        "none" => SameSite::None,
                        _ => SameSite::Lax,
                    }
                }
                _ => {}
            }
        }

        if http_only {
            debug!(cookie = %cookie.name, "script cannot set HttpOnly cookies; dropped");
            return;
        }

        let cap_seconds = i64::from(MAX_COOKIE_DAYS) * 86_400;
        if let Some(seconds) = max_age {
            cookie.expires = Some(now + Duration::seconds(seconds.clamp(-1, cap_seconds)));
        }
        let cap = now + Duration::seconds(cap_seconds);
        cookie.expires = cookie.expires.map(|at| at.min(cap));

        let mut cookies = self.cookies.write();
        let existing = cookies.iter().position(|c| c.same_slot(&cookie));
        if !cookie.is_live(now) {
            if let Some(index) = existing {
                trace!(cookie = %cookie.name, "cookie expired by assignment");
                cookies.remove(index);
            }
            return;
        }
        match existing {
            Some(index) => cookies[index] = cookie,
            None => cookies.push(cookie),
        }
    }

    /// The script-visible cookie header for a document at `document_path`.
    pub fn cookie_header(&self, document_path: &str) -> String {
        self.cookie_header_at(document_path, Utc::now())
    }

    pub fn cookie_header_at(&self, document_path: &str, now: DateTime<Utc>) -> String {
        self.cookies
            .read()
            .iter()
            .filter(|c| c.is_live(now) && c.visible_from(document_path))
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Expiry of the cookie named `name` (raw, still encoded), if it has one.
    pub fn expires(&self, name: &str) -> Option<DateTime<Utc>> {
        self.cookies
            .read()
            .iter()
            .find(|c| c.name == name)
            .and_then(|c| c.expires)
    }

    /// Attributes of a stored cookie, for inspection: (secure, same_site, domain).
    pub fn attributes(&self, name: &str) -> Option<(bool, SameSite, Option<String>)> {
        self.cookies
            .read()
            .iter()
            .find(|c| c.name == name)
            .map(|c| (c.secure, c.same_site, c.domain.clone()))
    }

    /// Number of live cookies.
    pub fn len(&self) -> usize {
        let now = Utc::now();
        self.cookies.read().iter().filter(|c| c.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cookie-backed storage for one tab.
#[derive(Clone)]
pub struct CookieStorage {
    jar: Arc<CookieJar>,
    options: CookieOptions,
    document_path: String,
}

impl CookieStorage {
    pub fn new(jar: Arc<CookieJar>, options: CookieOptions, document_path: impl Into<String>) -> Self {
        let requested_days = match options.max_age {
            Some(seconds) => seconds / 86_400,
            None => i64::from(options.expire_days),
        };
        if requested_days > i64::from(MAX_COOKIE_DAYS) {
            warn!(
                requested_days,
                cap = MAX_COOKIE_DAYS,
                "cookie expiry exceeds the browser limit and will be capped"
            );
        }
        Self {
            jar,
            options,
            document_path: document_path.into(),
        }
    }

    pub fn options(&self) -> &CookieOptions {
        &self.options
    }
}

impl StorageBackend for CookieStorage {
    fn storage_type(&self) -> StorageType {
        StorageType::Cookie
    }

    fn read(&self, key: &str) -> Result<Option<String>> {
        decode_cookie(&self.jar.cookie_header(&self.document_path), key)
    }

    fn write(&self, key: &str, raw: &str) -> Result<()> {
        self.jar
            .assign(&encode_cookie(key, raw, &self.options, Utc::now()));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let expired = CookieOptions {
            max_age: Some(0),
            ..self.options.clone()
        };
        self.jar.assign(&encode_cookie(key, "", &expired, Utc::now()));
        Ok(())
    }
}

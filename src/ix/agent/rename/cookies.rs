//! Web-session cookie handling.
//!
//! The rename worker authenticates against the host's web interface, not
//! its API, so it maintains its own cookie jar. Jars can be cached in the
//! OS secret store (48-hour expiry), imported from the user's Firefox
//! profile, or loaded from a Netscape-format `cookies.txt`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::*;
use serde_derive::{Deserialize, Serialize};

use crate::ix;
use crate::ix::agent::config;
use crate::ix::agent::config::constants as c;

/// One cookie as the jar stores it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredCookie {
    pub value: String,
    pub domain: String,
    pub path: String,
    #[serde(default)]
    pub secure: bool,
    /// Epoch seconds; zero means session-only.
    #[serde(default)]
    pub expiry: i64,
}

/// A minimal cookie jar: name → cookie, expired entries dropped on read.
#[derive(Clone, Debug, Default)]
pub struct CookieJar {
    cookies: HashMap<String, StoredCookie>,
}

impl CookieJar {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn set(&mut self, name: &str, cookie: StoredCookie) {
        self.cookies.insert(name.to_string(), cookie);
    }

    pub fn extend(&mut self, cookies: HashMap<String, StoredCookie>) {
        self.cookies.extend(cookies);
    }

    pub fn clear(&mut self) {
        self.cookies.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    /// Builds the `Cookie:` request header, skipping expired entries.
    pub fn header(&self) -> Option<String> {
        let now = Utc::now().timestamp();
        let mut pairs: Vec<String> = self
            .cookies
            .iter()
            .filter(|(_, cookie)| cookie.expiry == 0 || cookie.expiry > now)
            .map(|(name, cookie)| format!("{}={}", name, cookie.value))
            .collect();
        if pairs.is_empty() {
            return None;
        }
        pairs.sort();
        Some(pairs.join("; "))
    }

    /// Absorbs `Set-Cookie` headers from a response into the jar.
    pub fn absorb_response(&mut self, response: &reqwest::Response, fallback_domain: &str) {
        for header_value in response.headers().get_all(reqwest::header::SET_COOKIE) {
            let raw = match header_value.to_str() {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            match cookie::Cookie::parse(raw.to_string()) {
                Ok(parsed) => {
                    let expiry = parsed
                        .expires_datetime()
                        .map(|t| t.unix_timestamp())
                        .unwrap_or(0);
                    self.set(
                        parsed.name(),
                        StoredCookie {
                            value: parsed.value().to_string(),
                            domain: parsed
                                .domain()
                                .unwrap_or(fallback_domain)
                                .to_string(),
                            path: parsed.path().unwrap_or("/").to_string(),
                            secure: parsed.secure().unwrap_or(false),
                            expiry,
                        },
                    );
                }
                Err(e) => debug!("unparseable Set-Cookie header: {}", e),
            }
        }
    }

    /// Serializes the session cookies for the secret-store cache, stamping
    /// each with the 48-hour cache expiry.
    pub fn to_cache_json(&self) -> Option<String> {
        let expiry = Utc::now().timestamp() + c::COOKIE_CACHE_TTL_SECS;
        let selected: HashMap<String, StoredCookie> = self
            .cookies
            .iter()
            .filter(|(name, _)| c::SESSION_COOKIE_NAMES.contains(&name.as_str()))
            .map(|(name, cookie)| {
                let mut cookie = cookie.clone();
                cookie.expiry = expiry;
                (name.clone(), cookie)
            })
            .collect();
        if selected.is_empty() {
            return None;
        }
        serde_json::to_string(&selected).ok()
    }

    /// Rebuilds a jar from the cache payload, dropping expired or
    /// malformed entries. Returns `None` when nothing valid remains.
    pub fn from_cache_json(raw: &str) -> Option<CookieJar> {
        let parsed: HashMap<String, StoredCookie> = match serde_json::from_str(raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("corrupted cookie cache payload: {}", e);
                return None;
            }
        };
        let now = Utc::now().timestamp();
        let valid: HashMap<String, StoredCookie> = parsed
            .into_iter()
            .filter(|(_, cookie)| cookie.expiry > now)
            .collect();
        if valid.is_empty() {
            None
        } else {
            Some(CookieJar { cookies: valid })
        }
    }
}

// ---------------------------------------------------------------------------
// Secret-store cache
// ---------------------------------------------------------------------------

/// Saves the session cookies to the OS secret store.
pub fn save_session_cookies(jar: &CookieJar) {
    if let Some(payload) = jar.to_cache_json() {
        match config::set_secret(c::KEYRING_COOKIE_ENTRY, &payload) {
            Ok(()) => debug!("session cookies saved to the secret store"),
            Err(e) => debug!("couldn't cache session cookies: {}", e),
        }
    }
}

/// Loads cached session cookies. Corrupt or fully expired caches are
/// cleared and an empty jar comes back.
pub fn load_session_cookies() -> CookieJar {
    match config::get_secret(c::KEYRING_COOKIE_ENTRY) {
        Ok(Some(payload)) => match CookieJar::from_cache_json(&payload) {
            Some(jar) => {
                debug!("loaded {} cached session cookie(s)", jar.len());
                jar
            }
            None => {
                debug!("cached session cookies expired or corrupt, clearing");
                clear_session_cookies();
                CookieJar::new()
            }
        },
        Ok(None) => CookieJar::new(),
        Err(e) => {
            debug!("couldn't read cookie cache: {}", e);
            CookieJar::new()
        }
    }
}

/// Clears the cached session cookies.
pub fn clear_session_cookies() {
    let _ = config::delete_secret(c::KEYRING_COOKIE_ENTRY);
}

// ---------------------------------------------------------------------------
// Browser cookie store import
// ---------------------------------------------------------------------------

#[cfg(windows)]
fn firefox_profile_root() -> Option<PathBuf> {
    std::env::var_os("APPDATA").map(|appdata| {
        Path::new(&appdata).join("Mozilla").join("Firefox").join("Profiles")
    })
}

#[cfg(not(windows))]
fn firefox_profile_root() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".mozilla").join("firefox"))
}

/// Reads matching cookies for a domain out of the user's Firefox profiles.
/// The cookie database is copied aside first because a running browser
/// holds it locked.
pub fn firefox_cookies(domain: &str, names: &[&str]) -> HashMap<String, StoredCookie> {
    let root = match firefox_profile_root() {
        Some(root) => root,
        None => return HashMap::new(),
    };
    let profiles = match fs::read_dir(&root) {
        Ok(entries) => entries,
        Err(_) => return HashMap::new(),
    };

    let mut found = HashMap::new();
    for entry in profiles.filter_map(|e| e.ok()) {
        let cookie_db = entry.path().join("cookies.sqlite");
        if !cookie_db.is_file() {
            continue;
        }
        match read_firefox_cookie_db(&cookie_db, domain, names) {
            Ok(cookies) => {
                if !cookies.is_empty() {
                    debug!(
                        "found {} cookie(s) in Firefox profile {:?}",
                        cookies.len(),
                        entry.path()
                    );
                    found.extend(cookies);
                }
            }
            Err(e) => debug!("couldn't read {:?}: {}", cookie_db, e),
        }
    }
    found
}

fn read_firefox_cookie_db(
    cookie_db: &Path,
    domain: &str,
    names: &[&str],
) -> rusqlite::Result<HashMap<String, StoredCookie>> {
    // Copy aside: the live database is locked while Firefox runs.
    let scratch = std::env::temp_dir().join(crate::ix::util::strings::random_suffix("imxup-ffcookies"));
    if fs::copy(cookie_db, &scratch).is_err() {
        return Ok(HashMap::new());
    }

    let result = (|| {
        let conn = rusqlite::Connection::open(&scratch)?;
        let mut stmt = conn.prepare(
            "SELECT name, value, host, path, isSecure, expiry
             FROM moz_cookies
             WHERE host LIKE :host",
        )?;
        let mut rows = stmt.query_named(&[(":host", &format!("%{}", domain))])?;

        let mut cookies = HashMap::new();
        while let Some(row) = rows.next() {
            let row = row?;
            let name: String = row.get(0);
            if !names.contains(&name.as_str()) {
                continue;
            }
            let secure: i64 = row.get(4);
            cookies.insert(
                name,
                StoredCookie {
                    value: row.get(1),
                    domain: row.get(2),
                    path: row.get(3),
                    secure: secure != 0,
                    expiry: row.get(5),
                },
            );
        }
        Ok(cookies)
    })();

    let _ = fs::remove_file(&scratch);
    result
}

// ---------------------------------------------------------------------------
// cookies.txt (Netscape format)
// ---------------------------------------------------------------------------

/// Location of the optional `cookies.txt` next to the configuration.
pub fn cookies_file() -> Option<PathBuf> {
    ix::home_dir().ok().map(|dir| dir.join("cookies.txt"))
}

/// Parses a Netscape-format cookie file: seven tab-separated columns,
/// `#` comments, blank lines ignored.
pub fn load_cookies_from_file(path: &Path) -> HashMap<String, StoredCookie> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(_) => return HashMap::new(),
    };

    let mut cookies = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let columns: Vec<&str> = line.split('\t').collect();
        if columns.len() != 7 {
            continue;
        }
        let expiry: i64 = columns[4].parse().unwrap_or(0);
        cookies.insert(
            columns[5].to_string(),
            StoredCookie {
                value: columns[6].to_string(),
                domain: columns[0].to_string(),
                path: columns[2].to_string(),
                secure: columns[3].eq_ignore_ascii_case("TRUE"),
                expiry,
            },
        );
    }
    cookies
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write as _;

    fn cookie(value: &str, expiry: i64) -> StoredCookie {
        StoredCookie {
            value: value.into(),
            domain: "imx.to".into(),
            path: "/".into(),
            secure: true,
            expiry,
        }
    }

    #[test]
    fn header_skips_expired_cookies() {
        let mut jar = CookieJar::new();
        jar.set("PHPSESSID", cookie("abc", 0));
        jar.set("user_id", cookie("42", Utc::now().timestamp() + 60));
        jar.set("stale", cookie("old", 1));

        assert_eq!(jar.header().unwrap(), "PHPSESSID=abc; user_id=42");
    }

    #[test]
    fn empty_jar_has_no_header() {
        assert!(CookieJar::new().header().is_none());
    }

    #[test]
    fn cache_round_trip_keeps_session_cookies_only() {
        let mut jar = CookieJar::new();
        jar.set("PHPSESSID", cookie("abc", 0));
        jar.set("user_key", cookie("k", 0));
        jar.set("tracking_junk", cookie("x", 0));

        let payload = jar.to_cache_json().unwrap();
        let restored = CookieJar::from_cache_json(&payload).unwrap();
        assert_eq!(restored.len(), 2);
        assert!(restored.header().unwrap().contains("PHPSESSID=abc"));
        assert!(!restored.header().unwrap().contains("tracking_junk"));
    }

    #[test]
    fn fully_expired_cache_yields_nothing() {
        let mut stale = HashMap::new();
        stale.insert("PHPSESSID".to_string(), cookie("abc", 10));
        let payload = serde_json::to_string(&stale).unwrap();
        assert!(CookieJar::from_cache_json(&payload).is_none());
    }

    #[test]
    fn corrupt_cache_yields_nothing() {
        assert!(CookieJar::from_cache_json("{not json").is_none());
        assert!(CookieJar::from_cache_json("[1, 2, 3]").is_none());
    }

    #[test]
    fn netscape_file_parses_seven_columns() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# Netscape HTTP Cookie File").unwrap();
        writeln!(file, "").unwrap();
        writeln!(
            file,
            "imx.to\tFALSE\t/\tTRUE\t4102444800\tPHPSESSID\tsession-value"
        )
        .unwrap();
        writeln!(file, "imx.to\tFALSE\t/\tFALSE\t0\tuser_id\t42").unwrap();
        writeln!(file, "malformed line without tabs").unwrap();

        let cookies = load_cookies_from_file(file.path());
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies["PHPSESSID"].value, "session-value");
        assert!(cookies["PHPSESSID"].secure);
        assert!(!cookies["user_id"].secure);
    }

    #[test]
    fn missing_cookie_file_is_empty() {
        assert!(load_cookies_from_file(Path::new("/nope/cookies.txt")).is_empty());
    }
}

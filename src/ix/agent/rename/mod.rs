//! The rename worker and its sibling status-check worker.
//!
//! Gallery renames are a web operation on the host: the API can create
//! galleries and upload images but only an authenticated web form can
//! rename. So this worker owns its own web session, completely separate
//! from the upload engine's API client, and both of its logical workers
//! (renames and batched image-status checks) share that one session.
//!
//! Renames that can't be performed (no login, DDoS challenge, network
//! trouble) land in the unnamed-gallery table and are drained on the next
//! startup.

mod cookies;
mod error;

pub use self::cookies::{
    load_cookies_from_file, CookieJar, StoredCookie,
};
pub use self::error::{Error, ErrorKind, Result};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::*;

use crate::ix::agent::config::constants as c;
use crate::ix::agent::config::{self, Config};
use crate::ix::agent::database::Database;
use crate::ix::agent::messages::{Event, EventBus, StatusCheckResult};
use crate::ix::agent::types::{ServiceHandle, ServiceId, ShutdownFlag};
use crate::ix::util::strings::sanitize_gallery_name;

const DDOS_MARKER: &str = "DDoS-Guard";

/// A queued rename.
#[derive(Clone, Debug, PartialEq)]
pub struct RenameRequest {
    pub gallery_id: String,
    pub gallery_name: String,
}

/// One gallery's worth of URLs for a status check.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StatusCheckGallery {
    pub db_id: i64,
    pub path: String,
    pub name: String,
    pub image_urls: Vec<String>,
}

// ---------------------------------------------------------------------------
// Web session
// ---------------------------------------------------------------------------

/// The authenticated web session: a cookie jar over two synchronous HTTP
/// clients (ordinary traffic, and a long-deadline one for the status-check
/// POST which can carry thousands of URLs).
pub struct WebSession {
    client: reqwest::Client,
    long_client: reqwest::Client,
    jar: CookieJar,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
}

impl WebSession {
    pub fn new(
        base_url: String,
        username: Option<String>,
        password: Option<String>,
    ) -> Result<WebSession> {
        let headers = default_headers();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(c::DEFAULT_REQUEST_TIMEOUT_SECS))
            .default_headers(headers.clone())
            .build()?;
        let long_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(c::STATUS_CHECK_TIMEOUT_SECS))
            .default_headers(headers)
            .build()?;
        Ok(WebSession {
            client,
            long_client,
            jar: CookieJar::new(),
            base_url,
            username,
            password,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn get(&mut self, path: &str) -> Result<reqwest::Response> {
        let mut request = self.client.get(&self.url(path));
        if let Some(header) = self.jar.header() {
            request = request.header(reqwest::header::COOKIE, header.as_str());
        }
        let response = request.send()?;
        self.jar.absorb_response(&response, "imx.to");
        Ok(response)
    }

    fn post_form(
        &mut self,
        path: &str,
        params: &[(&str, &str)],
        long: bool,
    ) -> Result<reqwest::Response> {
        let client = if long { &self.long_client } else { &self.client };
        let mut request = client.post(&self.url(path)).form(params);
        if let Some(header) = self.jar.header() {
            request = request.header(reqwest::header::COOKIE, header.as_str());
        }
        let response = request.send()?;
        self.jar.absorb_response(&response, "imx.to");
        Ok(response)
    }

    /// Cheap authenticated GET: the gallery-management page redirects to
    /// the login form when the session is dead.
    fn validate(&mut self) -> Result<bool> {
        let mut response = self.get("/user/gallery/manage")?;
        let final_url = response.url().to_string();
        let body = response.text()?;
        Ok(!final_url.contains("login") && !body.contains(DDOS_MARKER))
    }

    /// The authentication ladder: cached cookies, then browser/file
    /// cookies, then the login form. Returns whether the session ended up
    /// authenticated; a DDoS challenge surfaces as its own error.
    pub fn login(&mut self) -> Result<bool> {
        // 1. Cookies cached from a previous successful login.
        let cached = cookies::load_session_cookies();
        if !cached.is_empty() {
            self.jar = cached;
            if self.validate()? {
                info!("web session authenticated from cached cookies");
                return Ok(true);
            }
            debug!("cached cookies no longer valid");
            self.jar.clear();
        }

        // 2. The user's browser cookie store, plus cookies.txt if present.
        let mut imported = cookies::firefox_cookies("imx.to", &c::SESSION_COOKIE_NAMES);
        if let Some(cookie_file) = cookies::cookies_file() {
            imported.extend(load_cookies_from_file(&cookie_file));
        }
        if !imported.is_empty() {
            debug!("trying {} imported cookie(s)", imported.len());
            self.jar.clear();
            self.jar.extend(imported);
            if self.validate()? {
                info!("web session authenticated from imported cookies");
                cookies::save_session_cookies(&self.jar);
                return Ok(true);
            }
            self.jar.clear();
        }

        // 3. The login form, when credentials exist.
        let (username, password) = match (self.username.clone(), self.password.clone()) {
            (Some(username), Some(password)) => (username, password),
            _ => {
                info!("no web credentials available; renames will queue");
                return Ok(false);
            }
        };
        let params = [
            ("usr_email", username.as_str()),
            ("pwd", password.as_str()),
            ("remember", "1"),
            ("doLogin", "Login"),
        ];
        let mut response = self.post_form("/login.php", &params, false)?;
        let final_url = response.url().to_string();
        let body = response.text()?;
        if body.contains(DDOS_MARKER) || body.contains("ddos-guard") {
            return Err(Error::ddos_challenge());
        }
        if final_url.contains("user")
            || final_url.contains("dashboard")
            || final_url.contains("gallery")
        {
            info!("web session authenticated with credentials");
            cookies::save_session_cookies(&self.jar);
            return Ok(true);
        }
        debug!("credential login failed (final url: {})", final_url);
        Ok(false)
    }
}

fn default_headers() -> reqwest::header::HeaderMap {
    use reqwest::header::*;
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(c::USER_AGENT));
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US"));
    headers.insert(
        HeaderName::from_static("dnt"),
        HeaderValue::from_static("1"),
    );
    headers
}

// ---------------------------------------------------------------------------
// Shared session state
// ---------------------------------------------------------------------------

struct ReauthState {
    last_attempt: Option<Instant>,
}

/// Login and re-auth state shared between the rename and status-check
/// workers. The rate limit keeps a 403 stampede from hammering the login
/// endpoint: one re-auth at a time, at least five seconds apart.
pub struct SessionState {
    login_gate: Mutex<bool>,
    login_done: Condvar,
    login_successful: AtomicBool,
    reauth: Mutex<ReauthState>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            login_gate: Mutex::new(false),
            login_done: Condvar::new(),
            login_successful: AtomicBool::new(false),
            reauth: Mutex::new(ReauthState { last_attempt: None }),
        }
    }

    fn signal_login_complete(&self, successful: bool) {
        self.login_successful.store(successful, Ordering::SeqCst);
        let mut done = self.login_gate.lock().expect("login gate poisoned");
        *done = true;
        self.login_done.notify_all();
    }

    /// Waits for the initial login attempt to finish. Returns false on
    /// timeout.
    fn wait_login(&self, timeout: Duration) -> bool {
        let done = self.login_gate.lock().expect("login gate poisoned");
        if *done {
            return true;
        }
        let (done, result) = self
            .login_done
            .wait_timeout_while(done, timeout, |done| !*done)
            .expect("login gate poisoned");
        drop(done);
        !result.timed_out()
    }

    pub fn is_authenticated(&self) -> bool {
        self.login_successful.load(Ordering::SeqCst)
    }

    /// The rate-limit gate: claims a re-auth slot unless one ran too
    /// recently.
    fn reauth_gate(&self) -> bool {
        let mut reauth = self.reauth.lock().expect("reauth lock poisoned");
        if let Some(last) = reauth.last_attempt {
            if last.elapsed() < Duration::from_secs(c::REAUTH_MIN_INTERVAL_SECS) {
                debug!("re-auth attempted too recently, refusing");
                return false;
            }
        }
        reauth.last_attempt = Some(Instant::now());
        true
    }

    /// One rate-limited re-authentication attempt.
    fn attempt_reauth(&self, session: &mut WebSession) -> bool {
        if !self.reauth_gate() {
            return false;
        }
        debug!("attempting rate-limited re-authentication");
        let successful = match session.login() {
            Ok(successful) => successful,
            Err(e) => {
                warn!("re-authentication failed: {}", e);
                false
            }
        };
        self.login_successful.store(successful, Ordering::SeqCst);
        successful
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Handle used by the engine and the CLI to talk to the workers.
#[derive(Clone)]
pub struct RenameHandle {
    rename_tx: Sender<RenameRequest>,
    status_tx: Sender<Vec<StatusCheckGallery>>,
    cancel_flag: Arc<AtomicBool>,
    state: Arc<SessionState>,
}

impl RenameHandle {
    /// Queues a rename request; delivery is serialized by the single
    /// rename worker.
    pub fn queue_rename(&self, gallery_id: &str, gallery_name: &str) {
        if gallery_id.is_empty() || gallery_name.is_empty() {
            return;
        }
        let _ = self.rename_tx.send(RenameRequest {
            gallery_id: gallery_id.to_string(),
            gallery_name: gallery_name.to_string(),
        });
    }

    /// Queues a batched image-status check.
    pub fn check_image_status(&self, galleries: Vec<StatusCheckGallery>) {
        let _ = self.status_tx.send(galleries);
    }

    /// Cancels an in-progress status check at its next request boundary.
    pub fn cancel_status_check(&self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.is_authenticated()
    }
}

pub struct RenameWorker;

impl RenameWorker {
    /// Spawns the rename worker, the status-check worker, and the initial
    /// login (which also drains the unnamed-gallery table).
    pub fn spawn(
        db: Database,
        config: &Config,
        events: EventBus,
    ) -> Result<(RenameHandle, Vec<ServiceHandle>)> {
        let username = if config.auth.username.is_empty() {
            None
        } else {
            Some(config.auth.username.clone())
        };
        let password = config::get_secret(c::KEYRING_WEB_PASSWORD_ENTRY)?;
        if username.is_some() && password.is_none() {
            info!("web username configured but no password in the secret store");
        }

        let session = Arc::new(Mutex::new(WebSession::new(
            c::BASE_WEB_URL.to_string(),
            username,
            password,
        )?));
        let state = Arc::new(SessionState::new());
        let cancel_flag = Arc::new(AtomicBool::new(false));
        let (rename_tx, rename_rx) = mpsc::channel();
        let (status_tx, status_rx) = mpsc::channel();

        let mut handles = vec![];

        // Initial login, then the startup drain of pending renames.
        {
            let session = session.clone();
            let state = state.clone();
            let db = db.clone();
            let events = events.clone();
            let shutdown = ShutdownFlag::new();
            let thread = thread::Builder::new()
                .name("rename-login".into())
                .spawn(move || initial_login(session, state, db, events))
                .expect("couldn't spawn the login thread");
            handles.push(ServiceHandle::new(
                ServiceId("RenameLogin"),
                shutdown,
                thread,
            ));
        }

        // The rename worker.
        {
            let session = session.clone();
            let state = state.clone();
            let db = db.clone();
            let events = events.clone();
            let shutdown = ShutdownFlag::new();
            let flag = shutdown.clone();
            let thread = thread::Builder::new()
                .name("rename-worker".into())
                .spawn(move || rename_loop(session, state, db, events, rename_rx, flag))
                .expect("couldn't spawn the rename worker thread");
            handles.push(ServiceHandle::new(ServiceId("Renamer"), shutdown, thread));
        }

        // The status-check worker.
        {
            let session = session.clone();
            let state = state.clone();
            let events = events.clone();
            let cancel = cancel_flag.clone();
            let shutdown = ShutdownFlag::new();
            let flag = shutdown.clone();
            let thread = thread::Builder::new()
                .name("status-check".into())
                .spawn(move || status_check_loop(session, state, events, status_rx, cancel, flag))
                .expect("couldn't spawn the status-check thread");
            handles.push(ServiceHandle::new(
                ServiceId("StatusChecker"),
                shutdown,
                thread,
            ));
        }

        Ok((
            RenameHandle {
                rename_tx,
                status_tx,
                cancel_flag,
                state,
            },
            handles,
        ))
    }
}

fn initial_login(
    session: Arc<Mutex<WebSession>>,
    state: Arc<SessionState>,
    db: Database,
    events: EventBus,
) {
    crate::ix::agent::types::register_service_logging();
    let successful = {
        let mut session = session.lock().expect("web session lock poisoned");
        match session.login() {
            Ok(successful) => successful,
            Err(e) => {
                match e.kind() {
                    ErrorKind::DdosChallenge => {
                        warn!("login blocked by DDoS challenge; renames queue for next startup")
                    }
                    _ => warn!("web login failed: {}", e),
                }
                false
            }
        }
    };
    state.signal_login_complete(successful);
    if !successful {
        debug!("rename worker unauthenticated: queued renames persist for later");
        return;
    }

    // Drain renames left over from earlier runs.
    let unnamed = match db.get_unnamed_galleries() {
        Ok(unnamed) => unnamed,
        Err(e) => {
            warn!("couldn't read the unnamed-gallery table: {}", e);
            return;
        }
    };
    if unnamed.is_empty() {
        return;
    }
    info!("auto-renaming {} pending gallery(ies)", unnamed.len());
    for (gallery_id, name) in unnamed {
        let mut session = session.lock().expect("web session lock poisoned");
        if rename_gallery(&mut session, &state, &gallery_id, &name, true) {
            let _ = db.remove_unnamed_gallery(&gallery_id);
            events.publish(Event::GalleryRenamed { gallery_id });
        } else if !state.is_authenticated() {
            debug!("session died mid-drain; remaining galleries stay queued");
            return;
        }
    }
}

fn rename_loop(
    session: Arc<Mutex<WebSession>>,
    state: Arc<SessionState>,
    db: Database,
    events: EventBus,
    rx: Receiver<RenameRequest>,
    shutdown: ShutdownFlag,
) {
    crate::ix::agent::types::register_service_logging();
    loop {
        if shutdown.is_triggered() {
            return;
        }
        let request = match rx.recv_timeout(Duration::from_secs(1)) {
            Ok(request) => request,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        };

        if !state.wait_login(Duration::from_secs(c::LOGIN_WAIT_TIMEOUT_SECS)) {
            debug!("login timed out; queueing {} for later", request.gallery_id);
            queue_for_later(&db, &request);
            continue;
        }
        if !state.is_authenticated() {
            debug!("not authenticated; queueing {} for later", request.gallery_id);
            queue_for_later(&db, &request);
            continue;
        }

        let renamed = {
            let mut session = session.lock().expect("web session lock poisoned");
            rename_gallery(
                &mut session,
                &state,
                &request.gallery_id,
                &request.gallery_name,
                true,
            )
        };
        if renamed {
            let _ = db.remove_unnamed_gallery(&request.gallery_id);
            events.publish(Event::GalleryRenamed {
                gallery_id: request.gallery_id,
            });
        } else {
            queue_for_later(&db, &request);
        }
    }
}

fn queue_for_later(db: &Database, request: &RenameRequest) {
    if let Err(e) = db.save_unnamed_gallery(&request.gallery_id, &request.gallery_name) {
        error!("couldn't queue gallery for auto-rename: {}", e);
    }
}

/// Renames one gallery through the web form. A 403 (or a redirect to the
/// login page) triggers one rate-limited re-auth and a single retry.
fn rename_gallery(
    session: &mut WebSession,
    state: &SessionState,
    gallery_id: &str,
    new_name: &str,
    retry_on_auth_failure: bool,
) -> bool {
    let sanitized = sanitize_gallery_name(new_name);
    if sanitized != new_name {
        debug!("sanitized gallery name {:?} -> {:?}", new_name, sanitized);
    }

    let edit_path = format!("/user/gallery/edit?id={}", gallery_id);
    let mut edit_page = match session.get(&edit_path) {
        Ok(response) => response,
        Err(e) => {
            debug!("couldn't fetch edit page: {}", e);
            return false;
        }
    };

    let status = edit_page.status().as_u16();
    if status == 403 {
        debug!("authentication expired (HTTP 403)");
        if retry_on_auth_failure && state.attempt_reauth(session) {
            return rename_gallery(session, state, gallery_id, &sanitized, false);
        }
        state.login_successful.store(false, Ordering::SeqCst);
        return false;
    }
    if status != 200 {
        debug!("cannot access edit page (HTTP {})", status);
        return false;
    }

    let final_url = edit_page.url().to_string();
    let body = edit_page.text().unwrap_or_default();
    if body.contains(DDOS_MARKER) {
        warn!("DDoS challenge on the edit page; rename deferred");
        return false;
    }
    if final_url.contains("login") {
        debug!("redirected to login; attempting re-authentication");
        if retry_on_auth_failure && state.attempt_reauth(session) {
            return rename_gallery(session, state, gallery_id, &sanitized, false);
        }
        state.login_successful.store(false, Ordering::SeqCst);
        return false;
    }

    let params = [
        ("gallery_name", sanitized.as_str()),
        ("submit_new_gallery", "Rename Gallery"),
    ];
    match session.post_form(&edit_path, &params, false) {
        Ok(response) if response.status().as_u16() == 200 => {
            info!("renamed gallery {} to {:?}", gallery_id, sanitized);
            true
        }
        Ok(response) => {
            debug!("rename failed (HTTP {})", response.status().as_u16());
            false
        }
        Err(e) => {
            debug!("rename failed: {}", e);
            false
        }
    }
}

fn status_check_loop(
    session: Arc<Mutex<WebSession>>,
    state: Arc<SessionState>,
    events: EventBus,
    rx: Receiver<Vec<StatusCheckGallery>>,
    cancel: Arc<AtomicBool>,
    shutdown: ShutdownFlag,
) {
    crate::ix::agent::types::register_service_logging();
    loop {
        if shutdown.is_triggered() {
            return;
        }
        let galleries = match rx.recv_timeout(Duration::from_secs(1)) {
            Ok(galleries) => galleries,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        };

        if galleries.is_empty() {
            events.publish(Event::StatusCheckCompleted {
                results: HashMap::new(),
            });
            continue;
        }
        if !state.wait_login(Duration::from_secs(c::LOGIN_WAIT_TIMEOUT_SECS)) {
            events.publish(Event::StatusCheckError {
                error: "login timeout, try again later".to_string(),
            });
            continue;
        }
        if !state.is_authenticated() {
            events.publish(Event::StatusCheckError {
                error: "not authenticated".to_string(),
            });
            continue;
        }

        cancel.store(false, Ordering::SeqCst);
        let outcome = {
            let mut session = session.lock().expect("web session lock poisoned");
            perform_status_check(&mut session, &state, &events, &galleries, &cancel)
        };
        match outcome {
            Ok(results) => events.publish(Event::StatusCheckCompleted { results }),
            Err(e) => {
                warn!("status check failed: {}", e);
                events.publish(Event::StatusCheckError {
                    error: e.to_string(),
                });
            }
        }
    }
}

/// POSTs every collected URL to the moderation endpoint in one request and
/// derives per-URL online status from the response body: URLs that are
/// still online are echoed back.
fn perform_status_check(
    session: &mut WebSession,
    state: &SessionState,
    events: &EventBus,
    galleries: &[StatusCheckGallery],
    cancel: &AtomicBool,
) -> Result<HashMap<String, StatusCheckResult>> {
    // Deduplicate URLs across galleries.
    let mut all_urls: Vec<String> = vec![];
    let mut seen: HashMap<&str, ()> = HashMap::new();
    for gallery in galleries {
        for url in &gallery.image_urls {
            let url = url.trim();
            if !url.is_empty() && seen.insert(url, ()).is_none() {
                all_urls.push(url.to_string());
            }
        }
    }
    if all_urls.is_empty() {
        debug!("status check had no valid URLs");
        return Ok(HashMap::new());
    }

    let total = all_urls.len();
    info!(
        "checking status of {} URL(s) from {} gallery(ies)",
        total,
        galleries.len()
    );
    events.publish(Event::StatusCheckProgress { done: 0, total });

    if cancel.load(Ordering::SeqCst) {
        debug!("status check cancelled before the request");
        return Ok(HashMap::new());
    }

    let joined = all_urls.join("\n");
    let params = [("imagesid", joined.as_str())];
    let mut response = session.post_form("/user/moderate", &params, true)?;

    if response.status().as_u16() == 403 {
        debug!("status check hit a 403, attempting re-auth");
        if !state.attempt_reauth(session) {
            return Err(Error::auth_required());
        }
        if cancel.load(Ordering::SeqCst) {
            debug!("status check cancelled before the retry");
            return Ok(HashMap::new());
        }
        response = session.post_form("/user/moderate", &params, true)?;
    }
    if response.status().as_u16() != 200 {
        return Err(Error::http_status(response.status().as_u16()));
    }
    let body = response.text()?;
    if body.contains(DDOS_MARKER) {
        return Err(Error::ddos_challenge());
    }

    events.publish(Event::StatusCheckProgress { done: total, total });

    let mut results = HashMap::new();
    for gallery in galleries {
        if gallery.path.is_empty() || gallery.image_urls.is_empty() {
            continue;
        }
        let (online_urls, offline_urls): (Vec<String>, Vec<String>) = gallery
            .image_urls
            .iter()
            .cloned()
            .partition(|url| body.contains(url.trim()));
        results.insert(
            gallery.path.clone(),
            StatusCheckResult {
                db_id: gallery.db_id,
                name: gallery.name.clone(),
                total: gallery.image_urls.len(),
                online: online_urls.len(),
                offline: offline_urls.len(),
                online_urls,
                offline_urls,
            },
        );
    }
    Ok(results)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reauth_gate_enforces_spacing() {
        let state = SessionState::new();
        assert!(state.reauth_gate());
        // Immediately after, the gate refuses.
        assert!(!state.reauth_gate());
        assert!(!state.reauth_gate());
    }

    #[test]
    fn wait_login_times_out_until_signalled() {
        let state = Arc::new(SessionState::new());
        assert!(!state.wait_login(Duration::from_millis(50)));

        let signaller = state.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            signaller.signal_login_complete(true);
        });
        assert!(state.wait_login(Duration::from_secs(5)));
        assert!(state.is_authenticated());
        t.join().unwrap();
    }

    #[test]
    fn wait_login_returns_immediately_after_completion() {
        let state = SessionState::new();
        state.signal_login_complete(false);
        assert!(state.wait_login(Duration::from_millis(1)));
        assert!(!state.is_authenticated());
    }
}

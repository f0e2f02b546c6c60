//! Program level configuration constants live here.

/// CLI logging output format.
pub const AGENT_LOG_FORMAT: &str =
    "[{d(%Y-%m-%d %H:%M:%S %Z)(utc)}][{l}][{t}][{X(tid)(main)}] {m}{n}";

/// Rolling log file limits: 10 MiB per file, 7 files kept.
pub const LOG_MAX_BYTES: u64 = 10 * 1024 * 1024;
pub const LOG_ROTATION_COUNT: u32 = 7;

/// Primary host endpoints.
pub const BASE_API_URL: &str = "https://api.imx.to/v1";
pub const BASE_WEB_URL: &str = "https://imx.to";

/// Browser identity presented by the web session.
pub const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:141.0) Gecko/20100101 Firefox/141.0";

/// HTTP deadlines, in seconds. The status-check POST can carry thousands of
/// URLs and gets a much longer deadline than ordinary session traffic.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 90;
pub const STATUS_CHECK_TIMEOUT_SECS: u64 = 300;
pub const FILEHOST_UPLOAD_TIMEOUT_SECS: u64 = 300;

/// Upload defaults.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_PARALLEL_BATCH_SIZE: usize = 4;
pub const DEFAULT_PUBLIC_GALLERY: bool = true;

/// Image extensions the scanner recognizes (matched case-insensitively, at
/// the gallery root only).
pub const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "gif"];

/// Archive containers accepted as gallery inputs.
pub const ARCHIVE_EXTENSIONS: [&str; 2] = ["zip", "cbz"];

/// Upper bound on images decoded for the average-dimension estimate.
pub const MAX_DIMENSION_SAMPLES: usize = 25;

/// Engine loop pacing.
pub const ENGINE_IDLE_SLEEP_MS: u64 = 100;
pub const QUEUE_STATS_MIN_INTERVAL_SECS: u64 = 1;

/// Bandwidth sampling and smoothing.
pub const BANDWIDTH_POLL_INTERVAL_MS: u64 = 200;
pub const BANDWIDTH_PUBLISH_MIN_INTERVAL_MS: u64 = 200;
pub const BANDWIDTH_WINDOW_SAMPLES: usize = 20;
pub const BANDWIDTH_ATTACK_ALPHA: f64 = 0.30;
pub const BANDWIDTH_RELEASE_ALPHA: f64 = 0.05;
/// Readings above this are treated as measurement glitches, never records.
pub const BANDWIDTH_PEAK_CEILING_KBPS: f64 = 10.0 * 1024.0 * 1024.0;

/// Hook execution limits.
pub const HOOK_TIMEOUT_SECS: u64 = 300;

/// Temp file removal: external processes may briefly hold handles after the
/// child exits, so deletion retries with doubling delays.
pub const TEMP_REMOVE_MAX_RETRIES: u32 = 5;
pub const TEMP_REMOVE_INITIAL_DELAY_MS: u64 = 100;

/// Web-session re-authentication rate limiting.
pub const REAUTH_MIN_INTERVAL_SECS: u64 = 5;

/// How long the rename/status-check workers wait for the initial login.
pub const LOGIN_WAIT_TIMEOUT_SECS: u64 = 30;

/// Cached web-session cookies expire after 48 hours.
pub const COOKIE_CACHE_TTL_SECS: i64 = 48 * 60 * 60;

/// Cookies that constitute an authenticated imx.to web session.
pub const SESSION_COOKIE_NAMES: [&str; 5] =
    ["continue", "PHPSESSID", "user_id", "user_key", "user_name"];

/// OS secret-store service name.
pub const KEYRING_SERVICE: &str = "imxup";
pub const KEYRING_COOKIE_ENTRY: &str = "session_cookies";
pub const KEYRING_API_KEY_ENTRY: &str = "api_key";
pub const KEYRING_WEB_PASSWORD_ENTRY: &str = "web_password";

/// System tabs that always exist.
pub const MAIN_TAB: &str = "Main";
pub const ARCHIVE_TAB: &str = "Archive";

/// Auto-archive bounds, in minutes.
pub const DEFAULT_ARCHIVE_CHECK_MINUTES: u64 = 30;
pub const MIN_ARCHIVE_CHECK_MINUTES: u64 = 5;
pub const MAX_ARCHIVE_CHECK_MINUTES: u64 = 1440;

/// Used for parsing and generating the imxup.ini file.
pub const UPLOAD_SECTION: &str = "upload";
pub const SCANNING_SECTION: &str = "SCANNING";
pub const EXTERNAL_APPS_SECTION: &str = "EXTERNAL_APPS";
pub const AUTH_SECTION: &str = "auth";
pub const AUTO_ARCHIVE_SECTION: &str = "auto_archive";
/// File-host sections are named `filehost:<host name>`.
pub const FILEHOST_SECTION_PREFIX: &str = "filehost:";

/// Template placeholders substituted by the artifact writer. Closed set.
pub const TEMPLATE_PLACEHOLDERS: [&str; 9] = [
    "#folderName#",
    "#pictureCount#",
    "#width#",
    "#height#",
    "#longest#",
    "#extension#",
    "#folderSize#",
    "#galleryLink#",
    "#allImages#",
];

/// The template used when a gallery names none (or names a missing one).
pub const DEFAULT_TEMPLATE_NAME: &str = "default";
pub const DEFAULT_TEMPLATE_BODY: &str = "[b]#folderName#[/b] \
([i]#pictureCount# images, #width#x#height#, #folderSize#[/i])\n\
#galleryLink#\n\n#allImages#\n";

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::str::{self, FromStr};

use ini::Ini;

use crate::ix;

pub mod constants;
mod error;
mod secrets;

pub use self::error::{Error, ErrorKind, Result};
pub use self::secrets::{delete_secret, get_secret, set_secret};

use self::constants as c;

/// A typeful representation of the imxup configuration file located at
/// `$HOME/.imxup/imxup.ini`.
///
/// Passwords never appear here; they live in the OS secret store and the ini
/// only carries usernames and non-secret parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub upload: UploadSettings,
    pub scanning: ScanSettings,
    pub hooks: HooksSettings,
    pub auth: AuthSettings,
    pub auto_archive: AutoArchiveSettings,
    pub file_hosts: Vec<FileHostSettings>,
}

impl Config {
    /// Create a new Config object from the config file, falling back to
    /// defaults when no file exists yet.
    pub fn from_config_file_or_default() -> Self {
        Self::from_config_file().unwrap_or_else(|_| Self::default())
    }

    /// Create a new Config object from the config file.
    pub fn from_config_file() -> Result<Self> {
        let mut file_contents = String::new();
        File::open(ix::config_file().map_err(|e| Error::config_file_not_found(e.to_string()))?)
            .map_err(|e| Error::config_file_not_found(e.to_string()))
            .and_then(|mut file| {
                file.read_to_string(&mut file_contents)
                    .map_err(Into::into)
                    .and_then(|_| file_contents.parse().map_err(Into::into))
            })
    }

    /// Writes this configuration to the config file location.
    pub fn write_to_config_file(&self) -> Result<()> {
        let path = ix::config_file().map_err(|e| Error::config_file_not_found(e.to_string()))?;
        std::fs::write(&path, self.to_string()).map_err(Into::into)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upload: Default::default(),
            scanning: Default::default(),
            hooks: Default::default(),
            auth: Default::default(),
            auto_archive: Default::default(),
            file_hosts: vec![],
        }
    }
}

/// Thumbnail sizes offered by the primary host, keyed by its numeric codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThumbnailSize {
    S100,
    S150,
    S180,
    S250,
    S300,
}

impl ThumbnailSize {
    pub fn code(self) -> u32 {
        match self {
            ThumbnailSize::S100 => 1,
            ThumbnailSize::S180 => 2,
            ThumbnailSize::S250 => 3,
            ThumbnailSize::S300 => 4,
            ThumbnailSize::S150 => 6,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(ThumbnailSize::S100),
            2 => Some(ThumbnailSize::S180),
            3 => Some(ThumbnailSize::S250),
            4 => Some(ThumbnailSize::S300),
            6 => Some(ThumbnailSize::S150),
            _ => None,
        }
    }

    pub fn dimensions(self) -> &'static str {
        match self {
            ThumbnailSize::S100 => "100x100",
            ThumbnailSize::S150 => "150x150",
            ThumbnailSize::S180 => "180x180",
            ThumbnailSize::S250 => "250x250",
            ThumbnailSize::S300 => "300x300",
        }
    }
}

impl Default for ThumbnailSize {
    fn default() -> Self {
        ThumbnailSize::S250
    }
}

/// Thumbnail encodings offered by the primary host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThumbnailFormat {
    Jpeg70,
    Jpeg90,
    Png,
    Webp,
}

impl ThumbnailFormat {
    pub fn code(self) -> u32 {
        match self {
            ThumbnailFormat::Jpeg70 => 1,
            ThumbnailFormat::Jpeg90 => 2,
            ThumbnailFormat::Png => 3,
            ThumbnailFormat::Webp => 4,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(ThumbnailFormat::Jpeg70),
            2 => Some(ThumbnailFormat::Jpeg90),
            3 => Some(ThumbnailFormat::Png),
            4 => Some(ThumbnailFormat::Webp),
            _ => None,
        }
    }
}

impl Default for ThumbnailFormat {
    fn default() -> Self {
        ThumbnailFormat::Jpeg90
    }
}

/// The `[upload]` section: parameters for the primary-host upload engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSettings {
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub parallel_batch_size: usize,
    pub thumbnail_size: ThumbnailSize,
    pub thumbnail_format: ThumbnailFormat,
    pub public_gallery: bool,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            timeout_secs: c::DEFAULT_REQUEST_TIMEOUT_SECS,
            max_retries: c::DEFAULT_MAX_RETRIES,
            parallel_batch_size: c::DEFAULT_PARALLEL_BATCH_SIZE,
            thumbnail_size: Default::default(),
            thumbnail_format: Default::default(),
            public_gallery: c::DEFAULT_PUBLIC_GALLERY,
        }
    }
}

/// How the scanner picks the subset of images it decodes headers for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingMethod {
    FixedCount,
    Percentage,
}

impl FromStr for SamplingMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "fixed" | "fixed_count" => Ok(SamplingMethod::FixedCount),
            "percentage" => Ok(SamplingMethod::Percentage),
            other => Err(Error::invalid_value("sampling_method", other)),
        }
    }
}

/// How sampled dimensions collapse into the per-gallery average.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AverageMethod {
    Mean,
    Median,
}

impl FromStr for AverageMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "mean" | "average" => Ok(AverageMethod::Mean),
            "median" => Ok(AverageMethod::Median),
            other => Err(Error::invalid_value("average_method", other)),
        }
    }
}

/// The `[SCANNING]` section: dimension-sampling behavior of the scan worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSettings {
    pub fast_scanning: bool,
    pub sampling_method: SamplingMethod,
    pub sampling_fixed_count: usize,
    pub sampling_percentage: u32,
    pub exclude_first: bool,
    pub exclude_last: bool,
    pub exclude_small_images: bool,
    pub exclude_outliers: bool,
    pub exclude_small_threshold: u64,
    pub exclude_patterns: Vec<String>,
    pub average_method: AverageMethod,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            fast_scanning: true,
            sampling_method: SamplingMethod::FixedCount,
            sampling_fixed_count: c::MAX_DIMENSION_SAMPLES,
            sampling_percentage: 10,
            exclude_first: false,
            exclude_last: false,
            exclude_small_images: true,
            exclude_outliers: false,
            exclude_small_threshold: 10 * 1024,
            exclude_patterns: vec![],
            average_method: AverageMethod::Mean,
        }
    }
}

/// One lifecycle hook: a command template plus the mapping from the gallery
/// extension fields to keys expected in the hook's JSON stdout.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HookSettings {
    pub enabled: bool,
    pub command: String,
    pub show_console: bool,
    /// JSON keys feeding ext1..ext4, in order.
    pub key_mapping: [String; 4],
}

/// The `[EXTERNAL_APPS]` section: the three lifecycle hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HooksSettings {
    pub parallel_execution: bool,
    pub added: HookSettings,
    pub started: HookSettings,
    pub completed: HookSettings,
}

impl HooksSettings {
    pub fn for_event(&self, event: &str) -> Option<&HookSettings> {
        match event {
            "added" => Some(&self.added),
            "started" => Some(&self.started),
            "completed" => Some(&self.completed),
            _ => None,
        }
    }
}

impl Default for HooksSettings {
    fn default() -> Self {
        fn hook() -> HookSettings {
            HookSettings {
                key_mapping: [
                    "ext1".to_string(),
                    "ext2".to_string(),
                    "ext3".to_string(),
                    "ext4".to_string(),
                ],
                ..Default::default()
            }
        }
        Self {
            parallel_execution: true,
            added: hook(),
            started: hook(),
            completed: hook(),
        }
    }
}

/// The `[auth]` section: the web-session username. The password and API
/// key are looked up in the OS secret store.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthSettings {
    pub username: String,
}

/// The `[auto_archive]` section: time-based archival of completed galleries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoArchiveSettings {
    pub enabled: bool,
    pub check_minutes: u64,
    pub archive_after_minutes: u64,
}

impl Default for AutoArchiveSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            check_minutes: c::DEFAULT_ARCHIVE_CHECK_MINUTES,
            archive_after_minutes: 24 * 60,
        }
    }
}

/// One `[filehost:<name>]` section, an additional whole-gallery ZIP
/// destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHostSettings {
    pub name: String,
    pub enabled: bool,
    pub username: String,
    pub api_url: String,
}

impl FileHostSettings {
    /// Secret-store entry holding this host's password.
    pub fn secret_name(&self) -> String {
        format!("filehost:{}", self.name)
    }
}

// ---------------------------------------------------------------------------
// ini <-> Config
// ---------------------------------------------------------------------------

fn get<'a>(ini: &'a Ini, section: &str, key: &str) -> Option<&'a str> {
    ini.section(Some(section))
        .and_then(|props| props.get(key))
        .map(|v| v.as_str())
}

fn get_parsed<T: FromStr>(ini: &Ini, section: &str, key: &str, default: T) -> Result<T> {
    match get(ini, section, key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| Error::invalid_value(format!("{}.{}", section, key), raw)),
    }
}

fn get_bool(ini: &Ini, section: &str, key: &str, default: bool) -> Result<bool> {
    match get(ini, section, key) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            other => Err(Error::invalid_value(format!("{}.{}", section, key), other)),
        },
    }
}

fn get_string(ini: &Ini, section: &str, key: &str, default: &str) -> String {
    get(ini, section, key)
        .map(|v| v.to_string())
        .unwrap_or_else(|| default.to_string())
}

fn parse_hook(ini: &Ini, event: &str) -> Result<HookSettings> {
    let s = c::EXTERNAL_APPS_SECTION;
    let key = |suffix: &str| format!("hook_{}_{}", event, suffix);
    let mapping_key = |n: u32| {
        get_string(ini, s, &key(&format!("key{}", n)), &format!("ext{}", n))
    };
    Ok(HookSettings {
        enabled: get_bool(ini, s, &key("enabled"), false)?,
        command: get_string(ini, s, &key("command"), ""),
        show_console: get_bool(ini, s, &key("show_console"), false)?,
        key_mapping: [mapping_key(1), mapping_key(2), mapping_key(3), mapping_key(4)],
    })
}

impl FromStr for Config {
    type Err = Error;

    fn from_str(raw_ini: &str) -> Result<Self> {
        let ini = Ini::load_from_str(raw_ini)?;

        let upload = {
            let s = c::UPLOAD_SECTION;
            let size_code =
                get_parsed::<u32>(&ini, s, "thumbnail_size", ThumbnailSize::default().code())?;
            let format_code =
                get_parsed::<u32>(&ini, s, "thumbnail_format", ThumbnailFormat::default().code())?;
            UploadSettings {
                timeout_secs: get_parsed(&ini, s, "timeout", c::DEFAULT_REQUEST_TIMEOUT_SECS)?,
                max_retries: get_parsed(&ini, s, "retries", c::DEFAULT_MAX_RETRIES)?,
                parallel_batch_size: get_parsed(
                    &ini,
                    s,
                    "batch_size",
                    c::DEFAULT_PARALLEL_BATCH_SIZE,
                )?,
                thumbnail_size: ThumbnailSize::from_code(size_code)
                    .ok_or_else(|| Error::invalid_value("upload.thumbnail_size", size_code.to_string()))?,
                thumbnail_format: ThumbnailFormat::from_code(format_code)
                    .ok_or_else(|| Error::invalid_value("upload.thumbnail_format", format_code.to_string()))?,
                public_gallery: get_bool(&ini, s, "public_gallery", c::DEFAULT_PUBLIC_GALLERY)?,
            }
        };

        let scanning = {
            let s = c::SCANNING_SECTION;
            let defaults = ScanSettings::default();
            ScanSettings {
                fast_scanning: get_bool(&ini, s, "fast_scanning", defaults.fast_scanning)?,
                sampling_method: get_parsed(&ini, s, "sampling_method", defaults.sampling_method)?,
                sampling_fixed_count: get_parsed(
                    &ini,
                    s,
                    "sampling_fixed_count",
                    defaults.sampling_fixed_count,
                )?,
                sampling_percentage: get_parsed(
                    &ini,
                    s,
                    "sampling_percentage",
                    defaults.sampling_percentage,
                )?,
                exclude_first: get_bool(&ini, s, "exclude_first", defaults.exclude_first)?,
                exclude_last: get_bool(&ini, s, "exclude_last", defaults.exclude_last)?,
                exclude_small_images: get_bool(
                    &ini,
                    s,
                    "exclude_small_images",
                    defaults.exclude_small_images,
                )?,
                exclude_outliers: get_bool(&ini, s, "exclude_outliers", defaults.exclude_outliers)?,
                exclude_small_threshold: get_parsed(
                    &ini,
                    s,
                    "exclude_small_threshold",
                    defaults.exclude_small_threshold,
                )?,
                exclude_patterns: get(&ini, s, "exclude_patterns")
                    .map(|raw| {
                        raw.split(';')
                            .map(|p| p.trim().to_string())
                            .filter(|p| !p.is_empty())
                            .collect()
                    })
                    .unwrap_or_default(),
                average_method: get_parsed(&ini, s, "average_method", defaults.average_method)?,
            }
        };

        let hooks = HooksSettings {
            parallel_execution: get_bool(
                &ini,
                c::EXTERNAL_APPS_SECTION,
                "parallel_execution",
                true,
            )?,
            added: parse_hook(&ini, "added")?,
            started: parse_hook(&ini, "started")?,
            completed: parse_hook(&ini, "completed")?,
        };

        let auth = AuthSettings {
            username: get_string(&ini, c::AUTH_SECTION, "username", ""),
        };

        let auto_archive = {
            let s = c::AUTO_ARCHIVE_SECTION;
            let defaults = AutoArchiveSettings::default();
            let check_minutes: u64 =
                get_parsed(&ini, s, "check_minutes", defaults.check_minutes)?;
            AutoArchiveSettings {
                enabled: get_bool(&ini, s, "enabled", defaults.enabled)?,
                check_minutes: check_minutes
                    .max(c::MIN_ARCHIVE_CHECK_MINUTES)
                    .min(c::MAX_ARCHIVE_CHECK_MINUTES),
                archive_after_minutes: get_parsed(
                    &ini,
                    s,
                    "archive_after_minutes",
                    defaults.archive_after_minutes,
                )?,
            }
        };

        let mut file_hosts = vec![];
        for (section_name, props) in ini.iter() {
            let section_name = match section_name {
                Some(name) => name,
                None => continue,
            };
            if !section_name.starts_with(c::FILEHOST_SECTION_PREFIX) {
                continue;
            }
            let name = section_name[c::FILEHOST_SECTION_PREFIX.len()..].to_string();
            if name.is_empty() {
                return Err(Error::invalid_value("filehost section", section_name.as_str()));
            }
            let enabled = props
                .get("enabled")
                .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
                .unwrap_or(false);
            file_hosts.push(FileHostSettings {
                name,
                enabled,
                username: props.get("username").cloned().unwrap_or_default(),
                api_url: props.get("api_url").cloned().unwrap_or_default(),
            });
        }
        file_hosts.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(Config {
            upload,
            scanning,
            hooks,
            auth,
            auto_archive,
            file_hosts,
        })
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ini = Ini::new();

        ini.with_section(Some(c::UPLOAD_SECTION))
            .set("timeout", self.upload.timeout_secs.to_string())
            .set("retries", self.upload.max_retries.to_string())
            .set("batch_size", self.upload.parallel_batch_size.to_string())
            .set("thumbnail_size", self.upload.thumbnail_size.code().to_string())
            .set(
                "thumbnail_format",
                self.upload.thumbnail_format.code().to_string(),
            )
            .set(
                "public_gallery",
                if self.upload.public_gallery { "true" } else { "false" },
            );

        ini.with_section(Some(c::SCANNING_SECTION))
            .set("fast_scanning", bool_str(self.scanning.fast_scanning))
            .set(
                "sampling_method",
                match self.scanning.sampling_method {
                    SamplingMethod::FixedCount => "fixed_count",
                    SamplingMethod::Percentage => "percentage",
                },
            )
            .set(
                "sampling_fixed_count",
                self.scanning.sampling_fixed_count.to_string(),
            )
            .set(
                "sampling_percentage",
                self.scanning.sampling_percentage.to_string(),
            )
            .set("exclude_first", bool_str(self.scanning.exclude_first))
            .set("exclude_last", bool_str(self.scanning.exclude_last))
            .set(
                "exclude_small_images",
                bool_str(self.scanning.exclude_small_images),
            )
            .set("exclude_outliers", bool_str(self.scanning.exclude_outliers))
            .set(
                "exclude_small_threshold",
                self.scanning.exclude_small_threshold.to_string(),
            )
            .set("exclude_patterns", self.scanning.exclude_patterns.join(";"))
            .set(
                "average_method",
                match self.scanning.average_method {
                    AverageMethod::Mean => "mean",
                    AverageMethod::Median => "median",
                },
            );

        ini.with_section(Some(c::EXTERNAL_APPS_SECTION)).set(
            "parallel_execution",
            bool_str(self.hooks.parallel_execution),
        );
        for (event, hook) in [
            ("added", &self.hooks.added),
            ("started", &self.hooks.started),
            ("completed", &self.hooks.completed),
        ]
        .iter()
        {
            ini.with_section(Some(c::EXTERNAL_APPS_SECTION))
                .set(format!("hook_{}_enabled", event), bool_str(hook.enabled))
                .set(format!("hook_{}_command", event), hook.command.clone())
                .set(
                    format!("hook_{}_show_console", event),
                    bool_str(hook.show_console),
                )
                .set(format!("hook_{}_key1", event), hook.key_mapping[0].clone())
                .set(format!("hook_{}_key2", event), hook.key_mapping[1].clone())
                .set(format!("hook_{}_key3", event), hook.key_mapping[2].clone())
                .set(format!("hook_{}_key4", event), hook.key_mapping[3].clone());
        }

        ini.with_section(Some(c::AUTH_SECTION))
            .set("username", self.auth.username.clone());

        ini.with_section(Some(c::AUTO_ARCHIVE_SECTION))
            .set("enabled", bool_str(self.auto_archive.enabled))
            .set("check_minutes", self.auto_archive.check_minutes.to_string())
            .set(
                "archive_after_minutes",
                self.auto_archive.archive_after_minutes.to_string(),
            );

        for host in &self.file_hosts {
            ini.with_section(Some(format!("{}{}", c::FILEHOST_SECTION_PREFIX, host.name)))
                .set("enabled", bool_str(host.enabled))
                .set("username", host.username.clone())
                .set("api_url", host.api_url.clone());
        }

        let mut bytes: Vec<u8> = vec![];
        ini.write_to(&mut bytes).unwrap();
        let ini_str = str::from_utf8(&bytes).unwrap();
        write!(f, "{}", ini_str)
    }
}

fn bool_str(v: bool) -> &'static str {
    if v {
        "true"
    } else {
        "false"
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_ini_yields_defaults() {
        let config: Config = "".parse().unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn upload_section_is_parsed() {
        let config: Config = "[upload]\ntimeout = 45\nretries = 5\nbatch_size = 8\n"
            .parse()
            .unwrap();
        assert_eq!(config.upload.timeout_secs, 45);
        assert_eq!(config.upload.max_retries, 5);
        assert_eq!(config.upload.parallel_batch_size, 8);
    }

    #[test]
    fn invalid_integer_fails() {
        let config = "[upload]\nretries = lots\n".parse::<Config>();
        assert!(config.is_err());
    }

    #[test]
    fn invalid_thumbnail_code_fails() {
        let config = "[upload]\nthumbnail_size = 5\n".parse::<Config>();
        assert!(config.is_err());
    }

    #[test]
    fn hook_settings_are_parsed() {
        let raw = "[EXTERNAL_APPS]\n\
                   parallel_execution = false\n\
                   hook_completed_enabled = true\n\
                   hook_completed_command = notify %N\n\
                   hook_completed_key1 = download_url\n";
        let config: Config = raw.parse().unwrap();
        assert!(!config.hooks.parallel_execution);
        assert!(config.hooks.completed.enabled);
        assert_eq!(config.hooks.completed.command, "notify %N");
        assert_eq!(config.hooks.completed.key_mapping[0], "download_url");
        assert_eq!(config.hooks.completed.key_mapping[1], "ext2");
        assert!(!config.hooks.added.enabled);
    }

    #[test]
    fn filehost_sections_are_collected() {
        let raw = "[filehost:rapidgator]\nenabled = true\nusername = me\n\
                   [filehost:katfile]\nenabled = false\n";
        let config: Config = raw.parse().unwrap();
        assert_eq!(config.file_hosts.len(), 2);
        assert_eq!(config.file_hosts[1].name, "rapidgator");
        assert!(config.file_hosts[1].enabled);
        assert!(!config.file_hosts[0].enabled);
    }

    #[test]
    fn archive_check_minutes_are_clamped() {
        let config: Config = "[auto_archive]\ncheck_minutes = 1\n".parse().unwrap();
        assert_eq!(config.auto_archive.check_minutes, 5);
        let config: Config = "[auto_archive]\ncheck_minutes = 99999\n".parse().unwrap();
        assert_eq!(config.auto_archive.check_minutes, 1440);
    }

    #[test]
    fn write_then_parse_round_trips() {
        let mut config = Config::default();
        config.upload.max_retries = 7;
        config.auth.username = "someone".into();
        config.file_hosts.push(FileHostSettings {
            name: "rapidgator".into(),
            enabled: true,
            username: "me".into(),
            api_url: "https://rapidgator.example/api".into(),
        });
        let round_tripped: Config = config.to_string().parse().unwrap();
        assert_eq!(round_tripped, config);
    }
}

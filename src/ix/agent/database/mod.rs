//! The database layer that uses SQLite for persistence.
//!
//! Everything durable lives here: gallery records, per-host upload records,
//! tabs, the unnamed-gallery retry map, and the small stats table. The
//! in-memory queue state is rebuilt from `load_all_items` on startup.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::str::FromStr;
use std::{fmt, result};

use chrono::{DateTime, Utc};
use itertools::Itertools;
use log::*;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{OptionalExtension, Row, NO_PARAMS};

mod error;
pub mod writer;

pub use self::error::{Error, ErrorKind, Result};
pub use self::writer::StoreWriter;

use crate::ix::agent::config::constants as c;
use crate::ix::util::temporal;

/// Source used to configure which backing scheme to use for SQLite.
#[derive(Debug)]
pub enum Source {
    /// A file backed database.
    File(PathBuf),
}

/// States a gallery moves through, from folder drop to finished upload.
/// The string tokens are the durable representation.
#[derive(Copy, Debug, Clone, PartialEq, Eq, Hash)]
pub enum GalleryStatus {
    Validating,
    Scanning,
    Ready,
    Queued,
    Uploading,
    Paused,
    Incomplete,
    Completed,
    Failed,
    UploadFailed,
    ScanFailed,
}

impl GalleryStatus {
    /// Terminal for display purposes; only `Completed` is terminal for
    /// further work.
    pub fn is_terminal(self) -> bool {
        use self::GalleryStatus::*;
        match self {
            Completed | Failed | UploadFailed | ScanFailed => true,
            _ => false,
        }
    }

    /// States `start_item` accepts.
    pub fn is_startable(self) -> bool {
        use self::GalleryStatus::*;
        match self {
            Ready | Paused | Incomplete | UploadFailed => true,
            _ => false,
        }
    }
}

impl AsRef<str> for GalleryStatus {
    fn as_ref(&self) -> &str {
        use self::GalleryStatus::*;
        match *self {
            Validating => "validating",
            Scanning => "scanning",
            Ready => "ready",
            Queued => "queued",
            Uploading => "uploading",
            Paused => "paused",
            Incomplete => "incomplete",
            Completed => "completed",
            Failed => "failed",
            UploadFailed => "upload_failed",
            ScanFailed => "scan_failed",
        }
    }
}

impl From<GalleryStatus> for String {
    fn from(s: GalleryStatus) -> Self {
        s.as_ref().to_owned()
    }
}

impl FromStr for GalleryStatus {
    type Err = Error;

    fn from_str(s: &str) -> result::Result<Self, Self::Err> {
        use self::GalleryStatus::*;
        match s {
            "validating" => Ok(Validating),
            "scanning" => Ok(Scanning),
            "ready" => Ok(Ready),
            "queued" => Ok(Queued),
            "uploading" => Ok(Uploading),
            "paused" => Ok(Paused),
            "incomplete" => Ok(Incomplete),
            "completed" => Ok(Completed),
            "failed" => Ok(Failed),
            "upload_failed" => Ok(UploadFailed),
            "scan_failed" => Ok(ScanFailed),
            s => Err(Error::status(s)),
        }
    }
}

impl fmt::Display for GalleryStatus {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}", self.as_ref())
    }
}

/// The user-editable and hook-writable free-text fields on a gallery.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Field {
    Custom1,
    Custom2,
    Custom3,
    Custom4,
    Ext1,
    Ext2,
    Ext3,
    Ext4,
}

impl Field {
    pub fn column(self) -> &'static str {
        use self::Field::*;
        match self {
            Custom1 => "custom1",
            Custom2 => "custom2",
            Custom3 => "custom3",
            Custom4 => "custom4",
            Ext1 => "ext1",
            Ext2 => "ext2",
            Ext3 => "ext3",
            Ext4 => "ext4",
        }
    }

    /// Ext fields in order, for hook key mapping.
    pub fn ext_fields() -> [Field; 4] {
        [Field::Ext1, Field::Ext2, Field::Ext3, Field::Ext4]
    }
}

impl FromStr for Field {
    type Err = Error;

    fn from_str(s: &str) -> result::Result<Self, Self::Err> {
        use self::Field::*;
        match s {
            "custom1" => Ok(Custom1),
            "custom2" => Ok(Custom2),
            "custom3" => Ok(Custom3),
            "custom4" => Ok(Custom4),
            "ext1" => Ok(Ext1),
            "ext2" => Ok(Ext2),
            "ext3" => Ok(Ext3),
            "ext4" => Ok(Ext4),
            other => Err(Error::field(other)),
        }
    }
}

/// A gallery record: one folder of images treated as a single upload unit.
/// `path` is the in-memory primary key; `db_id` is assigned on first
/// persistence and referenced by per-host upload records.
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryRecord {
    pub db_id: Option<i64>,
    pub path: String,
    pub name: String,
    pub tab_name: String,
    pub template_name: String,
    pub status: GalleryStatus,
    pub progress: i32,
    pub total_images: i64,
    pub uploaded_images: i64,
    pub uploaded_bytes: i64,
    pub total_size: i64,
    pub avg_width: i64,
    pub avg_height: i64,
    pub scan_complete: bool,
    pub added_time: i64,
    pub start_time: i64,
    pub finished_time: i64,
    pub gallery_id: Option<String>,
    pub gallery_url: Option<String>,
    pub error_message: Option<String>,
    /// Basenames of images known uploaded; the durable record of progress.
    pub uploaded_files: BTreeSet<String>,
    /// Basenames of images whose upload exhausted its retries.
    pub failed_files: Vec<String>,
    pub insertion_order: i64,
    pub custom1: String,
    pub custom2: String,
    pub custom3: String,
    pub custom4: String,
    pub ext1: String,
    pub ext2: String,
    pub ext3: String,
    pub ext4: String,
    /// Latest "online/total" result of the image status checker.
    pub imx_status: Option<String>,
    pub imx_status_checked: i64,
    pub final_kibps: f64,
    pub current_kibps: f64,
}

impl GalleryRecord {
    pub fn new<P, N>(path: P, name: N) -> Self
    where
        P: Into<String>,
        N: Into<String>,
    {
        Self {
            db_id: None,
            path: path.into(),
            name: name.into(),
            tab_name: c::MAIN_TAB.to_string(),
            template_name: c::DEFAULT_TEMPLATE_NAME.to_string(),
            status: GalleryStatus::Validating,
            progress: 0,
            total_images: 0,
            uploaded_images: 0,
            uploaded_bytes: 0,
            total_size: 0,
            avg_width: 0,
            avg_height: 0,
            scan_complete: false,
            added_time: temporal::epoch_secs(),
            start_time: 0,
            finished_time: 0,
            gallery_id: None,
            gallery_url: None,
            error_message: None,
            uploaded_files: BTreeSet::new(),
            failed_files: vec![],
            insertion_order: 0,
            custom1: String::new(),
            custom2: String::new(),
            custom3: String::new(),
            custom4: String::new(),
            ext1: String::new(),
            ext2: String::new(),
            ext3: String::new(),
            ext4: String::new(),
            imx_status: None,
            imx_status_checked: 0,
            final_kibps: 0.0,
            current_kibps: 0.0,
        }
    }

    pub fn field(&self, field: Field) -> &str {
        use self::Field::*;
        match field {
            Custom1 => &self.custom1,
            Custom2 => &self.custom2,
            Custom3 => &self.custom3,
            Custom4 => &self.custom4,
            Ext1 => &self.ext1,
            Ext2 => &self.ext2,
            Ext3 => &self.ext3,
            Ext4 => &self.ext4,
        }
    }

    pub fn set_field(&mut self, field: Field, value: String) {
        use self::Field::*;
        match field {
            Custom1 => self.custom1 = value,
            Custom2 => self.custom2 = value,
            Custom3 => self.custom3 = value,
            Custom4 => self.custom4 = value,
            Ext1 => self.ext1 = value,
            Ext2 => self.ext2 = value,
            Ext3 => self.ext3 = value,
            Ext4 => self.ext4 = value,
        }
    }

    /// Basename of the gallery folder, the initial display name.
    pub fn folder_basename(path: &str) -> String {
        std::path::Path::new(path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(path)
            .to_string()
    }

    // private - used only in this module
    fn from_row(row: &Row<'_, '_>) -> Result<Self> {
        let status: String = row.get(5);
        let status: GalleryStatus = status.parse()?;
        let uploaded_files: String = row.get(20);
        let uploaded_files: BTreeSet<String> = serde_json::from_str(&uploaded_files)?;
        let failed_files: String = row.get(21);
        let failed_files: Vec<String> = serde_json::from_str(&failed_files)?;

        Ok(Self {
            db_id: Some(row.get(0)),
            path: row.get(1),
            name: row.get(2),
            tab_name: row.get(3),
            template_name: row.get(4),
            status,
            progress: row.get(6),
            total_images: row.get(7),
            uploaded_images: row.get(8),
            uploaded_bytes: row.get(9),
            total_size: row.get(10),
            avg_width: row.get(11),
            avg_height: row.get(12),
            scan_complete: row.get(13),
            added_time: row.get(14),
            start_time: row.get(15),
            finished_time: row.get(16),
            gallery_id: row.get(17),
            gallery_url: row.get(18),
            error_message: row.get(19),
            uploaded_files,
            failed_files,
            insertion_order: row.get(22),
            custom1: row.get(23),
            custom2: row.get(24),
            custom3: row.get(25),
            custom4: row.get(26),
            ext1: row.get(27),
            ext2: row.get(28),
            ext3: row.get(29),
            ext4: row.get(30),
            imx_status: row.get(31),
            imx_status_checked: row.get(32),
            final_kibps: row.get(33),
            current_kibps: row.get(34),
        })
    }
}

const GALLERY_COLUMNS: &str = "id,
             path,
             name,
             tab_name,
             template_name,
             status,
             progress,
             total_images,
             uploaded_images,
             uploaded_bytes,
             total_size,
             avg_width,
             avg_height,
             scan_complete,
             added_time,
             start_time,
             finished_time,
             gallery_id,
             gallery_url,
             error_message,
             uploaded_files,
             failed_files,
             insertion_order,
             custom1, custom2, custom3, custom4,
             ext1, ext2, ext3, ext4,
             imx_status,
             imx_status_checked,
             final_kibps,
             current_kibps";

/// States for per-host upload records.
#[derive(Copy, Debug, Clone, PartialEq, Eq, Hash)]
pub enum FileHostStatus {
    NotUploaded,
    Pending,
    Uploading,
    Completed,
    Failed,
}

impl AsRef<str> for FileHostStatus {
    fn as_ref(&self) -> &str {
        use self::FileHostStatus::*;
        match *self {
            NotUploaded => "not_uploaded",
            Pending => "pending",
            Uploading => "uploading",
            Completed => "completed",
            Failed => "failed",
        }
    }
}

impl From<FileHostStatus> for String {
    fn from(s: FileHostStatus) -> Self {
        s.as_ref().to_owned()
    }
}

impl FromStr for FileHostStatus {
    type Err = Error;

    fn from_str(s: &str) -> result::Result<Self, Self::Err> {
        use self::FileHostStatus::*;
        match s {
            "not_uploaded" => Ok(NotUploaded),
            "pending" => Ok(Pending),
            "uploading" => Ok(Uploading),
            "completed" => Ok(Completed),
            "failed" => Ok(Failed),
            s => Err(Error::status(s)),
        }
    }
}

impl fmt::Display for FileHostStatus {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}", self.as_ref())
    }
}

/// One gallery's upload to one file host.
#[derive(Debug, Clone, PartialEq)]
pub struct FileHostUpload {
    pub id: Option<i64>,
    pub gallery_db_id: i64,
    pub host_name: String,
    pub status: FileHostStatus,
    pub uploaded_bytes: i64,
    pub total_bytes: i64,
    pub download_url: Option<String>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl FileHostUpload {
    pub fn new<H: Into<String>>(gallery_db_id: i64, host_name: H) -> Self {
        Self {
            id: None,
            gallery_db_id,
            host_name: host_name.into(),
            status: FileHostStatus::NotUploaded,
            uploaded_bytes: 0,
            total_bytes: 0,
            download_url: None,
            error: None,
            updated_at: Utc::now(),
        }
    }

    // private - used only in this module
    fn from_row(row: &Row<'_, '_>) -> Result<Self> {
        let status: String = row.get(3);
        Ok(Self {
            id: Some(row.get(0)),
            gallery_db_id: row.get(1),
            host_name: row.get(2),
            status: status.parse()?,
            uploaded_bytes: row.get(4),
            total_bytes: row.get(5),
            download_url: row.get(6),
            error: row.get(7),
            updated_at: row.get(8),
        })
    }
}

const FILE_HOST_COLUMNS: &str = "id,
             gallery_db_id,
             host_name,
             status,
             uploaded_bytes,
             total_bytes,
             download_url,
             error,
             updated_at";

/// Tabs are named display buckets; `Main` and `Archive` always exist.
#[derive(Copy, Debug, Clone, PartialEq, Eq, Hash)]
pub enum TabType {
    System,
    User,
}

impl AsRef<str> for TabType {
    fn as_ref(&self) -> &str {
        match *self {
            TabType::System => "system",
            TabType::User => "user",
        }
    }
}

impl FromStr for TabType {
    type Err = Error;

    fn from_str(s: &str) -> result::Result<Self, Self::Err> {
        match s {
            "system" => Ok(TabType::System),
            "user" => Ok(TabType::User),
            s => Err(Error::tab_type(s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TabRecord {
    pub id: Option<i64>,
    pub name: String,
    pub display_order: i64,
    pub color_hint: Option<String>,
    pub tab_type: TabType,
}

impl TabRecord {
    // private - used only in this module
    fn from_row(row: &Row<'_, '_>) -> Result<Self> {
        let tab_type: String = row.get(4);
        Ok(Self {
            id: Some(row.get(0)),
            name: row.get(1),
            display_order: row.get(2),
            color_hint: row.get(3),
            tab_type: tab_type.parse()?,
        })
    }
}

/// A type that contains a pool of SQLite connections.
/// Calling `.clone()` is the supported way to share access to the
/// underlying pool across workers.
#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Database {{ pool: {:?} }}", self.pool.state())
    }
}

impl Database {
    /// Creates a new database based on the provided source.
    pub fn new(source: &Source) -> Result<Database> {
        let manager = match *source {
            Source::File(ref path) => SqliteConnectionManager::file(path),
        };
        let pool = Pool::new(manager)?;
        let database = Database { pool };

        database.setup()?;
        Ok(database)
    }

    // Creates the database tables based on `CREATE TABLE IF NOT EXISTS` logic.
    fn setup(&self) -> Result<usize> {
        let conn = self.pool.get()?;

        let mut count = conn.execute(
            "CREATE TABLE IF NOT EXISTS galleries (
                id INTEGER PRIMARY KEY,
                path TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                tab_name TEXT NOT NULL,
                template_name TEXT NOT NULL,
                status VARCHAR(32) NOT NULL,
                progress INTEGER NOT NULL,
                total_images INTEGER NOT NULL,
                uploaded_images INTEGER NOT NULL,
                uploaded_bytes INTEGER NOT NULL,
                total_size INTEGER NOT NULL,
                avg_width INTEGER NOT NULL,
                avg_height INTEGER NOT NULL,
                scan_complete BOOLEAN NOT NULL,
                added_time INTEGER NOT NULL,
                start_time INTEGER NOT NULL,
                finished_time INTEGER NOT NULL,
                gallery_id VARCHAR(64),
                gallery_url TEXT,
                error_message TEXT,
                uploaded_files TEXT NOT NULL,
                failed_files TEXT NOT NULL,
                insertion_order INTEGER NOT NULL,
                custom1 TEXT NOT NULL, custom2 TEXT NOT NULL,
                custom3 TEXT NOT NULL, custom4 TEXT NOT NULL,
                ext1 TEXT NOT NULL, ext2 TEXT NOT NULL,
                ext3 TEXT NOT NULL, ext4 TEXT NOT NULL,
                imx_status TEXT,
                imx_status_checked INTEGER NOT NULL,
                final_kibps REAL NOT NULL,
                current_kibps REAL NOT NULL
            )",
            NO_PARAMS,
        )?;
        count += conn.execute(
            "CREATE INDEX IF NOT EXISTS galleries_i1 ON galleries (status)",
            NO_PARAMS,
        )?;
        count += conn.execute(
            "CREATE INDEX IF NOT EXISTS galleries_i2 ON galleries (tab_name)",
            NO_PARAMS,
        )?;
        count += conn.execute(
            "CREATE TABLE IF NOT EXISTS file_host_uploads (
                id INTEGER PRIMARY KEY,
                gallery_db_id INTEGER NOT NULL,
                host_name VARCHAR(64) NOT NULL,
                status VARCHAR(32) NOT NULL,
                uploaded_bytes INTEGER NOT NULL,
                total_bytes INTEGER NOT NULL,
                download_url TEXT,
                error TEXT,
                updated_at VARCHAR(255) NOT NULL,
                UNIQUE (gallery_db_id, host_name)
            )",
            NO_PARAMS,
        )?;
        count += conn.execute(
            "CREATE INDEX IF NOT EXISTS file_host_uploads_i1
             ON file_host_uploads (host_name, status, updated_at)",
            NO_PARAMS,
        )?;
        count += conn.execute(
            "CREATE TABLE IF NOT EXISTS tabs (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                display_order INTEGER NOT NULL,
                color_hint TEXT,
                tab_type VARCHAR(16) NOT NULL
            )",
            NO_PARAMS,
        )?;
        count += conn.execute(
            "CREATE TABLE IF NOT EXISTS unnamed_galleries (
                gallery_id VARCHAR(64) PRIMARY KEY,
                name TEXT NOT NULL
            )",
            NO_PARAMS,
        )?;
        count += conn.execute(
            "CREATE TABLE IF NOT EXISTS stats (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            NO_PARAMS,
        )?;

        Ok(count as usize)
    }

    // ----------
    // start of galleries table functions
    // ----------

    /// Restores every gallery record. Records caught mid-upload by a dirty
    /// shutdown are normalized back to `ready` before they are read; the
    /// engine never spontaneously restarts them.
    pub fn load_all_items(&self) -> Result<Vec<GalleryRecord>> {
        let conn = self.pool.get()?;

        let normalized = conn.execute(
            "UPDATE galleries SET status = 'ready' WHERE status = 'uploading'",
            NO_PARAMS,
        )?;
        if normalized > 0 {
            warn!(
                "Normalized {} interrupted upload(s) back to 'ready'",
                normalized
            );
        }

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM galleries ORDER BY insertion_order, id",
            GALLERY_COLUMNS
        ))?;
        let records = stmt
            .query_and_then_named(&[], GalleryRecord::from_row)?
            .collect::<Result<Vec<_>>>()?;

        Ok(records)
    }

    /// Inserts a brand-new gallery record, assigning its `db_id`.
    pub fn insert_item(&self, record: &mut GalleryRecord) -> Result<i64> {
        let conn = self.pool.get()?;
        Self::insert_item_on(&conn, record)
    }

    fn insert_item_on(conn: &rusqlite::Connection, record: &mut GalleryRecord) -> Result<i64> {
        let uploaded_files = serde_json::to_string(&record.uploaded_files)?;
        let failed_files = serde_json::to_string(&record.failed_files)?;
        let mut stmt = conn.prepare(
            "INSERT INTO galleries (path, name, tab_name, template_name, status, progress,
                total_images, uploaded_images, uploaded_bytes, total_size,
                avg_width, avg_height, scan_complete,
                added_time, start_time, finished_time,
                gallery_id, gallery_url, error_message,
                uploaded_files, failed_files, insertion_order,
                custom1, custom2, custom3, custom4,
                ext1, ext2, ext3, ext4,
                imx_status, imx_status_checked, final_kibps, current_kibps)
             VALUES (:path, :name, :tab_name, :template_name, :status, :progress,
                :total_images, :uploaded_images, :uploaded_bytes, :total_size,
                :avg_width, :avg_height, :scan_complete,
                :added_time, :start_time, :finished_time,
                :gallery_id, :gallery_url, :error_message,
                :uploaded_files, :failed_files, :insertion_order,
                :custom1, :custom2, :custom3, :custom4,
                :ext1, :ext2, :ext3, :ext4,
                :imx_status, :imx_status_checked, :final_kibps, :current_kibps)",
        )?;
        stmt.execute_named(&[
            (":path", &record.path),
            (":name", &record.name),
            (":tab_name", &record.tab_name),
            (":template_name", &record.template_name),
            (":status", &Into::<String>::into(record.status)),
            (":progress", &record.progress),
            (":total_images", &record.total_images),
            (":uploaded_images", &record.uploaded_images),
            (":uploaded_bytes", &record.uploaded_bytes),
            (":total_size", &record.total_size),
            (":avg_width", &record.avg_width),
            (":avg_height", &record.avg_height),
            (":scan_complete", &record.scan_complete),
            (":added_time", &record.added_time),
            (":start_time", &record.start_time),
            (":finished_time", &record.finished_time),
            (":gallery_id", &record.gallery_id),
            (":gallery_url", &record.gallery_url),
            (":error_message", &record.error_message),
            (":uploaded_files", &uploaded_files),
            (":failed_files", &failed_files),
            (":insertion_order", &record.insertion_order),
            (":custom1", &record.custom1),
            (":custom2", &record.custom2),
            (":custom3", &record.custom3),
            (":custom4", &record.custom4),
            (":ext1", &record.ext1),
            (":ext2", &record.ext2),
            (":ext3", &record.ext3),
            (":ext4", &record.ext4),
            (":imx_status", &record.imx_status),
            (":imx_status_checked", &record.imx_status_checked),
            (":final_kibps", &record.final_kibps),
            (":current_kibps", &record.current_kibps),
        ])?;
        let id = conn.last_insert_rowid();
        record.db_id = Some(id);
        Ok(id)
    }

    fn update_item_on(conn: &rusqlite::Connection, record: &GalleryRecord, id: i64) -> Result<usize> {
        let uploaded_files = serde_json::to_string(&record.uploaded_files)?;
        let failed_files = serde_json::to_string(&record.failed_files)?;
        let mut stmt = conn.prepare(
            "UPDATE galleries SET
                path = :path, name = :name, tab_name = :tab_name,
                template_name = :template_name, status = :status,
                progress = :progress, total_images = :total_images,
                uploaded_images = :uploaded_images,
                uploaded_bytes = :uploaded_bytes, total_size = :total_size,
                avg_width = :avg_width, avg_height = :avg_height,
                scan_complete = :scan_complete, added_time = :added_time,
                start_time = :start_time, finished_time = :finished_time,
                gallery_id = :gallery_id, gallery_url = :gallery_url,
                error_message = :error_message,
                uploaded_files = :uploaded_files, failed_files = :failed_files,
                insertion_order = :insertion_order,
                custom1 = :custom1, custom2 = :custom2,
                custom3 = :custom3, custom4 = :custom4,
                ext1 = :ext1, ext2 = :ext2, ext3 = :ext3, ext4 = :ext4,
                imx_status = :imx_status,
                imx_status_checked = :imx_status_checked,
                final_kibps = :final_kibps, current_kibps = :current_kibps
             WHERE id = :id",
        )?;
        stmt.execute_named(&[
            (":id", &id),
            (":path", &record.path),
            (":name", &record.name),
            (":tab_name", &record.tab_name),
            (":template_name", &record.template_name),
            (":status", &Into::<String>::into(record.status)),
            (":progress", &record.progress),
            (":total_images", &record.total_images),
            (":uploaded_images", &record.uploaded_images),
            (":uploaded_bytes", &record.uploaded_bytes),
            (":total_size", &record.total_size),
            (":avg_width", &record.avg_width),
            (":avg_height", &record.avg_height),
            (":scan_complete", &record.scan_complete),
            (":added_time", &record.added_time),
            (":start_time", &record.start_time),
            (":finished_time", &record.finished_time),
            (":gallery_id", &record.gallery_id),
            (":gallery_url", &record.gallery_url),
            (":error_message", &record.error_message),
            (":uploaded_files", &uploaded_files),
            (":failed_files", &failed_files),
            (":insertion_order", &record.insertion_order),
            (":custom1", &record.custom1),
            (":custom2", &record.custom2),
            (":custom3", &record.custom3),
            (":custom4", &record.custom4),
            (":ext1", &record.ext1),
            (":ext2", &record.ext2),
            (":ext3", &record.ext3),
            (":ext4", &record.ext4),
            (":imx_status", &record.imx_status),
            (":imx_status_checked", &record.imx_status_checked),
            (":final_kibps", &record.final_kibps),
            (":current_kibps", &record.current_kibps),
        ])
        .map_err(Into::into)
    }

    /// Writes a batch of gallery snapshots in a single transaction: either
    /// every record lands or none do. Records without a `db_id` are matched
    /// by path, or inserted when new.
    pub fn bulk_upsert(&self, records: &[GalleryRecord]) -> Result<usize> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let mut written = 0;
        for record in records {
            let id: Option<i64> = match record.db_id {
                Some(id) => Some(id),
                None => tx
                    .query_row(
                        "SELECT id FROM galleries WHERE path = ?",
                        &[&record.path as &dyn rusqlite::types::ToSql],
                        |row| row.get(0),
                    )
                    .optional()?,
            };
            match id {
                Some(id) => {
                    written += Self::update_item_on(&tx, record, id)?;
                }
                None => {
                    let mut cloned = record.clone();
                    Self::insert_item_on(&tx, &mut cloned)?;
                    written += 1;
                }
            }
        }
        tx.commit()?;
        Ok(written)
    }

    /// Deletes gallery records (and their per-host upload records) by path.
    pub fn delete_by_paths(&self, paths: &[String]) -> Result<usize> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let mut removed = 0;
        for path in paths {
            tx.execute_named(
                "DELETE FROM file_host_uploads WHERE gallery_db_id IN
                     (SELECT id FROM galleries WHERE path = :path)",
                &[(":path", path)],
            )?;
            removed += tx.execute_named(
                "DELETE FROM galleries WHERE path = :path",
                &[(":path", path)],
            )?;
        }
        tx.commit()?;
        Ok(removed)
    }

    /// Returns the gallery record for the given path, if present.
    pub fn get_item_by_path(&self, path: &str) -> Result<Option<GalleryRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM galleries WHERE path = :path",
            GALLERY_COLUMNS
        ))?;
        let mut rows = stmt.query_and_then_named(&[(":path", &path)], GalleryRecord::from_row)?;
        rows.next().map_or(Ok(None), |r| r.map(Some))
    }

    /// Returns the gallery record with the given row id, if present.
    pub fn get_item_by_db_id(&self, db_id: i64) -> Result<Option<GalleryRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM galleries WHERE id = :id",
            GALLERY_COLUMNS
        ))?;
        let mut rows = stmt.query_and_then_named(&[(":id", &db_id)], GalleryRecord::from_row)?;
        rows.next().map_or(Ok(None), |r| r.map(Some))
    }

    /// Writes a single custom/ext field immediately.
    pub fn update_item_custom_field(&self, path: &str, field: Field, value: &str) -> Result<usize> {
        let conn = self.pool.get()?;
        let sql = format!(
            "UPDATE galleries SET {column} = :value WHERE path = :path",
            column = field.column()
        );
        let mut stmt = conn.prepare(&sql)?;
        stmt.execute_named(&[(":path", &path), (":value", &value)])
            .map_err(Into::into)
    }

    // ----------
    // start of file_host_uploads table functions
    // ----------

    /// Inserts or replaces the record for `(gallery_db_id, host_name)`.
    pub fn upsert_file_host_upload(&self, record: &FileHostUpload) -> Result<usize> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "INSERT OR REPLACE INTO file_host_uploads
                (gallery_db_id, host_name, status, uploaded_bytes, total_bytes,
                 download_url, error, updated_at)
             VALUES (:gallery_db_id, :host_name, :status, :uploaded_bytes,
                 :total_bytes, :download_url, :error, :updated_at)",
        )?;
        stmt.execute_named(&[
            (":gallery_db_id", &record.gallery_db_id),
            (":host_name", &record.host_name),
            (":status", &Into::<String>::into(record.status)),
            (":uploaded_bytes", &record.uploaded_bytes),
            (":total_bytes", &record.total_bytes),
            (":download_url", &record.download_url),
            (":error", &record.error),
            (":updated_at", &record.updated_at),
        ])
        .map_err(Into::into)
    }

    /// All per-host records for one gallery.
    pub fn get_file_host_uploads(&self, gallery_db_id: i64) -> Result<Vec<FileHostUpload>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM file_host_uploads WHERE gallery_db_id = :id",
            FILE_HOST_COLUMNS
        ))?;
        let records = stmt
            .query_and_then_named(&[(":id", &gallery_db_id)], FileHostUpload::from_row)?
            .collect::<Result<Vec<_>>>();
        records
    }

    /// Every per-host record, grouped by gallery, for bulk UI refreshes.
    pub fn get_all_file_host_uploads_batch(&self) -> Result<HashMap<i64, Vec<FileHostUpload>>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM file_host_uploads ORDER BY gallery_db_id",
            FILE_HOST_COLUMNS
        ))?;
        let records = stmt
            .query_and_then_named(&[], FileHostUpload::from_row)?
            .collect::<Result<Vec<_>>>()?;
        Ok(records
            .into_iter()
            .map(|record| (record.gallery_db_id, record))
            .into_group_map())
    }

    /// Pending uploads for one host, oldest first.
    pub fn get_pending_file_host_uploads(&self, host: &str) -> Result<Vec<FileHostUpload>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM file_host_uploads
             WHERE host_name = :host AND status = 'pending'
             ORDER BY updated_at",
            FILE_HOST_COLUMNS
        ))?;
        let records = stmt
            .query_and_then_named(&[(":host", &host)], FileHostUpload::from_row)?
            .collect::<Result<Vec<_>>>();
        records
    }

    /// Pending count and byte total for one host.
    pub fn get_file_host_pending_stats(&self, host: &str) -> Result<(i64, i64)> {
        let conn = self.pool.get()?;
        conn.query_row_and_then(
            "SELECT COUNT(*), COALESCE(SUM(total_bytes), 0)
             FROM file_host_uploads
             WHERE host_name = ? AND status = 'pending'",
            &[&host as &dyn rusqlite::types::ToSql],
            |row| Ok((row.get(0), row.get(1))),
        )
    }

    // ----------
    // start of tabs table functions
    // ----------

    /// Seeds the two system tabs. Idempotent.
    pub fn initialize_default_tabs(&self) -> Result<()> {
        let conn = self.pool.get()?;
        for (order, name) in [c::MAIN_TAB, c::ARCHIVE_TAB].iter().enumerate() {
            conn.execute_named(
                "INSERT OR IGNORE INTO tabs (name, display_order, color_hint, tab_type)
                 VALUES (:name, :display_order, NULL, 'system')",
                &[(":name", name), (":display_order", &(order as i64))],
            )?;
        }
        Ok(())
    }

    pub fn get_tabs(&self) -> Result<Vec<TabRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, display_order, color_hint, tab_type
             FROM tabs ORDER BY display_order, id",
        )?;
        let records = stmt
            .query_and_then_named(&[], TabRecord::from_row)?
            .collect::<Result<Vec<_>>>();
        records
    }

    pub fn create_tab(&self, name: &str, color_hint: Option<&str>) -> Result<()> {
        let conn = self.pool.get()?;
        let next_order: i64 = conn.query_row(
            "SELECT COALESCE(MAX(display_order), 0) + 1 FROM tabs",
            NO_PARAMS,
            |row| row.get(0),
        )?;
        conn.execute_named(
            "INSERT INTO tabs (name, display_order, color_hint, tab_type)
             VALUES (:name, :display_order, :color_hint, 'user')",
            &[
                (":name", &name),
                (":display_order", &next_order),
                (":color_hint", &color_hint),
            ],
        )?;
        Ok(())
    }

    /// Renames a user tab, carrying its galleries along. System tabs are
    /// refused.
    pub fn rename_tab(&self, old_name: &str, new_name: &str) -> Result<()> {
        if old_name == c::MAIN_TAB || old_name == c::ARCHIVE_TAB {
            return Err(Error::system_tab(old_name));
        }
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        tx.execute_named(
            "UPDATE tabs SET name = :new WHERE name = :old AND tab_type = 'user'",
            &[(":new", &new_name), (":old", &old_name)],
        )?;
        tx.execute_named(
            "UPDATE galleries SET tab_name = :new WHERE tab_name = :old",
            &[(":new", &new_name), (":old", &old_name)],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Deletes a user tab; its galleries fall back to `Main`. System tabs
    /// are refused.
    pub fn delete_tab(&self, name: &str) -> Result<()> {
        if name == c::MAIN_TAB || name == c::ARCHIVE_TAB {
            return Err(Error::system_tab(name));
        }
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        tx.execute_named(
            "UPDATE galleries SET tab_name = :main WHERE tab_name = :name",
            &[(":main", &c::MAIN_TAB), (":name", &name)],
        )?;
        tx.execute_named(
            "DELETE FROM tabs WHERE name = :name AND tab_type = 'user'",
            &[(":name", &name)],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Moves the given galleries to the named tab.
    pub fn move_galleries_to_tab(&self, paths: &[String], tab: &str) -> Result<usize> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let mut moved = 0;
        for path in paths {
            moved += tx.execute_named(
                "UPDATE galleries SET tab_name = :tab WHERE path = :path",
                &[(":tab", &tab), (":path", path)],
            )?;
        }
        tx.commit()?;
        Ok(moved)
    }

    // ----------
    // start of unnamed_galleries table functions
    // ----------

    /// Remembers a gallery created on the host whose rename has not yet
    /// succeeded. The rename worker drains this on startup.
    pub fn save_unnamed_gallery(&self, gallery_id: &str, name: &str) -> Result<usize> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "INSERT OR REPLACE INTO unnamed_galleries (gallery_id, name)
             VALUES (:gallery_id, :name)",
        )?;
        stmt.execute_named(&[(":gallery_id", &gallery_id), (":name", &name)])
            .map_err(Into::into)
    }

    pub fn remove_unnamed_gallery(&self, gallery_id: &str) -> Result<usize> {
        let conn = self.pool.get()?;
        conn.execute_named(
            "DELETE FROM unnamed_galleries WHERE gallery_id = :gallery_id",
            &[(":gallery_id", &gallery_id)],
        )
        .map_err(Into::into)
    }

    pub fn get_unnamed_galleries(&self) -> Result<Vec<(String, String)>> {
        let conn = self.pool.get()?;
        let mut stmt =
            conn.prepare("SELECT gallery_id, name FROM unnamed_galleries ORDER BY gallery_id")?;
        let rows = stmt.query_and_then_named(&[], |row: &Row<'_, '_>| -> Result<(String, String)> {
            Ok((row.get(0), row.get(1)))
        })?;
        rows.collect()
    }

    // ----------
    // start of stats table functions
    // ----------

    pub fn get_stat(&self, key: &str) -> Result<Option<String>> {
        let conn = self.pool.get()?;
        conn.query_row_named(
            "SELECT value FROM stats WHERE key = :key",
            &[(":key", &key)],
            |row| row.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn set_stat(&self, key: &str, value: &str) -> Result<usize> {
        let conn = self.pool.get()?;
        let mut stmt =
            conn.prepare("INSERT OR REPLACE INTO stats (key, value) VALUES (:key, :value)")?;
        stmt.execute_named(&[(":key", &key), (":value", &value)])
            .map_err(Into::into)
    }

    pub fn get_stat_f64(&self, key: &str) -> Result<f64> {
        Ok(self
            .get_stat(key)?
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.0))
    }

    pub fn get_stat_i64(&self, key: &str) -> Result<i64> {
        Ok(self
            .get_stat(key)?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0))
    }

    /// Accumulates the lifetime totals recorded when a gallery completes.
    pub fn record_gallery_completed(&self, images: i64, bytes: i64) -> Result<()> {
        let totals = [
            ("total_galleries", 1),
            ("total_images", images),
            ("total_size_bytes", bytes),
        ];
        for (key, delta) in totals.iter() {
            let current = self.get_stat_i64(key)?;
            self.set_stat(key, &(current + delta).to_string())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ix::util;

    fn record(path: &str) -> GalleryRecord {
        let mut r = GalleryRecord::new(path, GalleryRecord::folder_basename(path));
        r.total_images = 3;
        r.total_size = 3072;
        r
    }

    #[test]
    fn insert_assigns_db_id() {
        let db = util::database::temp().unwrap();
        let mut r = record("/g/alpha");
        let id = db.insert_item(&mut r).unwrap();
        assert_eq!(r.db_id, Some(id));
    }

    #[test]
    fn round_trip_preserves_every_field() {
        let db = util::database::temp().unwrap();
        let mut r = record("/g/alpha");
        r.status = GalleryStatus::Completed;
        r.progress = 100;
        r.uploaded_images = 3;
        r.gallery_id = Some("abc123".into());
        r.gallery_url = Some("https://imx.to/g/abc123".into());
        r.uploaded_files.insert("a.jpg".into());
        r.uploaded_files.insert("b.jpg".into());
        r.failed_files.push("c.jpg".into());
        r.custom2 = "tagged".into();
        r.ext4 = "hooked".into();
        r.imx_status = Some("2/3".into());
        r.final_kibps = 512.25;
        db.insert_item(&mut r).unwrap();

        let loaded = db.load_all_items().unwrap();
        assert_eq!(loaded, vec![r]);
    }

    #[test]
    fn load_normalizes_uploading_to_ready() {
        let db = util::database::temp().unwrap();
        let mut r = record("/g/alpha");
        r.status = GalleryStatus::Uploading;
        r.uploaded_images = 4;
        db.insert_item(&mut r).unwrap();

        let loaded = db.load_all_items().unwrap();
        assert_eq!(loaded[0].status, GalleryStatus::Ready);
        assert_eq!(loaded[0].uploaded_images, 4);
    }

    #[test]
    fn bulk_upsert_inserts_and_updates() {
        let db = util::database::temp().unwrap();
        let mut a = record("/g/a");
        db.insert_item(&mut a).unwrap();
        a.name = "renamed".into();
        let b = record("/g/b");

        db.bulk_upsert(&[a.clone(), b.clone()]).unwrap();
        let loaded = db.load_all_items().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].name, "renamed");
        assert_eq!(loaded[1].path, "/g/b");
    }

    #[test]
    fn delete_by_paths_removes_host_records_too() {
        let db = util::database::temp().unwrap();
        let mut a = record("/g/a");
        let id = db.insert_item(&mut a).unwrap();
        db.upsert_file_host_upload(&FileHostUpload::new(id, "rapidgator"))
            .unwrap();

        assert_eq!(db.delete_by_paths(&["/g/a".to_string()]).unwrap(), 1);
        assert!(db.load_all_items().unwrap().is_empty());
        assert!(db.get_file_host_uploads(id).unwrap().is_empty());
    }

    #[test]
    fn custom_field_update_is_immediate() {
        let db = util::database::temp().unwrap();
        let mut a = record("/g/a");
        db.insert_item(&mut a).unwrap();
        db.update_item_custom_field("/g/a", Field::Custom3, "v3")
            .unwrap();
        let loaded = db.get_item_by_path("/g/a").unwrap().unwrap();
        assert_eq!(loaded.custom3, "v3");
    }

    #[test]
    fn unknown_field_token_is_rejected() {
        assert!("custom5".parse::<Field>().is_err());
        assert!("ext0".parse::<Field>().is_err());
        assert_eq!("ext2".parse::<Field>().unwrap(), Field::Ext2);
    }

    #[test]
    fn pending_file_host_uploads_are_fifo() {
        let db = util::database::temp().unwrap();
        let mut a = record("/g/a");
        let mut b = record("/g/b");
        let id_a = db.insert_item(&mut a).unwrap();
        let id_b = db.insert_item(&mut b).unwrap();

        let mut first = FileHostUpload::new(id_a, "rapidgator");
        first.status = FileHostStatus::Pending;
        first.updated_at = Utc::now() - chrono::Duration::seconds(30);
        let mut second = FileHostUpload::new(id_b, "rapidgator");
        second.status = FileHostStatus::Pending;
        db.upsert_file_host_upload(&second).unwrap();
        db.upsert_file_host_upload(&first).unwrap();

        let pending = db.get_pending_file_host_uploads("rapidgator").unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].gallery_db_id, id_a);

        let (count, _) = db.get_file_host_pending_stats("rapidgator").unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn default_tabs_always_exist() {
        let db = util::database::temp().unwrap();
        db.initialize_default_tabs().unwrap();
        db.initialize_default_tabs().unwrap();
        let tabs = db.get_tabs().unwrap();
        assert_eq!(tabs.len(), 2);
        assert_eq!(tabs[0].name, "Main");
        assert_eq!(tabs[1].name, "Archive");
        assert_eq!(tabs[0].tab_type, TabType::System);
    }

    #[test]
    fn system_tabs_cannot_be_deleted() {
        let db = util::database::temp().unwrap();
        db.initialize_default_tabs().unwrap();
        assert!(db.delete_tab("Main").is_err());
    }

    #[test]
    fn renaming_a_user_tab_carries_its_galleries() {
        let db = util::database::temp().unwrap();
        db.initialize_default_tabs().unwrap();
        db.create_tab("Comics", None).unwrap();
        let mut a = record("/g/a");
        a.tab_name = "Comics".into();
        db.insert_item(&mut a).unwrap();

        db.rename_tab("Comics", "Manga").unwrap();
        assert_eq!(db.get_item_by_path("/g/a").unwrap().unwrap().tab_name, "Manga");
        assert!(db.get_tabs().unwrap().iter().any(|t| t.name == "Manga"));
        assert!(db.rename_tab("Main", "Else").is_err());
    }

    #[test]
    fn deleting_user_tab_moves_galleries_to_main() {
        let db = util::database::temp().unwrap();
        db.initialize_default_tabs().unwrap();
        db.create_tab("Comics", None).unwrap();
        let mut a = record("/g/a");
        a.tab_name = "Comics".into();
        db.insert_item(&mut a).unwrap();

        db.delete_tab("Comics").unwrap();
        let loaded = db.get_item_by_path("/g/a").unwrap().unwrap();
        assert_eq!(loaded.tab_name, "Main");
    }

    #[test]
    fn galleries_move_between_tabs() {
        let db = util::database::temp().unwrap();
        db.initialize_default_tabs().unwrap();
        let mut a = record("/g/a");
        let mut b = record("/g/b");
        db.insert_item(&mut a).unwrap();
        db.insert_item(&mut b).unwrap();

        let moved = db
            .move_galleries_to_tab(&["/g/a".to_string(), "/g/b".to_string()], "Archive")
            .unwrap();
        assert_eq!(moved, 2);
        assert_eq!(
            db.get_item_by_path("/g/a").unwrap().unwrap().tab_name,
            "Archive"
        );
    }

    #[test]
    fn batch_fetch_groups_host_records_by_gallery() {
        let db = util::database::temp().unwrap();
        let mut a = record("/g/a");
        let mut b = record("/g/b");
        let id_a = db.insert_item(&mut a).unwrap();
        let id_b = db.insert_item(&mut b).unwrap();
        db.upsert_file_host_upload(&FileHostUpload::new(id_a, "rapidgator"))
            .unwrap();
        db.upsert_file_host_upload(&FileHostUpload::new(id_a, "katfile"))
            .unwrap();
        db.upsert_file_host_upload(&FileHostUpload::new(id_b, "rapidgator"))
            .unwrap();

        let grouped = db.get_all_file_host_uploads_batch().unwrap();
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[&id_a].len(), 2);
        assert_eq!(grouped[&id_b].len(), 1);
    }

    #[test]
    fn unnamed_galleries_round_trip() {
        let db = util::database::temp().unwrap();
        db.save_unnamed_gallery("g123", "Alpha").unwrap();
        db.save_unnamed_gallery("g123", "Alpha Renamed").unwrap();
        db.save_unnamed_gallery("g456", "Beta").unwrap();

        let unnamed = db.get_unnamed_galleries().unwrap();
        assert_eq!(
            unnamed,
            vec![
                ("g123".to_string(), "Alpha Renamed".to_string()),
                ("g456".to_string(), "Beta".to_string())
            ]
        );

        db.remove_unnamed_gallery("g123").unwrap();
        assert_eq!(db.get_unnamed_galleries().unwrap().len(), 1);
    }

    #[test]
    fn stats_round_trip() {
        let db = util::database::temp().unwrap();
        assert_eq!(db.get_stat("fastest_kbps").unwrap(), None);
        db.set_stat("fastest_kbps", "812.5").unwrap();
        assert_eq!(db.get_stat_f64("fastest_kbps").unwrap(), 812.5);

        db.record_gallery_completed(10, 1024).unwrap();
        db.record_gallery_completed(5, 512).unwrap();
        assert_eq!(db.get_stat_i64("total_galleries").unwrap(), 2);
        assert_eq!(db.get_stat_i64("total_images").unwrap(), 15);
        assert_eq!(db.get_stat_i64("total_size_bytes").unwrap(), 1536);
    }
}

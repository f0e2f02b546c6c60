//! Completion artifacts: the JSON manifest and the rendered BBCode text.
//!
//! Both are written twice, to the central galleries directory and to a
//! `.uploaded/` subfolder inside the gallery itself. Writes are
//! best-effort; a failed write is logged and the upload still counts.

mod error;
pub mod template;

pub use self::error::{Error, ErrorKind, Result};
pub use self::template::TemplateContext;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::*;
use pretty_bytes::converter::convert as human_bytes;
use serde_derive::{Deserialize, Serialize};

use crate::ix;
use crate::ix::agent::database::GalleryRecord;
use crate::ix::util::temporal;

/// One successfully uploaded image, as the engine reports it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ImageResult {
    pub filename: String,
    pub size_bytes: u64,
    pub width: i64,
    pub height: i64,
    pub image_url: String,
    pub thumbnail_url: String,
}

impl ImageResult {
    /// The linked-thumbnail BBCode snippet for this image.
    pub fn bbcode(&self) -> String {
        format!(
            "[url={image}][img]{thumb}[/img][/url]",
            image = self.image_url,
            thumb = self.thumbnail_url
        )
    }
}

/// Everything the engine learned about one gallery's upload run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GalleryResults {
    pub gallery_id: String,
    pub gallery_url: String,
    pub images: Vec<ImageResult>,
    pub failed: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManifestMeta {
    pub gallery_id: String,
    pub gallery_url: String,
    pub created_ts: i64,
    pub template_name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManifestImage {
    pub original_filename: String,
    pub size_bytes: u64,
    pub width: i64,
    pub height: i64,
    pub image_url: String,
    pub thumbnail_url: String,
    pub bbcode: String,
}

/// The persisted JSON manifest.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Manifest {
    pub meta: ManifestMeta,
    pub images: Vec<ManifestImage>,
    pub custom_fields: HashMap<String, String>,
}

/// The artifact paths that were actually written.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WrittenArtifacts {
    pub central_json: Option<PathBuf>,
    pub central_bbcode: Option<PathBuf>,
    pub folder_json: Option<PathBuf>,
    pub folder_bbcode: Option<PathBuf>,
}

impl WrittenArtifacts {
    /// Preferred manifest path for hooks: the in-folder copy, else central.
    pub fn json_path(&self) -> Option<&PathBuf> {
        self.folder_json.as_ref().or(self.central_json.as_ref())
    }

    pub fn bbcode_path(&self) -> Option<&PathBuf> {
        self.folder_bbcode.as_ref().or(self.central_bbcode.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.central_json.is_none()
            && self.central_bbcode.is_none()
            && self.folder_json.is_none()
            && self.folder_bbcode.is_none()
    }
}

pub struct ArtifactWriter {
    central_dir: PathBuf,
    templates_dir: PathBuf,
}

impl ArtifactWriter {
    /// Writer over the standard `~/.imxup` layout.
    pub fn new() -> Result<ArtifactWriter> {
        let central_dir = ix::galleries_dir()
            .map_err(|e| Error::home_dir(e.to_string()))?
            .to_path_buf();
        let templates_dir = ix::templates_dir()
            .map_err(|e| Error::home_dir(e.to_string()))?
            .to_path_buf();
        template::ensure_default_template(&templates_dir)?;
        Ok(ArtifactWriter {
            central_dir,
            templates_dir,
        })
    }

    /// Writer over explicit directories.
    pub fn with_dirs(central_dir: PathBuf, templates_dir: PathBuf) -> ArtifactWriter {
        ArtifactWriter {
            central_dir,
            templates_dir,
        }
    }

    /// Writes the manifest and BBCode for a completed gallery to both
    /// locations, returning whatever actually landed on disk.
    pub fn write(&self, record: &GalleryRecord, results: &GalleryResults) -> WrittenArtifacts {
        let stem = artifact_stem(&record.name, &results.gallery_id);
        let manifest = self.build_manifest(record, results);
        let bbcode = self.render_bbcode(record, results);

        let manifest_json = match serde_json::to_string_pretty(&manifest) {
            Ok(json) => json,
            Err(e) => {
                error!("couldn't serialize manifest for {}: {}", record.path, e);
                return WrittenArtifacts::default();
            }
        };

        let mut written = WrittenArtifacts::default();

        let central_json = self.central_dir.join(format!("{}.json", stem));
        let central_bbcode = self.central_dir.join(format!("{}_bbcode.txt", stem));
        written.central_json = write_artifact(&central_json, &manifest_json);
        written.central_bbcode = write_artifact(&central_bbcode, &bbcode);

        let uploaded_dir = Path::new(&record.path).join(".uploaded");
        let folder_json = uploaded_dir.join(format!("{}.json", stem));
        let folder_bbcode = uploaded_dir.join(format!("{}_bbcode.txt", stem));
        written.folder_json = write_artifact(&folder_json, &manifest_json);
        written.folder_bbcode = write_artifact(&folder_bbcode, &bbcode);

        written
    }

    fn build_manifest(&self, record: &GalleryRecord, results: &GalleryResults) -> Manifest {
        let mut custom_fields = HashMap::new();
        for (key, value) in [
            ("custom1", &record.custom1),
            ("custom2", &record.custom2),
            ("custom3", &record.custom3),
            ("custom4", &record.custom4),
            ("ext1", &record.ext1),
            ("ext2", &record.ext2),
            ("ext3", &record.ext3),
            ("ext4", &record.ext4),
        ]
        .iter()
        {
            if !value.is_empty() {
                custom_fields.insert(key.to_string(), value.to_string());
            }
        }

        Manifest {
            meta: ManifestMeta {
                gallery_id: results.gallery_id.clone(),
                gallery_url: results.gallery_url.clone(),
                created_ts: temporal::epoch_secs(),
                template_name: record.template_name.clone(),
            },
            images: results
                .images
                .iter()
                .map(|image| ManifestImage {
                    original_filename: image.filename.clone(),
                    size_bytes: image.size_bytes,
                    width: image.width,
                    height: image.height,
                    image_url: image.image_url.clone(),
                    thumbnail_url: image.thumbnail_url.clone(),
                    bbcode: image.bbcode(),
                })
                .collect(),
            custom_fields,
        }
    }

    fn render_bbcode(&self, record: &GalleryRecord, results: &GalleryResults) -> String {
        let all_images = results
            .images
            .iter()
            .map(|image| image.bbcode())
            .collect::<Vec<_>>()
            .join("\n");

        let context = TemplateContext {
            folder_name: record.name.clone(),
            picture_count: results.images.len() as i64,
            width: record.avg_width,
            height: record.avg_height,
            extension: dominant_extension(results),
            folder_size: human_bytes(record.total_size as f64),
            gallery_link: results.gallery_url.clone(),
            all_images,
        };
        let body = template::load_template(&self.templates_dir, &record.template_name);
        template::render(&body, &context)
    }
}

/// The file stem both artifacts share: `{name}_{gallery_id}`, or just the
/// name when the host never assigned an id.
pub fn artifact_stem(name: &str, gallery_id: &str) -> String {
    let safe_name: String = name
        .chars()
        .map(|ch| match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            ch => ch,
        })
        .collect();
    if gallery_id.is_empty() {
        safe_name
    } else {
        format!("{}_{}", safe_name, gallery_id)
    }
}

fn dominant_extension(results: &GalleryResults) -> String {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for image in &results.images {
        if let Some(ext) = Path::new(&image.filename)
            .extension()
            .and_then(|e| e.to_str())
        {
            *counts.entry(ext.to_lowercase()).or_insert(0) += 1;
        }
    }
    counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(ext, _)| ext)
        .unwrap_or_default()
}

fn write_artifact(path: &Path, contents: &str) -> Option<PathBuf> {
    if let Some(parent) = path.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            warn!("couldn't create artifact directory {:?}: {}", parent, e);
            return None;
        }
    }
    match fs::write(path, contents) {
        Ok(()) => Some(path.to_path_buf()),
        Err(e) => {
            warn!("couldn't write artifact {:?}: {}", path, e);
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn results() -> GalleryResults {
        GalleryResults {
            gallery_id: "g123".into(),
            gallery_url: "https://imx.to/g/g123".into(),
            images: vec![
                ImageResult {
                    filename: "a.jpg".into(),
                    size_bytes: 1000,
                    width: 800,
                    height: 600,
                    image_url: "https://imx.to/i/a".into(),
                    thumbnail_url: "https://imx.to/t/a".into(),
                },
                ImageResult {
                    filename: "b.jpg".into(),
                    size_bytes: 2000,
                    width: 800,
                    height: 600,
                    image_url: "https://imx.to/i/b".into(),
                    thumbnail_url: "https://imx.to/t/b".into(),
                },
                ImageResult {
                    filename: "c.png".into(),
                    size_bytes: 3000,
                    width: 800,
                    height: 600,
                    image_url: "https://imx.to/i/c".into(),
                    thumbnail_url: "https://imx.to/t/c".into(),
                },
            ],
            failed: vec![],
        }
    }

    fn record(path: &str) -> GalleryRecord {
        let mut record = GalleryRecord::new(path, "Alpha");
        record.avg_width = 800;
        record.avg_height = 600;
        record.total_size = 6000;
        record.custom1 = "tag".into();
        record
    }

    #[test]
    fn writes_to_both_locations() {
        let central = tempfile::tempdir().unwrap();
        let templates = tempfile::tempdir().unwrap();
        let gallery = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::with_dirs(
            central.path().to_path_buf(),
            templates.path().to_path_buf(),
        );

        let record = record(gallery.path().to_str().unwrap());
        let written = writer.write(&record, &results());

        assert_eq!(
            written.central_json.as_ref().unwrap(),
            &central.path().join("Alpha_g123.json")
        );
        assert_eq!(
            written.folder_bbcode.as_ref().unwrap(),
            &gallery.path().join(".uploaded").join("Alpha_g123_bbcode.txt")
        );
        assert!(written.central_json.as_ref().unwrap().exists());
        assert!(written.folder_json.as_ref().unwrap().exists());
    }

    #[test]
    fn manifest_round_trips_and_carries_custom_fields() {
        let central = tempfile::tempdir().unwrap();
        let templates = tempfile::tempdir().unwrap();
        let gallery = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::with_dirs(
            central.path().to_path_buf(),
            templates.path().to_path_buf(),
        );

        let record = record(gallery.path().to_str().unwrap());
        let written = writer.write(&record, &results());

        let raw = fs::read_to_string(written.central_json.unwrap()).unwrap();
        let manifest: Manifest = serde_json::from_str(&raw).unwrap();
        assert_eq!(manifest.meta.gallery_id, "g123");
        assert_eq!(manifest.images.len(), 3);
        assert_eq!(
            manifest.images[0].bbcode,
            "[url=https://imx.to/i/a][img]https://imx.to/t/a[/img][/url]"
        );
        assert_eq!(manifest.custom_fields.get("custom1").unwrap(), "tag");
        assert!(manifest.custom_fields.get("custom2").is_none());
    }

    #[test]
    fn rendered_bbcode_uses_the_template() {
        let central = tempfile::tempdir().unwrap();
        let templates = tempfile::tempdir().unwrap();
        fs::write(
            templates.path().join("default.template"),
            "#folderName# (#pictureCount# x #extension#)\n#allImages#",
        )
        .unwrap();
        let gallery = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::with_dirs(
            central.path().to_path_buf(),
            templates.path().to_path_buf(),
        );

        let record = record(gallery.path().to_str().unwrap());
        let written = writer.write(&record, &results());
        let bbcode = fs::read_to_string(written.central_bbcode.unwrap()).unwrap();
        assert!(bbcode.starts_with("Alpha (3 x jpg)\n"));
        assert!(bbcode.contains("[url=https://imx.to/i/b]"));
    }

    #[test]
    fn missing_gallery_id_drops_the_suffix() {
        assert_eq!(artifact_stem("Alpha", ""), "Alpha");
        assert_eq!(artifact_stem("Alpha", "g9"), "Alpha_g9");
        assert_eq!(artifact_stem("A/B:C", "g9"), "A_B_C_g9");
    }

    #[test]
    fn unwritable_location_is_tolerated() {
        let templates = tempfile::tempdir().unwrap();
        let gallery = tempfile::tempdir().unwrap();
        // The central directory cannot be created under a file.
        let blocked = gallery.path().join("file");
        fs::write(&blocked, "x").unwrap();
        let writer = ArtifactWriter::with_dirs(
            blocked.join("sub"),
            templates.path().to_path_buf(),
        );

        let record = record(gallery.path().to_str().unwrap());
        let written = writer.write(&record, &results());
        assert!(written.central_json.is_none());
        // The in-folder copies still landed.
        assert!(written.folder_json.is_some());
    }
}

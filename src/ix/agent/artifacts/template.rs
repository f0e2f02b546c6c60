//! BBCode template loading and rendering.
//!
//! Templates are plain text files under the templates directory with a
//! closed set of `#placeholder#` tokens. Rendering is a straight
//! replacement pass; the template language itself is out of scope.

use std::fs;
use std::path::Path;

use log::*;

use crate::ix::agent::config::constants as c;

use super::Result;

/// Values substituted into a template.
#[derive(Clone, Debug, Default)]
pub struct TemplateContext {
    pub folder_name: String,
    pub picture_count: i64,
    pub width: i64,
    pub height: i64,
    pub extension: String,
    pub folder_size: String,
    pub gallery_link: String,
    pub all_images: String,
}

impl TemplateContext {
    fn longest(&self) -> i64 {
        self.width.max(self.height)
    }
}

/// Renders a template body against the context. Unknown `#tokens#` are left
/// alone; the placeholder set is closed.
pub fn render(template: &str, context: &TemplateContext) -> String {
    let mut rendered = template.to_string();
    let pairs: [(&str, String); 9] = [
        ("#folderName#", context.folder_name.clone()),
        ("#pictureCount#", context.picture_count.to_string()),
        ("#width#", context.width.to_string()),
        ("#height#", context.height.to_string()),
        ("#longest#", context.longest().to_string()),
        ("#extension#", context.extension.clone()),
        ("#folderSize#", context.folder_size.clone()),
        ("#galleryLink#", context.gallery_link.clone()),
        ("#allImages#", context.all_images.clone()),
    ];
    for (token, value) in pairs.iter() {
        rendered = rendered.replace(token, value);
    }
    rendered
}

/// Loads a named template from the given directory, falling back to the
/// built-in default body when the file is missing or unreadable.
pub fn load_template(templates_dir: &Path, name: &str) -> String {
    let path = templates_dir.join(format!("{}.template", name));
    match fs::read_to_string(&path) {
        Ok(body) => body,
        Err(e) => {
            if name != c::DEFAULT_TEMPLATE_NAME {
                debug!("template {:?} not loadable ({}), using default", path, e);
            }
            fs::read_to_string(
                templates_dir.join(format!("{}.template", c::DEFAULT_TEMPLATE_NAME)),
            )
            .unwrap_or_else(|_| c::DEFAULT_TEMPLATE_BODY.to_string())
        }
    }
}

/// Writes the built-in default template on first run so users have a file
/// to start editing.
pub fn ensure_default_template(templates_dir: &Path) -> Result<()> {
    let path = templates_dir.join(format!("{}.template", c::DEFAULT_TEMPLATE_NAME));
    if !path.exists() {
        fs::create_dir_all(templates_dir)?;
        fs::write(&path, c::DEFAULT_TEMPLATE_BODY)?;
        info!("wrote default template to {:?}", path);
    }
    Ok(())
}

/// Names of every template available in the directory.
pub fn list_templates(templates_dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(templates_dir)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) == Some("template") {
                        path.file_stem()
                            .and_then(|s| s.to_str())
                            .map(|s| s.to_string())
                    } else {
                        None
                    }
                })
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn render_substitutes_the_closed_set() {
        let context = TemplateContext {
            folder_name: "Alpha".into(),
            picture_count: 3,
            width: 800,
            height: 1200,
            extension: "jpg".into(),
            folder_size: "3.1 MB".into(),
            gallery_link: "https://imx.to/g/x".into(),
            all_images: "[img]1[/img]\n[img]2[/img]".into(),
        };
        let rendered = render(
            "#folderName# #pictureCount# #width#x#height# (#longest#) #extension# \
             #folderSize#\n#galleryLink#\n#allImages#\n#unknown#",
            &context,
        );
        assert_eq!(
            rendered,
            "Alpha 3 800x1200 (1200) jpg 3.1 MB\nhttps://imx.to/g/x\n\
             [img]1[/img]\n[img]2[/img]\n#unknown#"
        );
    }

    #[test]
    fn missing_template_falls_back_to_default_body() {
        let dir = tempfile::tempdir().unwrap();
        let body = load_template(dir.path(), "nonexistent");
        assert_eq!(body, c::DEFAULT_TEMPLATE_BODY);
    }

    #[test]
    fn named_template_is_preferred() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mine.template"), "custom #folderName#").unwrap();
        assert_eq!(load_template(dir.path(), "mine"), "custom #folderName#");
    }

    #[test]
    fn default_template_bootstrap_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        ensure_default_template(dir.path()).unwrap();
        ensure_default_template(dir.path()).unwrap();
        assert_eq!(list_templates(dir.path()), vec!["default"]);
    }
}

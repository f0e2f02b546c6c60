//! External program hooks, run at gallery lifecycle events.
//!
//! Each configured hook is a command template. Variables are substituted
//! (longest names first, `%%` escapes a literal percent), the program runs
//! with a wall-clock timeout, and any JSON object it prints to stdout can be
//! mapped into the gallery's ext1..ext4 fields. A failing hook is logged and
//! ignored; it never fails the gallery.

mod error;

pub use self::error::{Error, ErrorKind, Result};

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::*;

use crate::ix::agent::archive;
use crate::ix::agent::config::constants as c;
use crate::ix::agent::config::{Config, HookSettings, HooksSettings};
use crate::ix::agent::database::GalleryRecord;
use crate::ix::util::strings::split_command;

/// The three lifecycle points hooks can attach to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookEvent {
    Added,
    Started,
    Completed,
}

impl HookEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            HookEvent::Added => "added",
            HookEvent::Started => "started",
            HookEvent::Completed => "completed",
        }
    }
}

/// The substitution context handed to each hook invocation.
#[derive(Clone, Debug, Default)]
pub struct HookContext {
    pub gallery_name: String,
    pub tab_name: String,
    pub gallery_path: String,
    pub image_count: i64,
    pub gallery_id: String,
    pub json_path: String,
    pub bbcode_path: String,
    pub zip_path: String,
    pub size_bytes: i64,
    pub template_name: String,
    pub ext: [String; 4],
    pub custom: [String; 4],
}

impl HookContext {
    /// Builds a context from a gallery record. Artifact paths are filled in
    /// by the engine for "completed" hooks.
    pub fn from_record(record: &GalleryRecord) -> Self {
        Self {
            gallery_name: record.name.clone(),
            tab_name: record.tab_name.clone(),
            gallery_path: record.path.clone(),
            image_count: record.total_images,
            gallery_id: record.gallery_id.clone().unwrap_or_default(),
            json_path: String::new(),
            bbcode_path: String::new(),
            zip_path: String::new(),
            size_bytes: record.total_size,
            template_name: record.template_name.clone(),
            ext: [
                record.ext1.clone(),
                record.ext2.clone(),
                record.ext3.clone(),
                record.ext4.clone(),
            ],
            custom: [
                record.custom1.clone(),
                record.custom2.clone(),
                record.custom3.clone(),
                record.custom4.clone(),
            ],
        }
    }
}

const ESCAPE_PLACEHOLDER: &str = "\u{0}ESCAPED_PERCENT\u{0}";

/// Substitutes hook variables into a command template. Longer variable
/// names are replaced first so `%e1` is never read as `%e` followed by `1`;
/// `%%` survives as a literal `%`.
pub fn substitute_variables(command: &str, context: &HookContext) -> String {
    let mut substitutions: Vec<(&str, String)> = vec![
        ("%e1", context.ext[0].clone()),
        ("%e2", context.ext[1].clone()),
        ("%e3", context.ext[2].clone()),
        ("%e4", context.ext[3].clone()),
        ("%c1", context.custom[0].clone()),
        ("%c2", context.custom[1].clone()),
        ("%c3", context.custom[2].clone()),
        ("%c4", context.custom[3].clone()),
        ("%N", context.gallery_name.clone()),
        ("%T", context.tab_name.clone()),
        ("%p", context.gallery_path.clone()),
        ("%C", context.image_count.to_string()),
        ("%g", context.gallery_id.clone()),
        ("%j", context.json_path.clone()),
        ("%b", context.bbcode_path.clone()),
        ("%z", context.zip_path.clone()),
        ("%s", context.size_bytes.to_string()),
        ("%t", context.template_name.clone()),
    ];
    substitutions.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

    let mut result = command.replace("%%", ESCAPE_PLACEHOLDER);
    for (variable, value) in substitutions {
        result = result.replace(variable, &value);
    }
    result.replace(ESCAPE_PLACEHOLDER, "%")
}

/// Runs configured hooks. Stateless apart from the timeout; configuration
/// is reloaded per execution so edits take effect without a restart.
pub struct HookExecutor {
    timeout: Duration,
}

impl Default for HookExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl HookExecutor {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(c::HOOK_TIMEOUT_SECS),
        }
    }

    #[cfg(test)]
    fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Executes the hook for one lifecycle event with freshly loaded
    /// configuration, returning the ext-field updates it produced.
    pub fn execute_event(&self, event: HookEvent, context: &HookContext) -> HashMap<String, String> {
        let settings = Config::from_config_file_or_default().hooks;
        self.execute_with_settings(&settings, &[event], context)
    }

    /// Executes the given lifecycle hooks against explicit settings.
    /// Multiple enabled hooks run concurrently when configured, otherwise
    /// serially; either way the merged key mapping feeds ext1..ext4.
    pub fn execute_with_settings(
        &self,
        settings: &HooksSettings,
        events: &[HookEvent],
        context: &HookContext,
    ) -> HashMap<String, String> {
        let enabled: Vec<(HookEvent, &HookSettings)> = events
            .iter()
            .filter_map(|event| {
                settings
                    .for_event(event.as_str())
                    .filter(|hook| hook.enabled && !hook.command.trim().is_empty())
                    .map(|hook| (*event, hook))
            })
            .collect();
        if enabled.is_empty() {
            debug!("no enabled hooks for {:?}", events);
            return HashMap::new();
        }

        let mut results: HashMap<String, serde_json::Value> = HashMap::new();
        if settings.parallel_execution && enabled.len() > 1 {
            debug!("executing {} hooks in parallel", enabled.len());
            let outputs: Vec<_> = enabled
                .iter()
                .map(|(event, hook)| {
                    let event = *event;
                    let hook = (*hook).clone();
                    let context = context.clone();
                    let timeout = self.timeout;
                    thread::spawn(move || run_hook(event, &hook, &context, timeout))
                })
                .collect();
            for output in outputs {
                match output.join() {
                    Ok(Ok(Some(json))) => merge_json(&mut results, json),
                    Ok(Ok(None)) => {}
                    Ok(Err(e)) => warn!("hook failed: {}", e),
                    Err(_) => error!("hook thread panicked"),
                }
            }
        } else {
            for (event, hook) in &enabled {
                match run_hook(*event, hook, context, self.timeout) {
                    Ok(Some(json)) => merge_json(&mut results, json),
                    Ok(None) => {}
                    Err(e) => warn!("hook {} failed: {}", event.as_str(), e),
                }
            }
        }

        // Merge key mappings from every enabled hook; the first hook wins
        // per ext field.
        let mut merged_mapping: HashMap<&'static str, String> = HashMap::new();
        for (_, hook) in &enabled {
            for (slot, json_key) in ["ext1", "ext2", "ext3", "ext4"]
                .iter()
                .zip(hook.key_mapping.iter())
            {
                let json_key = json_key.trim();
                if !json_key.is_empty() && !merged_mapping.contains_key(*slot) {
                    merged_mapping.insert(*slot, json_key.to_string());
                }
            }
        }

        let mut ext_fields = HashMap::new();
        for (slot, json_key) in merged_mapping {
            if let Some(value) = results.get(&json_key) {
                ext_fields.insert(slot.to_string(), json_value_to_string(value));
            }
        }
        if !ext_fields.is_empty() {
            debug!("hooks produced ext fields: {:?}", ext_fields);
        }
        ext_fields
    }
}

fn merge_json(results: &mut HashMap<String, serde_json::Value>, json: serde_json::Value) {
    if let serde_json::Value::Object(map) = json {
        for (key, value) in map {
            results.insert(key, value);
        }
    }
}

fn json_value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Runs a single hook to completion, returning its parsed JSON stdout when
/// there is any.
fn run_hook(
    event: HookEvent,
    hook: &HookSettings,
    context: &HookContext,
    timeout: Duration,
) -> Result<Option<serde_json::Value>> {
    // A command that references %z without a prepared archive gets a
    // temporary store-mode ZIP for the duration of the run.
    let mut context = context.clone();
    let mut temp_zip: Option<PathBuf> = None;
    if hook.command.contains("%z") && context.zip_path.is_empty() {
        let gallery = Path::new(&context.gallery_path);
        if gallery.is_dir() {
            let zip_path = archive::create_temp_zip(gallery)?;
            context.zip_path = zip_path.to_string_lossy().to_string();
            temp_zip = Some(zip_path);
        }
    }

    let outcome = run_command(event, hook, &context, timeout);

    if let Some(zip_path) = temp_zip {
        archive::remove_temp_file_with_retry(&zip_path);
    }
    outcome
}

fn run_command(
    event: HookEvent,
    hook: &HookSettings,
    context: &HookContext,
    timeout: Duration,
) -> Result<Option<serde_json::Value>> {
    let final_command = substitute_variables(&hook.command, context);
    let args = split_command(&final_command);
    if args.is_empty() {
        return Err(Error::empty_command());
    }
    debug!("executing {} hook: {}", event.as_str(), final_command);

    let mut command = Command::new(&args[0]);
    command
        .args(&args[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        if !hook.show_console {
            command.creation_flags(CREATE_NO_WINDOW);
        }
    }
    #[cfg(not(windows))]
    let _ = hook.show_console;

    let mut child = command.spawn()?;

    // Drain both pipes on their own threads so a chatty hook can't block
    // on a full pipe while we wait for it.
    let stdout_reader = spawn_pipe_reader(child.stdout.take());
    let stderr_reader = spawn_pipe_reader(child.stderr.take());

    let started = Instant::now();
    let status = loop {
        match child.try_wait()? {
            Some(status) => break status,
            None => {
                if started.elapsed() >= timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = stdout_reader.join();
                    let _ = stderr_reader.join();
                    return Err(Error::timed_out(timeout.as_secs()));
                }
                thread::sleep(Duration::from_millis(100));
            }
        }
    };

    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();
    if !stderr.trim().is_empty() {
        debug!("{} hook stderr: {}", event.as_str(), stderr.trim());
    }

    if !status.success() {
        return Err(Error::non_zero_exit(status.code()));
    }

    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(json) if json.is_object() => Ok(Some(json)),
        Ok(_) | Err(_) => {
            debug!("{} hook stdout is not a JSON object, ignoring", event.as_str());
            Ok(None)
        }
    }
}

fn spawn_pipe_reader<R: Read + Send + 'static>(
    pipe: Option<R>,
) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut output = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut output);
        }
        output
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn context() -> HookContext {
        HookContext {
            gallery_name: "My Gallery".into(),
            tab_name: "Main".into(),
            gallery_path: "/g/my".into(),
            image_count: 12,
            gallery_id: "g123".into(),
            json_path: "/a/m.json".into(),
            bbcode_path: "/a/m.txt".into(),
            zip_path: "/tmp/m.zip".into(),
            size_bytes: 2048,
            template_name: "default".into(),
            ext: ["e1".into(), "e2".into(), "e3".into(), "e4".into()],
            custom: ["c1".into(), "c2".into(), "c3".into(), "c4".into()],
        }
    }

    #[test]
    fn substitution_without_variables_is_identity() {
        assert_eq!(
            substitute_variables("run --verbose", &context()),
            "run --verbose"
        );
    }

    #[test]
    fn escaped_percent_is_literal() {
        assert_eq!(substitute_variables("%%", &context()), "%");
        assert_eq!(substitute_variables("100%%N", &context()), "100%N");
    }

    #[test]
    fn longest_variables_win() {
        // %e1 must not parse as %e + "1"; there is no %e variable, so the
        // distinction shows with %c1 vs %C.
        assert_eq!(substitute_variables("%e1", &context()), "e1");
        assert_eq!(substitute_variables("%c1 %C", &context()), "c1 12");
    }

    #[test]
    fn all_variables_substitute() {
        let rendered = substitute_variables(
            "%N|%T|%p|%C|%g|%j|%b|%z|%s|%t|%e1|%e4|%c2",
            &context(),
        );
        assert_eq!(
            rendered,
            "My Gallery|Main|/g/my|12|g123|/a/m.json|/a/m.txt|/tmp/m.zip|2048|default|e1|e4|c2"
        );
    }

    fn hook(command: &str) -> HookSettings {
        HookSettings {
            enabled: true,
            command: command.to_string(),
            show_console: false,
            key_mapping: [
                "download_url".into(),
                "ext2".into(),
                "ext3".into(),
                "ext4".into(),
            ],
        }
    }

    fn settings_with_completed(command: &str) -> HooksSettings {
        let mut settings = HooksSettings::default();
        settings.completed = hook(command);
        settings
    }

    #[cfg(unix)]
    #[test]
    fn hook_json_stdout_maps_to_ext_fields() {
        let executor = HookExecutor::new();
        let settings = settings_with_completed(
            r#"sh -c "printf '{\"download_url\": \"https://files/x.zip\"}'""#,
        );
        let fields = executor.execute_with_settings(
            &settings,
            &[HookEvent::Completed],
            &context(),
        );
        assert_eq!(fields.get("ext1").unwrap(), "https://files/x.zip");
        assert!(fields.get("ext2").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn failing_hook_yields_no_fields() {
        let executor = HookExecutor::new();
        let settings = settings_with_completed(r#"sh -c "exit 3""#);
        let fields = executor.execute_with_settings(
            &settings,
            &[HookEvent::Completed],
            &context(),
        );
        assert!(fields.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn slow_hook_is_killed_at_the_timeout() {
        let executor = HookExecutor::with_timeout(Duration::from_millis(300));
        let settings = settings_with_completed(r#"sh -c "sleep 30""#);
        let started = Instant::now();
        let fields = executor.execute_with_settings(
            &settings,
            &[HookEvent::Completed],
            &context(),
        );
        assert!(fields.is_empty());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn non_json_stdout_is_ignored() {
        let executor = HookExecutor::new();
        let settings = settings_with_completed(r#"sh -c "echo plain text output""#);
        let fields = executor.execute_with_settings(
            &settings,
            &[HookEvent::Completed],
            &context(),
        );
        assert!(fields.is_empty());
    }

    #[test]
    fn disabled_hooks_do_nothing() {
        let executor = HookExecutor::new();
        let settings = HooksSettings::default();
        let fields = executor.execute_with_settings(
            &settings,
            &[HookEvent::Added, HookEvent::Started, HookEvent::Completed],
            &context(),
        );
        assert!(fields.is_empty());
    }
}

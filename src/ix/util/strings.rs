//! String utilities.

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

/// Generates an alphanumeric string of the given length.
pub fn random_alphanum(length: usize) -> String {
    let mut rng = thread_rng();
    rng.sample_iter(&Alphanumeric)
        .take(length)
        .collect::<String>()
}

/// Adds a 6 character alphanumeric suffix to the input string.
pub fn random_suffix<S>(input: S) -> String
where
    S: Into<String>,
{
    format!(
        "{input}-{suffix}",
        input = input.into(),
        suffix = random_alphanum(6)
    )
}

/// Characters the host refuses in gallery names.
const FORBIDDEN_NAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*', '\u{0}'];

/// Sanitizes a gallery name according to host rules: forbidden characters
/// are removed and runs of whitespace collapse to a single space.
pub fn sanitize_gallery_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !FORBIDDEN_NAME_CHARS.contains(c))
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Splits a command line into arguments, honoring double-quoted segments.
/// Quotes group words; a backslash escapes the next character inside quotes.
pub fn split_command(command: &str) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
            }
            '\\' if in_quotes => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    args.push(std::mem::replace(&mut current, String::new()));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        args.push(current);
    }
    args
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn random_alphanum_has_requested_length() {
        assert_eq!(random_alphanum(12).len(), 12);
    }

    #[test]
    fn sanitize_removes_forbidden_characters() {
        assert_eq!(
            sanitize_gallery_name("My <Gallery>: \"Best/Of\"?"),
            "My Gallery BestOf"
        );
    }

    #[test]
    fn sanitize_collapses_whitespace() {
        assert_eq!(sanitize_gallery_name("a   b\t\tc"), "a b c");
        assert_eq!(sanitize_gallery_name("  leading and trailing  "), "leading and trailing");
    }

    #[test]
    fn split_command_plain_words() {
        assert_eq!(split_command("prog -a b"), vec!["prog", "-a", "b"]);
    }

    #[test]
    fn split_command_preserves_quoted_arguments() {
        assert_eq!(
            split_command(r#"notify "My Gallery Name" --id 7"#),
            vec!["notify", "My Gallery Name", "--id", "7"]
        );
    }

    #[test]
    fn split_command_empty() {
        assert!(split_command("   ").is_empty());
    }
}

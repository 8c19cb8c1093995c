//! Account name discovery
//!
//! Source priority, first non-empty wins:
//! 1. explicit comma-separated list
//! 2. accounts file, `accounts:` section (mapping or list layout)
//! 3. fallback JSON file (array of `{"name": ...}` or object keyed by name)
//!
//! Missing files count as empty. Unreadable or malformed files are errors so
//! a broken config surfaces at startup instead of silently running without a
//! pool.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

/// Where to look for account names.
#[derive(Debug, Clone, Default)]
pub struct AccountSources {
    /// Comma-separated names, e.g. from `AGENT_BRIDGE_ACCOUNTS`.
    pub explicit: Option<String>,
    /// Structured config file with an `accounts:` section.
    pub accounts_file: Option<PathBuf>,
    /// JSON file listing account names.
    pub fallback_file: Option<PathBuf>,
}

/// Resolve the ordered, de-duplicated account names from the first non-empty
/// source.
pub async fn resolve_names(sources: &AccountSources) -> Result<Vec<String>> {
    if let Some(list) = &sources.explicit {
        let names = parse_explicit_list(list);
        if !names.is_empty() {
            debug!(count = names.len(), "accounts from explicit list");
            return Ok(dedupe(names));
        }
    }

    if let Some(path) = &sources.accounts_file
        && let Some(contents) = read_optional(path).await?
    {
        let names = parse_accounts_section(&contents);
        if !names.is_empty() {
            debug!(path = %path.display(), count = names.len(), "accounts from config file");
            return Ok(dedupe(names));
        }
    }

    if let Some(path) = &sources.fallback_file
        && let Some(contents) = read_optional(path).await?
    {
        let names = parse_fallback_json(&contents).map_err(|message| Error::Parse {
            path: path.display().to_string(),
            message,
        })?;
        if !names.is_empty() {
            debug!(path = %path.display(), count = names.len(), "accounts from fallback file");
            return Ok(dedupe(names));
        }
    }

    Ok(Vec::new())
}

/// Filesystem-safe identifier for an account name: every character outside
/// `[A-Za-z0-9_-]` becomes `-`, then the result is lower-cased.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

fn parse_explicit_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Extract names from the `accounts:` section of a YAML-style config file.
///
/// Mapping layout takes the 2-space-indented keys directly under `accounts:`.
/// List layout takes `- name: X` or bare `- X` entries. The section ends at
/// the next unindented line that is neither blank nor a comment.
fn parse_accounts_section(contents: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut in_section = false;

    for raw in contents.lines() {
        let line = raw.trim_end();
        let trimmed = line.trim_start();
        let indent = line.len() - trimmed.len();

        if !in_section {
            if indent == 0 && strip_comment(trimmed).trim_end() == "accounts:" {
                in_section = true;
            }
            continue;
        }

        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if indent == 0 {
            break;
        }

        if let Some(item) = trimmed.strip_prefix('-') {
            let item = strip_comment(item).trim();
            let value = match item.strip_prefix("name:") {
                Some(rest) => rest.trim(),
                None => item,
            };
            let value = unquote(value);
            if !value.is_empty() {
                names.push(value.to_string());
            }
        } else if indent == 2
            && let Some((key, _)) = strip_comment(trimmed).split_once(':')
        {
            let key = unquote(key.trim());
            if !key.is_empty() {
                names.push(key.to_string());
            }
        }
    }

    names
}

fn parse_fallback_json(contents: &str) -> std::result::Result<Vec<String>, String> {
    let value: serde_json::Value = serde_json::from_str(contents).map_err(|e| e.to_string())?;
    let names = match value {
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("name").and_then(|n| n.as_str()))
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .collect(),
        serde_json::Value::Object(map) => map.keys().cloned().collect(),
        _ => return Err("expected an array or an object".into()),
    };
    Ok(names)
}

/// Drop a trailing ` # comment`.
fn strip_comment(s: &str) -> &str {
    match s.find(" #") {
        Some(idx) => &s[..idx],
        None => s,
    }
}

fn unquote(s: &str) -> &str {
    let s = s.trim();
    for q in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(q) && s.ends_with(q) {
            return &s[1..s.len() - 1];
        }
    }
    s
}

fn dedupe(names: Vec<String>) -> Vec<String> {
    let mut seen = Vec::with_capacity(names.len());
    for name in names {
        if !seen.contains(&name) {
            seen.push(name);
        }
    }
    seen
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(Error::Io {
            path: path.display().to_string(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_and_lowercases() {
        assert_eq!(sanitize_name("Work Account"), "work-account");
        assert_eq!(sanitize_name("me@example.com"), "me-example-com");
        assert_eq!(sanitize_name("team_A-2"), "team_a-2");
        assert_eq!(sanitize_name("ü"), "-");
    }

    #[test]
    fn explicit_list_trims_and_skips_empty() {
        assert_eq!(
            parse_explicit_list(" work, personal ,, "),
            vec!["work", "personal"]
        );
    }

    #[test]
    fn mapping_layout() {
        let contents = "\
model: opus
accounts:
  work:
    description: day job
  \"Side Project\":
    description: nights
# trailing comment
other:
  not_an_account: true
";
        assert_eq!(
            parse_accounts_section(contents),
            vec!["work", "Side Project"]
        );
    }

    #[test]
    fn list_layout_with_name_keys_and_bare_entries() {
        let contents = "\
accounts:
  - name: work
    email: me@work.example
  # disabled for now
  - personal # primary

  - 'Side Project'
settings:
  - name: not-an-account
";
        assert_eq!(
            parse_accounts_section(contents),
            vec!["work", "personal", "Side Project"]
        );
    }

    #[test]
    fn missing_section_yields_nothing() {
        assert!(parse_accounts_section("model: opus\n").is_empty());
        assert!(parse_accounts_section("  accounts:\n  - nested\n").is_empty());
    }

    #[test]
    fn fallback_json_array_and_object() {
        assert_eq!(
            parse_fallback_json(r#"[{"name":"a"},{"name":" b "},{"other":1}]"#).unwrap(),
            vec!["a", "b"]
        );
        assert_eq!(
            parse_fallback_json(r#"{"zeta":{},"alpha":{},"mid":{}}"#).unwrap(),
            vec!["zeta", "alpha", "mid"]
        );
        assert!(parse_fallback_json("42").is_err());
        assert!(parse_fallback_json("{broken").is_err());
    }

    #[tokio::test]
    async fn explicit_list_wins_over_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config.yaml");
        std::fs::write(&file, "accounts:\n  - from-file\n").unwrap();

        let sources = AccountSources {
            explicit: Some("from-env".into()),
            accounts_file: Some(file),
            fallback_file: None,
        };
        assert_eq!(resolve_names(&sources).await.unwrap(), vec!["from-env"]);
    }

    #[tokio::test]
    async fn empty_sources_fall_through_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config.yaml");
        std::fs::write(&file, "model: opus\n").unwrap();
        let fallback = dir.path().join("accounts.json");
        std::fs::write(&fallback, r#"[{"name":"fallback"}]"#).unwrap();

        let sources = AccountSources {
            explicit: Some(" , ".into()),
            accounts_file: Some(file),
            fallback_file: Some(fallback),
        };
        assert_eq!(resolve_names(&sources).await.unwrap(), vec!["fallback"]);
    }

    #[tokio::test]
    async fn missing_files_are_empty_not_errors() {
        let sources = AccountSources {
            explicit: None,
            accounts_file: Some("/nonexistent/config.yaml".into()),
            fallback_file: Some("/nonexistent/accounts.json".into()),
        };
        assert!(resolve_names(&sources).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_fallback_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let fallback = dir.path().join("accounts.json");
        std::fs::write(&fallback, "{not json").unwrap();

        let sources = AccountSources {
            fallback_file: Some(fallback),
            ..Default::default()
        };
        let err = resolve_names(&sources).await.unwrap_err();
        assert!(matches!(err, Error::Parse { .. }), "got: {err:?}");
    }

    #[tokio::test]
    async fn duplicates_are_collapsed_in_order() {
        let sources = AccountSources {
            explicit: Some("b,a,b".into()),
            ..Default::default()
        };
        assert_eq!(resolve_names(&sources).await.unwrap(), vec!["b", "a"]);
    }

    #[test]
    fn sanitization_matches_across_layouts() {
        let explicit = parse_explicit_list("My Work!");
        let mapping = parse_accounts_section("accounts:\n  My Work!:\n");
        let list = parse_accounts_section("accounts:\n  - name: My Work!\n");
        let bare = parse_accounts_section("accounts:\n  - My Work!\n");

        let ids: Vec<String> = [explicit, mapping, list, bare]
            .iter()
            .map(|names| sanitize_name(&names[0]))
            .collect();
        assert!(ids.iter().all(|id| id == "my-work-"), "got: {ids:?}");
    }
}

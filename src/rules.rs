use anyhow::{bail, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use tracing::{info, warn};

/// A copilot behavior rule loaded from a markdown file. The whole file body
/// is injected into the system prompt while the rule is enabled.
#[derive(Debug, Clone, Serialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub description: String,
    pub content: String,
    pub enabled: bool,
}

/// Loads and manages prompt rules from a directory of `*.md` files.
#[derive(Default)]
pub struct RuleManager {
    rules: RwLock<HashMap<String, Rule>>,
}

impl RuleManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read every markdown file in `dir` as a rule. A missing directory is
    /// not an error; the server just runs without rules.
    pub fn load_rules(&self, dir: &Path) -> Result<()> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("rules directory {} does not exist, skipping", dir.display());
                return Ok(());
            }
            Err(e) => bail!("failed to read rules directory {}: {}", dir.display(), e),
        };

        let mut rules = self.rules.write().unwrap();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let content = match std::fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) => {
                    warn!("failed to read rule file {}: {}", path.display(), e);
                    continue;
                }
            };
            let id = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            let (name, description) = parse_heading(&id, &content);
            rules.insert(
                id.clone(),
                Rule {
                    id,
                    name,
                    description,
                    content,
                    enabled: true,
                },
            );
        }
        info!("loaded {} copilot rules", rules.len());
        Ok(())
    }

    pub fn list_rules(&self) -> Vec<Rule> {
        let rules = self.rules.read().unwrap();
        let mut list: Vec<Rule> = rules.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub fn toggle_rule(&self, id: &str, enabled: bool) -> Result<Rule> {
        let mut rules = self.rules.write().unwrap();
        match rules.get_mut(id) {
            Some(rule) => {
                rule.enabled = enabled;
                Ok(rule.clone())
            }
            None => bail!("rule {} not found", id),
        }
    }

    /// Concatenated bodies of all enabled rules, stable order.
    pub fn active_content(&self) -> String {
        let rules = self.rules.read().unwrap();
        let mut enabled: Vec<&Rule> = rules.values().filter(|r| r.enabled).collect();
        enabled.sort_by(|a, b| a.id.cmp(&b.id));
        enabled
            .iter()
            .map(|r| r.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n---\n\n")
    }
}

/// Derive (name, description) from the file content. A leading `# ` heading
/// becomes the name and the first non-empty line after it the description;
/// otherwise the name is the id with separators spaced out.
fn parse_heading(id: &str, content: &str) -> (String, String) {
    let mut lines = content.lines();
    if let Some(first) = lines.next() {
        if let Some(heading) = first.strip_prefix("# ") {
            let description = lines
                .map(str::trim)
                .find(|l| !l.is_empty())
                .unwrap_or_default()
                .to_string();
            return (heading.trim().to_string(), description);
        }
    }
    (id.replace(['-', '_'], " "), String::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_rule(dir: &Path, file: &str, content: &str) {
        fs::write(dir.join(file), content).unwrap();
    }

    #[test]
    fn loads_rules_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_rule(
            dir.path(),
            "be-terse.md",
            "# Be terse\nKeep answers short.\n\nDetails follow.",
        );
        write_rule(dir.path(), "no_heading.md", "Always check run state first.");
        write_rule(dir.path(), "notes.txt", "not a rule");

        let manager = RuleManager::new();
        manager.load_rules(dir.path()).unwrap();

        let rules = manager.list_rules();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].id, "be-terse");
        assert_eq!(rules[0].name, "Be terse");
        assert_eq!(rules[0].description, "Keep answers short.");
        assert!(rules[0].enabled);
        assert_eq!(rules[1].name, "no heading");
    }

    #[test]
    fn missing_directory_is_not_an_error() {
        let manager = RuleManager::new();
        manager
            .load_rules(Path::new("/definitely/not/here"))
            .unwrap();
        assert!(manager.list_rules().is_empty());
        assert_eq!(manager.active_content(), "");
    }

    #[test]
    fn toggle_controls_active_content() {
        let dir = tempfile::tempdir().unwrap();
        write_rule(dir.path(), "a.md", "rule A");
        write_rule(dir.path(), "b.md", "rule B");

        let manager = RuleManager::new();
        manager.load_rules(dir.path()).unwrap();
        assert_eq!(manager.active_content(), "rule A\n\n---\n\nrule B");

        let rule = manager.toggle_rule("a", false).unwrap();
        assert!(!rule.enabled);
        assert_eq!(manager.active_content(), "rule B");

        manager.toggle_rule("a", true).unwrap();
        assert_eq!(manager.active_content(), "rule A\n\n---\n\nrule B");
    }

    #[test]
    fn toggle_unknown_rule_errors() {
        let manager = RuleManager::new();
        assert!(manager.toggle_rule("ghost", true).is_err());
    }
}

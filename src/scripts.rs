//! Discovery of deployment helper scripts offered to the operator.

use crate::error::EngineResult;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptEntry {
    pub id: String,
    pub name: String,
    /// Command that starts a session for this entry
    pub path: String,
    pub description: String,
}

impl ScriptEntry {
    fn shell() -> Self {
        Self {
            id: "shell".to_string(),
            name: "Interactive Shell".to_string(),
            path: "bash".to_string(),
            description: "Start a bash shell session".to_string(),
        }
    }
}

/// `deploy_code_engine` -> `Deploy Code Engine`
fn title_case(stem: &str) -> String {
    stem.split(['_', ' '])
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// Every `*.sh` in `dir`, sorted by file name, then the interactive shell.
/// A missing directory yields only the shell entry.
pub fn list_scripts(dir: &Path) -> EngineResult<Vec<ScriptEntry>> {
    let mut scripts = Vec::new();

    if dir.is_dir() {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "sh") {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            scripts.push(ScriptEntry {
                id: stem.to_string(),
                name: title_case(stem),
                path: path.to_string_lossy().into_owned(),
                description: "Deployment helper script".to_string(),
            });
        }
    } else {
        debug!("Scripts directory {:?} does not exist", dir);
    }

    scripts.push(ScriptEntry::shell());
    Ok(scripts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("deploy_code_engine"), "Deploy Code Engine");
        assert_eq!(title_case("SETUP"), "Setup");
    }

    #[test]
    fn test_lists_sorted_shell_scripts_then_shell() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("zeta_rollout.sh"), "echo z\n").unwrap();
        std::fs::write(dir.path().join("alpha_setup.sh"), "echo a\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored\n").unwrap();

        let scripts = list_scripts(dir.path()).unwrap();
        let ids: Vec<&str> = scripts.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["alpha_setup", "zeta_rollout", "shell"]);
        assert_eq!(scripts[0].name, "Alpha Setup");
        assert!(scripts[0].path.ends_with("alpha_setup.sh"));
        assert_eq!(scripts[2].path, "bash");
    }

    #[test]
    fn test_missing_directory_offers_shell_only() {
        let dir = tempdir().unwrap();
        let scripts = list_scripts(&dir.path().join("nope")).unwrap();
        assert_eq!(scripts, vec![ScriptEntry::shell()]);
    }
}

use regex::Regex;
use serde::Serialize;
use std::{fs, io, path::{Path, PathBuf}, sync::OnceLock};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
#[error("failed to list locales in {path}: {source}")]
pub struct LocaleError {
    path: PathBuf,
    source: io::Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Language {
    pub code: String,
    pub name: String,
}

fn name_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"name\s*=\s*"([^"]+)""#).expect("static regex"))
}

/// One entry per `*.ftl` file in `dir`, sorted by code. The display name
/// comes from a `name = "..."` line, else the file stem.
pub fn list(dir: &Path) -> Result<Vec<Language>, LocaleError> {
    let entries = fs::read_dir(dir)
        .map_err(|source| LocaleError { path: dir.to_path_buf(), source })?;

    let mut langs = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let p = entry.path();
        if !p.is_file() || p.extension().and_then(|e| e.to_str()) != Some("ftl") {
            continue;
        }
        let Some(code) = p.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };
        let content = match fs::read_to_string(&p) {
            Ok(c) => c,
            Err(e) => {
                debug!("skipping {}: {e}", p.display());
                continue;
            }
        };
        let name = name_pattern()
            .captures(&content)
            .and_then(|c| c.get(1))
            .map_or_else(|| code.clone(), |m| m.as_str().to_string());
        langs.push(Language { code, name });
    }
    langs.sort_by(|a, b| a.code.cmp(&b.code));
    Ok(langs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_ftl_files_with_names() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("zh_CN.ftl"), "name = \"简体中文\"\nhello = 你好\n").unwrap();
        fs::write(dir.path().join("en_US.ftl"), "hello = Hello\n").unwrap();
        fs::write(dir.path().join("README.txt"), "name = \"nope\"").unwrap();

        let langs = list(dir.path()).unwrap();
        assert_eq!(langs, vec![
            Language { code: "en_US".into(), name: "en_US".into() },
            Language { code: "zh_CN".into(), name: "简体中文".into() },
        ]);
    }

    #[test]
    fn missing_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list(&dir.path().join("nope")).is_err());
    }
}

//! INI file configuration adapter.

use crate::domain::error::RulescanError;
use crate::ports::config_port::ConfigPort;
use configparser::ini::Ini;
use std::path::Path;

pub struct FileConfigAdapter {
    config: Ini,
}

impl FileConfigAdapter {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, RulescanError> {
        let path = path.as_ref();
        let mut config = Ini::new();
        config
            .load(path)
            .map_err(|reason| RulescanError::ConfigParse {
                file: path.display().to_string(),
                reason,
            })?;
        Ok(Self { config })
    }

    pub fn from_string(content: &str) -> Result<Self, String> {
        let mut config = Ini::new();
        config.read(content.to_string())?;
        Ok(Self { config })
    }
}

impl ConfigPort for FileConfigAdapter {
    fn get_string(&self, section: &str, key: &str) -> Option<String> {
        self.config.get(section, key)
    }

    fn sections(&self) -> Vec<String> {
        let mut sections = self.config.sections();
        sections.sort();
        sections
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", content).unwrap();
        file
    }

    #[test]
    fn from_string_parses_config() {
        let content = r#"
[sqlite]
path = /data/bars.db

[scanner]
worker_threads = 4
"#;
        let adapter = FileConfigAdapter::from_string(content).unwrap();
        assert_eq!(
            adapter.get_string("sqlite", "path"),
            Some("/data/bars.db".to_string())
        );
        assert_eq!(
            adapter.get_string("scanner", "worker_threads"),
            Some("4".to_string())
        );
    }

    #[test]
    fn get_string_returns_none_for_missing_key() {
        let adapter = FileConfigAdapter::from_string("[scanner]\nworker_threads = 2\n").unwrap();
        assert_eq!(adapter.get_string("scanner", "missing"), None);
        assert_eq!(adapter.get_string("missing_section", "key"), None);
    }

    #[test]
    fn sections_are_sorted() {
        let adapter = FileConfigAdapter::from_string(
            "[scanner]\nworker_threads = 1\n[environment.prod]\nsupported_rule_types = crp\n[environment.dev]\nsupported_rule_types = volume\n",
        )
        .unwrap();
        assert_eq!(
            adapter.sections(),
            vec!["environment.dev", "environment.prod", "scanner"]
        );
    }

    #[test]
    fn from_file_reads_config() {
        let file = create_temp_config("[repository]\npath = /tmp/rules.db\n");
        let adapter = FileConfigAdapter::from_file(file.path()).unwrap();
        assert_eq!(
            adapter.get_string("repository", "path"),
            Some("/tmp/rules.db".to_string())
        );
    }

    #[test]
    fn from_file_returns_error_for_missing_file() {
        let result = FileConfigAdapter::from_file("/nonexistent/path/config.ini");
        assert!(matches!(result, Err(RulescanError::ConfigParse { .. })));
    }
}

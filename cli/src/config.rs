use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use specql_model::parse::{merge_documents, parse_spec_file};
use specql_model::{EntityCatalog, RegistrySnapshot};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure for specql.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecqlConfig {
    pub project: ProjectConfig,

    #[serde(default)]
    pub specs: Vec<SpecConfig>,

    #[serde(default)]
    pub output: OutputConfig,

    /// Storage locations already assigned to entities, keyed by entity name
    #[serde(default, skip_serializing_if = "RegistrySnapshot::is_empty")]
    pub registry: RegistrySnapshot,

    #[serde(default)]
    pub compiler: CompilerConfig,

    /// Directory spec paths are relative to (the config file's directory)
    #[serde(skip)]
    pub root: PathBuf,
}

/// Project-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
}

/// One spec document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: String,

    /// Write one script instead of one file per action
    #[serde(default)]
    pub single_file: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            single_file: false,
        }
    }
}

fn default_output_dir() -> String {
    "./generated".to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CompilerConfig {
    /// Default cap on recorded batch failures when an action sets none
    #[serde(default = "default_max_errors")]
    pub max_errors: usize,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            max_errors: default_max_errors(),
        }
    }
}

fn default_max_errors() -> usize {
    100
}

pub const SINGLE_FILE_NAME: &str = "actions.sql";

impl SpecqlConfig {
    pub fn new(project_name: impl Into<String>, specs: Vec<SpecConfig>) -> Self {
        Self {
            project: ProjectConfig {
                name: project_name.into(),
            },
            specs,
            output: OutputConfig::default(),
            registry: RegistrySnapshot::default(),
            compiler: CompilerConfig::default(),
            root: PathBuf::from("."),
        }
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config: SpecqlConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.root = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        config.validate()?;
        tracing::debug!(path = %path.display(), specs = config.specs.len(), "loaded config");
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.project.name.trim().is_empty() {
            anyhow::bail!("Project name cannot be empty");
        }

        let mut paths = HashSet::new();
        for spec in &self.specs {
            if spec.path.trim().is_empty() {
                anyhow::bail!("Spec path cannot be empty");
            }
            if !paths.insert(spec.path.as_str()) {
                anyhow::bail!("Duplicate spec path: {}", spec.path);
            }
        }

        if self.output.dir.trim().is_empty() {
            anyhow::bail!("Output directory cannot be empty");
        }
        if self.compiler.max_errors == 0 {
            anyhow::bail!("compiler.max_errors must be at least 1");
        }

        Ok(())
    }

    pub fn spec_paths(&self) -> Vec<PathBuf> {
        self.specs.iter().map(|s| self.root.join(&s.path)).collect()
    }

    /// Output directory, relative to the config file unless overridden
    pub fn output_dir(&self, override_dir: Option<&str>) -> PathBuf {
        match override_dir {
            Some(dir) => PathBuf::from(dir),
            None => self.root.join(&self.output.dir),
        }
    }

    /// Parse every spec document and build the catalog with the configured
    /// registry overrides.
    pub fn load_catalog(&self) -> Result<EntityCatalog> {
        if self.specs.is_empty() {
            anyhow::bail!("No specs configured. Add a [[specs]] entry to specql.toml");
        }
        let mut docs = Vec::with_capacity(self.specs.len());
        for path in self.spec_paths() {
            docs.push(parse_spec_file(&path)?);
        }
        EntityCatalog::with_registry(merge_documents(docs), self.registry.clone())
            .context("Failed to build entity catalog")
    }
}

/// Find spec documents (`*.json`) under `base_path` (default `./specs`).
pub fn discover_spec_files(base_path: Option<&Path>) -> Result<Vec<PathBuf>> {
    let base = base_path.unwrap_or_else(|| Path::new("specs"));
    let mut found = Vec::new();
    if base.is_dir() {
        discover_recursive(base, &mut found, 0)?;
    }
    found.sort();
    Ok(found)
}

fn discover_recursive(dir: &Path, found: &mut Vec<PathBuf>, depth: usize) -> Result<()> {
    if depth > 4 {
        return Ok(());
    }
    let entries =
        fs::read_dir(dir).with_context(|| format!("Failed to read directory: {}", dir.display()))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            discover_recursive(&path, found, depth + 1)?;
        } else if path.extension().map_or(false, |ext| ext == "json") {
            found.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config: SpecqlConfig = toml::from_str(
            r#"
            [project]
            name = "crm"

            [[specs]]
            path = "specs/crm.json"
            "#,
        )
        .unwrap();
        assert_eq!(config.output.dir, "./generated");
        assert!(!config.output.single_file);
        assert_eq!(config.compiler.max_errors, 100);
        assert!(config.registry.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_registry_overrides_parse() {
        let config: SpecqlConfig = toml::from_str(
            r#"
            [project]
            name = "crm"

            [output]
            dir = "sql"
            single_file = true

            [registry.Contact]
            schema = "people"
            table = "tb_person"

            [compiler]
            max_errors = 25
            "#,
        )
        .unwrap();
        assert!(config.output.single_file);
        assert_eq!(config.compiler.max_errors, 25);
        let (_, entry) = config.registry.entries().next().unwrap();
        assert_eq!(entry.table.as_deref(), Some("tb_person"));
    }

    #[test]
    fn test_validate_rejects_bad_config() {
        let mut config = SpecqlConfig::new(
            "crm",
            vec![
                SpecConfig {
                    path: "a.json".to_string(),
                },
                SpecConfig {
                    path: "a.json".to_string(),
                },
            ],
        );
        assert!(config.validate().unwrap_err().to_string().contains("Duplicate"));

        config.specs.pop();
        config.compiler.max_errors = 0;
        assert!(config.validate().is_err());

        config.compiler.max_errors = 1;
        config.project.name = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_paths_are_relative_to_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("specql.toml");
        fs::write(
            &path,
            "[project]\nname = \"crm\"\n\n[[specs]]\npath = \"specs/crm.json\"\n",
        )
        .unwrap();
        let config = SpecqlConfig::load(&path).unwrap();
        assert_eq!(config.spec_paths(), vec![dir.path().join("specs/crm.json")]);
        assert_eq!(config.output_dir(None), dir.path().join("./generated"));
        assert_eq!(config.output_dir(Some("out")), PathBuf::from("out"));
    }
}

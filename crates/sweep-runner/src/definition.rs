//! Run-definition documents: `strategy`, `defaults` and `output` sections.

use crate::error::ConfigError;
use crate::store::{OutputFormat, WriteMode};
use crate::strategy::Strategy;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub struct RunDefinition {
    strategies: Option<Value>,
    variation: Option<Value>,
    defaults: Value,
    output: Option<Value>,
    stem: Option<String>,
}

impl RunDefinition {
    pub fn from_yaml_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut definition = Self::from_yaml_str(&raw)?;
        definition.stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(String::from);
        Ok(definition)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let yaml_value: serde_yaml::Value = serde_yaml::from_str(raw)?;
        let json_value: Value = serde_json::to_value(yaml_value)?;
        Self::from_value(json_value)
    }

    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        let Value::Object(mut doc) = value else {
            return Err(ConfigError::MissingSection("document must be a mapping"));
        };
        let strategies = doc.remove("strategy");
        let variation = doc.remove("variation");
        match (&strategies, &variation) {
            (None, None) => return Err(ConfigError::NoStrategy),
            (None, Some(_)) => warn!("`variation` is deprecated; use `strategy`"),
            (Some(_), Some(_)) => warn!("ignoring legacy `variation` next to `strategy`"),
            (Some(_), None) => {}
        }
        let defaults = match doc.remove("defaults") {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(v @ Value::Object(_)) => v,
            Some(_) => return Err(ConfigError::MissingSection("defaults")),
        };
        let output = match doc.remove("output") {
            None | Some(Value::Null) => None,
            Some(v @ Value::Object(_)) => Some(v),
            Some(_) => return Err(ConfigError::MissingSection("output")),
        };
        Ok(Self {
            strategies,
            variation,
            defaults,
            output,
            stem: None,
        })
    }

    pub fn defaults(&self) -> &Value {
        &self.defaults
    }

    /// Names listed under `strategy`; `sequence` for a legacy document.
    pub fn strategy_names(&self) -> Vec<String> {
        match &self.strategies {
            Some(Value::Object(map)) => map.keys().cloned().collect(),
            Some(_) => Vec::new(),
            None => vec!["sequence".to_string()],
        }
    }

    pub fn strategy(&self, name: Option<&str>) -> Result<Strategy, ConfigError> {
        match (&self.strategies, &self.variation) {
            (Some(strategies), _) => Strategy::load(strategies, name),
            (None, Some(legacy)) => match name {
                Some(name) if name != "sequence" => {
                    Err(ConfigError::MissingStrategy(name.to_string()))
                }
                _ => Strategy::from_legacy(legacy),
            },
            (None, None) => Err(ConfigError::NoStrategy),
        }
    }

    /// Resolved output settings; `None` when the document has no `output`
    /// section and no override is given.
    pub fn output_settings(
        &self,
        override_name: Option<&str>,
    ) -> Result<Option<OutputSettings>, ConfigError> {
        if self.output.is_none() && override_name.is_none() {
            return Ok(None);
        }
        let empty = json!({});
        let section = self.output.as_ref().unwrap_or(&empty);
        OutputSettings::resolve(section, override_name, self.stem.as_deref()).map(Some)
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawOutput {
    format: Option<String>,
    name: Option<String>,
    file_name: Option<String>,
    path: Option<String>,
    force: Option<bool>,
    force_overwrite: Option<bool>,
    mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputSettings {
    pub format: OutputFormat,
    /// File stem, without extension.
    pub name: String,
    pub path: Option<PathBuf>,
    pub force: bool,
    pub mode: WriteMode,
}

impl OutputSettings {
    pub fn memory() -> Self {
        Self {
            format: OutputFormat::Memory,
            name: String::new(),
            path: None,
            force: false,
            mode: WriteMode::Append,
        }
    }

    /// Name priority: `override_name`, then `name`, then `fallback_stem`
    /// (usually the definition file's stem). An override may carry a
    /// directory and an extension; the extension wins over `format`.
    pub fn resolve(
        section: &Value,
        override_name: Option<&str>,
        fallback_stem: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let mut raw: RawOutput = serde_json::from_value(section.clone())?;
        if let Some(force) = raw.force_overwrite.take() {
            warn!("output key `force_overwrite` is deprecated; use `force`");
            raw.force = raw.force.or(Some(force));
        }
        if let Some(name) = raw.file_name.take() {
            warn!("output key `file_name` is deprecated; use `name`");
            raw.name = raw.name.or(Some(name));
        }

        let mut format = raw.format.as_deref().map(parse_format).transpose()?;
        let mut path = raw.path.map(PathBuf::from);
        let name = match override_name {
            Some(given) => {
                let given = Path::new(given);
                if let Some(head) = given.parent().filter(|h| !h.as_os_str().is_empty()) {
                    if path.is_some() {
                        return Err(ConfigError::Output(
                            "contradictory path specifications".to_string(),
                        ));
                    }
                    path = Some(head.to_path_buf());
                }
                if let Some(ext) = given.extension().and_then(|e| e.to_str()) {
                    format = Some(parse_format(ext)?);
                }
                file_stem(given)?
            }
            None => {
                let name = raw
                    .name
                    .or_else(|| fallback_stem.map(String::from))
                    .ok_or_else(|| ConfigError::Output("no output name given".to_string()))?;
                let name = Path::new(&name);
                if format.is_none() {
                    if let Some(ext) = name.extension().and_then(|e| e.to_str()) {
                        format = Some(parse_format(ext)?);
                    }
                }
                file_stem(name)?
            }
        };
        let mode = match raw.mode.as_deref() {
            Some(raw_mode) => WriteMode::parse(raw_mode)
                .ok_or_else(|| ConfigError::Output(format!("unknown write mode `{}`", raw_mode)))?,
            None => WriteMode::Append,
        };

        Ok(Self {
            format: format.unwrap_or(OutputFormat::Group),
            name,
            path,
            force: raw.force.unwrap_or(false),
            mode,
        })
    }

    /// Full path of the output file.
    pub fn file(&self) -> PathBuf {
        let file_name = match self.format.extension() {
            Some(ext) => format!("{}.{}", self.name, ext),
            None => self.name.clone(),
        };
        match &self.path {
            Some(dir) => dir.join(file_name),
            None => PathBuf::from(file_name),
        }
    }

    pub fn to_value(&self) -> Value {
        json!({
            "format": self.format.as_str(),
            "name": self.name,
            "path": self.path.as_ref().map(|p| p.display().to_string()),
            "force": self.force,
            "mode": match self.mode {
                WriteMode::Append => "append",
                WriteMode::Write => "write",
            },
        })
    }
}

fn parse_format(raw: &str) -> Result<OutputFormat, ConfigError> {
    OutputFormat::parse(raw).map_err(|e| ConfigError::Output(e.to_string()))
}

fn file_stem(name: &Path) -> Result<String, ConfigError> {
    name.file_stem()
        .and_then(|s| s.to_str())
        .map(String::from)
        .ok_or_else(|| ConfigError::Output(format!("invalid output name `{}`", name.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
strategy:
  sequence:
    initial.phi: [0.4, 0.6, 0.8]
  matrix-fine:
    initial.phi: [0.4, 0.6]
    initial.P: [1, 2]
defaults:
  initial:
    phi: 1.0
    P: 1 atm
output:
  format: csv
  force_overwrite: true
"#;

    #[test]
    fn loads_named_strategies_and_defaults() {
        let definition = RunDefinition::from_yaml_str(DOC).expect("definition");
        assert_eq!(definition.strategy_names(), ["sequence", "matrix-fine"]);
        assert_eq!(definition.defaults()["initial"]["P"], json!("1 atm"));
        let strategy = definition.strategy(Some("matrix-fine")).expect("matrix");
        assert_eq!(strategy.tasks().len(), 4);
        assert!(matches!(
            definition.strategy(None),
            Err(ConfigError::AmbiguousStrategy(_))
        ));
    }

    #[test]
    fn legacy_variation_becomes_sequence() {
        let doc = "variation:\n  entry: initial.phi\n  values: [0.5, 1.5]\ndefaults:\n  initial:\n    phi: 1.0\n";
        let definition = RunDefinition::from_yaml_str(doc).expect("definition");
        let strategy = definition.strategy(None).expect("legacy");
        assert_eq!(strategy.name(), "sequence");
        assert_eq!(strategy.task_ids(), ["initial.phi_0.5", "initial.phi_1.5"]);
        assert!(definition.strategy(Some("matrix")).is_err());
    }

    #[test]
    fn missing_strategy_is_rejected() {
        let err = RunDefinition::from_yaml_str("defaults: {a: 1}\n").expect_err("no strategy");
        assert!(matches!(err, ConfigError::NoStrategy));
        assert!(RunDefinition::from_yaml_str("- 1\n- 2\n").is_err());
    }

    #[test]
    fn output_name_priority() {
        let definition = RunDefinition::from_yaml_str(DOC).expect("definition");
        // no `name` and no file stem to fall back on
        assert!(definition.output_settings(None).is_err());

        let settings = definition
            .output_settings(Some("results/run.json"))
            .expect("settings")
            .expect("some");
        assert_eq!(settings.format, OutputFormat::Group);
        assert_eq!(settings.name, "run");
        assert!(settings.force);
        assert_eq!(settings.file(), PathBuf::from("results/run.json"));

        let section = json!({"name": "flames.h5", "path": "out"});
        let settings = OutputSettings::resolve(&section, None, Some("stem")).expect("settings");
        assert_eq!(settings.format, OutputFormat::Group);
        assert_eq!(settings.file(), PathBuf::from("out/flames.json"));

        let settings = OutputSettings::resolve(&json!({}), None, Some("ignition")).expect("stem");
        assert_eq!(settings.file(), PathBuf::from("ignition.json"));
        assert_eq!(settings.mode, WriteMode::Append);
    }

    #[test]
    fn contradictory_paths_are_rejected() {
        let section = json!({"path": "a"});
        let err = OutputSettings::resolve(&section, Some("b/out.csv"), None).expect_err("conflict");
        assert!(matches!(err, ConfigError::Output(_)));
        let settings = OutputSettings::resolve(&section, Some("out.csv"), None).expect("plain name");
        assert_eq!(settings.file(), PathBuf::from("a/out.csv"));
    }

    #[test]
    fn invalid_mode_and_format() {
        assert!(OutputSettings::resolve(&json!({"name": "x", "mode": "z"}), None, None).is_err());
        assert!(OutputSettings::resolve(&json!({"name": "x.xlsx"}), None, None).is_err());
        let settings =
            OutputSettings::resolve(&json!({"name": "x", "mode": "w"}), None, None).expect("mode");
        assert_eq!(settings.mode, WriteMode::Write);
    }

    #[test]
    fn no_output_section_means_no_settings() {
        let definition =
            RunDefinition::from_yaml_str("strategy:\n  sequence:\n    a: [1]\ndefaults:\n  a: 0\n")
                .expect("definition");
        assert_eq!(definition.output_settings(None).expect("settings"), None);
    }
}

use depres::graph::{CapabilityRequest, Request};
use depres::model::{Options, ParameterPoint, RunOptions};
use depres::Dispatch;
use directories::ProjectDirs;
use indexmap::IndexMap;
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to serialize run file: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("{} already exists", .0.display())]
    Exists(PathBuf),
    #[error("run file has no [[point]] entries")]
    NoPoints,
}

/// A backend the run expects. If nothing with this name is loaded it is recorded as absent.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExpectedBackend {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    "0.0.0".to_string()
}

/// One parameter point: parameter name -> value, in the order the run file lists them.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct PointConfig {
    #[serde(flatten)]
    pub values: IndexMap<String, f64>,
}

/// Contents of a TOML run file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub model: String,
    #[serde(default)]
    pub dispatch: Dispatch,
    #[serde(default)]
    pub request: Vec<CapabilityRequest>,
    #[serde(default)]
    pub pins: BTreeMap<String, String>,
    #[serde(default)]
    pub backend_pins: BTreeMap<String, String>,
    #[serde(default)]
    pub options: RunOptions,
    #[serde(default)]
    pub plugin_dir: Option<PathBuf>,
    #[serde(default)]
    pub backend: Vec<ExpectedBackend>,
    #[serde(default)]
    pub point: Vec<PointConfig>,
}

impl RunConfig {
    /// A run over the toy singlet model exercising every engine path.
    pub fn example() -> Self {
        let mut options = RunOptions {
            global: Options::new().with("tolerance", 1e-4),
            ..RunOptions::default()
        };
        options.nodes.insert(
            "Relic::RD_oh2_iterative".to_string(),
            Options::new().with("max_iterations", 30),
        );

        Self {
            model: "SingletDM_Z2".to_string(),
            dispatch: Dispatch::Serial,
            request: vec![
                CapabilityRequest::new("lnL_oh2"),
                CapabilityRequest::new("lnL_Higgs_invisible"),
            ],
            pins: BTreeMap::from([(
                "RD_estimate".to_string(),
                "RD_estimate_simple".to_string(),
            )]),
            backend_pins: BTreeMap::new(),
            options,
            plugin_dir: None,
            backend: vec![ExpectedBackend {
                name: "MonteCarloLib".to_string(),
                version: "1.0.0".to_string(),
            }],
            point: vec![
                PointConfig {
                    values: IndexMap::from([
                        ("m_S".to_string(), 62.0),
                        ("lambda_hS".to_string(), 0.01),
                    ]),
                },
                PointConfig {
                    values: IndexMap::from([
                        ("m_S".to_string(), 300.0),
                        ("lambda_hS".to_string(), 0.1),
                    ]),
                },
                PointConfig {
                    values: IndexMap::from([
                        ("m_S".to_string(), -5.0),
                        ("lambda_hS".to_string(), 0.1),
                    ]),
                },
            ],
        }
    }

    pub fn to_request(&self) -> Request {
        Request {
            model: self.model.clone(),
            requested: self.request.clone(),
            pins: self.pins.clone(),
            backend_pins: self.backend_pins.clone(),
            options: self.options.clone(),
        }
    }

    pub fn points(&self) -> Result<Vec<ParameterPoint>, ConfigError> {
        if self.point.is_empty() {
            return Err(ConfigError::NoPoints);
        }
        Ok(self
            .point
            .iter()
            .map(|p| ParameterPoint::new(self.model.clone(), p.values.clone()))
            .collect())
    }
}

/// `<config dir>/run.toml`, creating the directory if needed.
pub fn default_run_path() -> Option<PathBuf> {
    let proj_dirs = ProjectDirs::from("org", "depres", "depres")?;
    let config_dir = proj_dirs.config_dir();
    if !config_dir.exists() {
        if let Err(e) = fs::create_dir_all(config_dir) {
            error!("Failed to create config directory: {}", e);
            return None;
        }
    }
    Some(config_dir.join("run.toml"))
}

pub fn load_run_config(path: &Path) -> Result<RunConfig, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    info!("Loaded run file {}", path.display());
    Ok(config)
}

pub fn save_run_config(
    config: &RunConfig,
    path: &Path,
    overwrite: bool,
) -> Result<(), ConfigError> {
    if path.exists() && !overwrite {
        return Err(ConfigError::Exists(path.to_path_buf()));
    }
    let text = toml::to_string_pretty(config)?;
    fs::write(path, text).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    info!("Run file saved to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUN: &str = r#"
model = "SingletDM"
dispatch = "parallel"

[[request]]
capability = "lnL_oh2"

[[request]]
capability = "Higgs_invisible_width"
type = "double"

[pins]
RD_estimate = "Relic::RD_estimate_simple"

[options.global]
tolerance = 1e-3

[options.nodes."Relic::RD_oh2_iterative"]
max_iterations = 12

[[backend]]
name = "MonteCarloLib"
version = "1.0.0"

[[point]]
m_S = 100.0
lambda_hS = 0.2
"#;

    #[test]
    fn test_parse_run_file() {
        let config: RunConfig = toml::from_str(RUN).unwrap();
        assert_eq!(config.dispatch, Dispatch::Parallel);
        assert_eq!(config.request[1].type_name.as_deref(), Some("double"));

        let request = config.to_request();
        assert_eq!(request.pins["RD_estimate"], "Relic::RD_estimate_simple");
        let node = request.options.for_node("Relic::RD_oh2_iterative");
        assert_eq!(node.get::<u32>(&["max_iterations"]).unwrap(), Some(12));
        assert_eq!(node.get::<f64>(&["tolerance"]).unwrap(), Some(1e-3));

        let points = config.points().unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].model(), "SingletDM");
        assert_eq!(points[0].get("lambda_hS"), Some(0.2));
    }

    #[test]
    fn test_example_survives_toml() {
        let example = RunConfig::example();
        let text = toml::to_string_pretty(&example).unwrap();
        let parsed: RunConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, example);
    }

    #[test]
    fn test_point_keeps_declaration_order() {
        let config: RunConfig =
            toml::from_str("model = \"M\"\n\n[[point]]\nz = 1.0\na = 2.0\n").unwrap();
        let points = config.points().unwrap();
        let names: Vec<&str> = points[0].values().iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, vec!["z", "a"]);

        let text = toml::to_string_pretty(&config).unwrap();
        assert!(text.find("z = 1.0").unwrap() < text.find("a = 2.0").unwrap());
    }

    #[test]
    fn test_points_are_required() {
        let config: RunConfig = toml::from_str("model = \"SingletDM\"").unwrap();
        assert!(matches!(config.points(), Err(ConfigError::NoPoints)));
    }
}

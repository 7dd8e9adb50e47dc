use crate::engine::EngineKind;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use rust_embed::RustEmbed;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use strum::{Display, EnumString};

const CONFIG_FILE_NAME: &str = "gradle-oci.toml";
const ENV_PREFIX: &str = "GRADLE_OCI_";

#[derive(RustEmbed)]
#[folder = "src/conf/"]
#[include = "*.toml"]
struct EmbeddedConfigFS;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub general: General,
    pub defaults: Defaults,
    pub engine: Engine,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct General {
    pub log_level: String,
    pub log_format: LogFormat,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Values used when the matching flag isn't passed on the command line.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Defaults {
    pub java_version: String,
    pub registry: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Engine {
    pub kind: EngineKind,
    pub docker: Option<DockerEngine>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct DockerEngine {
    /// The total amount of time any request is allowed to be pending for in seconds.
    pub timeout: u64,
    pub always_pull: bool,
    pub keep_containers: bool,
}

impl Config {
    /// returns the embedded default configuration file.
    fn default_config() -> Result<String, figment::Error> {
        let config_file = EmbeddedConfigFS::get("default_config.toml")
            .ok_or_else(|| figment::Error::from("embedded default config not found".to_string()))?;

        String::from_utf8(config_file.data.into_owned())
            .map_err(|e| figment::Error::from(format!("embedded default config is not utf-8; {e}")))
    }

    /// returns the default configuration paths that are searched in case user does not specify.
    fn config_paths() -> Vec<PathBuf> {
        let mut paths = vec![];

        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join(CONFIG_FILE_NAME));
        }

        paths.push(PathBuf::from(CONFIG_FILE_NAME));
        paths
    }

    fn figment(path_override: Option<&Path>) -> Result<Figment, figment::Error> {
        // First parse embedded config defaults.
        let mut figment = Figment::from(Toml::string(&Self::default_config()?));

        // Then parse user given paths. Later files win over earlier ones.
        match path_override {
            Some(path) => {
                if !path.exists() {
                    return Err(figment::Error::from(format!(
                        "config file '{}' not found",
                        path.to_string_lossy()
                    )));
                }
                figment = figment.merge(Toml::file(path));
            }
            None => {
                for path in Self::config_paths() {
                    figment = figment.merge(Toml::file(path));
                }
            }
        }

        // Lastly env vars always override everything.
        Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// returns a correctly deserialized config from the embedded defaults, configuration files and environment.
    pub fn load(path_override: Option<&Path>) -> Result<Self, figment::Error> {
        Self::figment(path_override)?.extract()
    }
}

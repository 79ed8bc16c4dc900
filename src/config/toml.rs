use crate::config::Configuration;
use crate::error::ConfigError;
use std::path::Path;
use std::str::FromStr;
use toml_edit::DocumentMut;

#[derive(Debug, Clone)]
struct TomlConfiguration {
    document: DocumentMut,
}

impl TomlConfiguration {
    fn load_toml<P: AsRef<Path>>(file: P) -> Result<Self, ConfigError> {
        let document = std::fs::read_to_string(file)?;
        let document = DocumentMut::from_str(&document)?;
        Ok(Self { document })
    }

    fn into_configuration(self) -> Result<Configuration, ConfigError> {
        Ok(toml_edit::de::from_document(self.document)?)
    }
}

/// Reads the TOML configuration file at `file`.
pub fn load<P: AsRef<Path>>(file: P) -> Result<Configuration, ConfigError> {
    TomlConfiguration::load_toml(file)?.into_configuration()
}

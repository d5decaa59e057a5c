//! YAML configuration.
//!
//! - [`types`]: config file entries and validated server configs
//! - [`validate`]: entry validation and server config creation

mod types;
mod validate;

pub use types::*;
pub use validate::create_server_configs;

/// Loads configuration files from the provided paths.
///
/// Reads each file, parses it as YAML, and returns the combined list of entries.
pub async fn load_configs(args: &[String]) -> std::io::Result<Vec<ServerEntry>> {
    let mut all_entries = vec![];
    for config_filename in args {
        let config_bytes = match tokio::fs::read(config_filename).await {
            Ok(b) => b,
            Err(e) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("Could not read config file {config_filename}: {e}"),
                ));
            }
        };

        let config_str = match String::from_utf8(config_bytes) {
            Ok(s) => s,
            Err(e) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("Could not parse config file {config_filename} as UTF8: {e}"),
                ));
            }
        };

        let mut entries = match serde_yaml::from_str::<Vec<ServerEntry>>(&config_str) {
            Ok(c) => c,
            Err(e) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("Could not parse config file {config_filename} as config YAML: {e}"),
                ));
            }
        };
        all_entries.append(&mut entries)
    }

    Ok(all_entries)
}

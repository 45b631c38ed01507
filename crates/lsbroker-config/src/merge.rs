use crate::config::Config;
use crate::error::ConfigError;

/// Layer a TOML fragment over `base`.
///
/// Tables merge key by key, so an overlay that only names
/// `[servers.rust] args` keeps the base entry's `command`. Any other
/// value in the overlay replaces the base value outright.
pub fn merge_configs(base: &Config, overlay_toml: &str) -> Result<Config, ConfigError> {
    let mut merged = toml::Value::try_from(base).map_err(parse_err)?;
    let overlay: toml::Table = toml::from_str(overlay_toml).map_err(parse_err)?;

    overlay_table(&mut merged, overlay);

    merged
        .try_into()
        .map_err(|e: toml::de::Error| parse_err(e))
}

fn parse_err(e: impl std::fmt::Display) -> ConfigError {
    ConfigError::parse(e)
}

fn overlay_table(base: &mut toml::Value, overlay: toml::Table) {
    let toml::Value::Table(base_table) = base else {
        *base = toml::Value::Table(overlay);
        return;
    };
    for (key, value) in overlay {
        match (base_table.get_mut(&key), value) {
            (Some(existing @ toml::Value::Table(_)), toml::Value::Table(nested)) => {
                overlay_table(existing, nested);
            }
            (_, value) => {
                base_table.insert(key, value);
            }
        }
    }
}

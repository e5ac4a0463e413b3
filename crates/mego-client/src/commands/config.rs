//! Configuration commands.

use crate::config::Config;
use crate::error::ClientResult;

/// Dump the current configuration to stdout.
pub fn dump(config: &Config) -> ClientResult<()> {
    let toml_str = config.to_toml()?;
    println!("# config.toml ({})", Config::default_path().display());
    println!("{}", toml_str);
    Ok(())
}

/// Show the configuration file path.
pub fn path() -> ClientResult<()> {
    println!("config: {}", Config::default_path().display());
    Ok(())
}

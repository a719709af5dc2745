/// Configuration system
///
/// - `macros`: the `config_struct!` macro used by every section
/// - `schemas`: section definitions with embedded defaults
/// - `utils`: TOML loading and validation
pub mod macros;
pub mod schemas;
pub mod utils;

pub use schemas::*;
pub use utils::{load_config, load_config_from_path, CONFIG_FILE_PATH};

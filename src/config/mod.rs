mod loader;
mod types;

pub use loader::{default_config_path, load_config, validate_session_options};
pub use types::*;

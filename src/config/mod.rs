pub mod loader;
pub mod types;

pub use loader::{get_config_path, load_config, sandbox_root};
pub use types::{BackendType, RunletConfig};

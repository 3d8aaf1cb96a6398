mod bubblewrap;
pub(crate) mod process;

#[cfg(feature = "docker")]
mod docker;

pub use bubblewrap::BubblewrapBackend;
pub use process::ProcessBackend;

#[cfg(feature = "docker")]
pub use docker::DockerBackend;

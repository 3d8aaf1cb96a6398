pub mod backends;
mod cgroup;
mod factory;
mod limits;
mod provisioner;
mod runtime;
mod traits;

pub use cgroup::{Cgroup, CgroupRoot};
pub use factory::{available_backends, create_backend, BackendInfo};
pub use limits::{LaunchSpec, Rlimit, RlimitResource, SandboxLimits};
pub use provisioner::{Provisioner, Sandbox, SandboxLease, SandboxRequest};
pub use runtime::Language;
pub use traits::{BackendCapabilities, IsolationBackend, SandboxContext, SandboxResources};

//! Generate, deploy and control OS services across init systems
//! (systemd, upstart, SysV, nssm, supervisor, runit) through one API.

pub mod artifact;
pub mod cmd;
pub mod config;
pub mod descriptor;
pub mod detect;
pub mod distro;
pub mod error;
pub mod host;
pub mod init;
pub mod manager;
pub mod platform;
pub mod status;
pub mod template;

#[cfg(test)]
mod test_support;

pub use descriptor::{LimitKind, ServiceDescriptor};
pub use error::{Result, ServError};
pub use host::Host;
pub use init::{InitSystem, InitSystemKind, Transition};
pub use manager::{CreateOptions, ServiceManager};
pub use status::{ServiceState, StatusRecord};

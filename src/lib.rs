//! Core library for the satchel bundling and launch tool.
//!
//! A payload command and its dependencies (local directories, git
//! repositories, object-store paths) are packaged into one self-extracting
//! bundle by the [`archive`] module. [`backend`] runs that bundle on the local
//! shell, an SSH host or a Docker container, and [`cloud`] provisions spot or
//! compute instances that run it and sync outputs back to object storage.
//! [`launch::Launcher`] ties building and launching together.

pub mod archive;
pub mod backend;
pub mod cloud;
pub mod config;
pub mod credentials;
pub mod launch;
pub mod mount;
pub mod process;
pub mod runner;
pub mod script;
pub mod store;
pub mod test_support;
pub mod util;

pub use archive::{
    ArchiveBuilder, ArchiveError, ArchiveSpec, BuiltArchive, ContainerEngine, ContainerSpec,
    SENTINEL, strip_banner,
};
pub use backend::{
    BackendError, BackendOptions, DockerBackend, LaunchBackend, LaunchOutcome, LaunchRequest,
    LocalBackend, SshBackend, SshOptions,
};
pub use cloud::{
    CloudError, ComputeConfig, ComputeInstanceBackend, GpuSpec, Placement, ProvisionReceipt,
    SpotConfig, SpotInstanceBackend,
};
pub use config::{ConfigError, SatchelConfig};
pub use credentials::{
    Autoconfig, AwsCredentials, CredentialsError, GcpCredentials, SSH_IDENTITY_ENV, SshCredentials,
};
pub use launch::{LaunchError, Launcher, RunOptions};
pub use mount::{Direction, GitMount, LocalMount, Mount, MountError, ObjectStoreMount};
pub use process::{GroupProcessLauncher, ProcessError, ProcessLauncher, ProcessSpec};
pub use runner::{CommandRunner, EnvCommandRunner, ProcessCommandRunner, RunnerError};
pub use store::{GcsStore, ObjectStore, S3Store, StoreKind, StoreLocation};

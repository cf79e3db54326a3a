pub mod config;
pub mod coordinator;
pub mod detector;
pub mod error;
pub mod guard;
pub mod link;
pub mod logging;
pub mod paths;
pub mod provider;
pub mod secret;
pub mod workflow;
pub mod workspace;

pub use config::{CapsuleConfig, ConfigFormat, ContainerCfg, GuardCfg, RetryCfg, VolumeCfg};
pub use coordinator::{
    lock_volume, BootstrapRequest, LifecycleCoordinator, LockReport, LockStatus, SessionReport,
    UnlockReport, UnlockStatus,
};
pub use detector::{Check, EnvironmentState, RuntimeHealth, StateDetector};
pub use error::{CapsuleError, CapsuleResult};
pub use guard::{ShutdownGuard, ShutdownSignal};
pub use link::LinkStatus;
pub use paths::{VolumeLocator, VolumeScope};
pub use provider::{
    ContainerConfig, ContainerDriver, ContainerState, MountOutcome, VolumeDriver,
};
pub use secret::{Secret, SecretPrompt};
pub use workflow::{WorkflowEvent, WorkflowLevel, WorkflowReport};
pub use workspace::Workspace;

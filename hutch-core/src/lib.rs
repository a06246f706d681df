pub mod config;
pub mod container;
pub mod ipc;
pub mod model;

pub use config::{HostCommandSpec, HutchConfig, load_config};
pub use container::{
    ContainerInput, ContainerOutput, ContainerStatus, OUTPUT_END_MARKER, OUTPUT_START_MARKER,
    OutputScanner, ScannedLine, VolumeMount,
};
pub use ipc::{CanvasPatch, IpcGroupContext, IpcRequest, IpcResponse};
pub use model::{
    AdditionalMount, ChatInfo, ContainerConfig, ContextMode, MountAllowlistEntry,
    RegisteredGroup, ScheduleKind, ScheduledTask, TaskStatus,
};

// ABOUTME: Sandbox engines for the hatch worker
// ABOUTME: Engine/SandboxBuilder/Sandbox contracts, admission control and the docker and mock backends

pub mod admission;
pub mod builder;
pub mod engines;
pub mod error;
pub mod result;
pub mod validation;

pub use admission::{Admission, AdmissionGuard};
pub use builder::{BuilderCore, Mount, SandboxConfig, StartedBuilder};
pub use engines::{
    DockerEngine, DockerEngineConfig, DockerImage, DockerVolume, Engine, MockEngine,
    MockEngineConfig, MockImage, MockVolume, ProxyHandler, ProxyRequest, ProxyResponse, Sandbox,
    SandboxBuilder, SandboxOptions, Volume,
};
pub use error::{EngineError, Result};
pub use result::{ArtifactSource, ResultSet};

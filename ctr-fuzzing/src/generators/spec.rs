// ctr-fuzzing/src/generators/spec.rs
//! Generated container specifications
//!
//! A deliberately small slice of a runtime spec: enough structure for the
//! daemon to parse and reject in interesting ways.

use std::collections::BTreeMap;

use arbitrary::Arbitrary;
use serde::Serialize;

/// Runtime specification handed to container creation
#[derive(Debug, Clone, Default, PartialEq, Eq, Arbitrary, Serialize)]
pub struct ContainerSpec {
    pub hostname: String,
    pub process: ProcessSpec,
    pub root: RootSpec,
    pub mounts: Vec<MountSpec>,
    pub annotations: BTreeMap<String, String>,
}

/// Process to run inside the container
#[derive(Debug, Clone, Default, PartialEq, Eq, Arbitrary, Serialize)]
pub struct ProcessSpec {
    pub terminal: bool,
    pub user: UserSpec,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Arbitrary, Serialize)]
pub struct UserSpec {
    pub uid: u32,
    pub gid: u32,
}

/// Root filesystem
#[derive(Debug, Clone, Default, PartialEq, Eq, Arbitrary, Serialize)]
pub struct RootSpec {
    pub path: String,
    pub readonly: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Arbitrary, Serialize)]
pub struct MountSpec {
    pub destination: String,
    pub source: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub options: Vec<String>,
}

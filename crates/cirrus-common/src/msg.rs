//! JSON control messages for the daemon and file endpoints

use serde::{Deserialize, Serialize};

/// Control action carried by a `PUT /v1/daemon` request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Terminate the process through the uniform signal path
    Shutdown,
    /// Proxy only: push the current cluster map to every target
    Syncmap,
}

/// Body of `PUT /v1/daemon`
///
/// Unknown actions fail deserialization and are rejected as protocol
/// errors at the request boundary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionMsg {
    pub action: Action,
    #[serde(default)]
    pub param1: String,
    #[serde(default)]
    pub param2: String,
}

/// What a `GET /v1/daemon` request is asking for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum What {
    Config,
    Stats,
}

/// Body of `GET /v1/daemon`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetMsg {
    pub what: What,
    #[serde(default)]
    pub param1: String,
    #[serde(default)]
    pub param2: String,
}

/// Body of `PUT /v1/files/{bucket}/{object}` - intra-cluster copy
///
/// The serving node must be either the source or the destination.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CopyMsg {
    pub from_id: String,
    pub to_id: String,
}

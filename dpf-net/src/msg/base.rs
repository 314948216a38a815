//! Messages of the base, data tree and file transfer procedures.

use dpf_core::EntityId;

use crate::msg::{Empty, EntityRef, Method, Request};

/// Requests information about the server, sent first on every new session.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerInfoRequest {}
impl Request for ServerInfoRequest {
    const METHOD: Method = Method::GetServerInfo;
    type Response = ServerInfo;
}

/// Response to `ServerInfoRequest`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub ip: String,
    pub port: u16,
    pub pid: u32,
    pub version_major: u32,
    pub version_minor: u32,
    /// Full dotted version string, may include a patch component
    pub version: String,
    pub os: String,
    /// Optional features advertised by the server
    pub capabilities: Vec<String>,
}

impl ServerInfo {
    /// Version string, preferring the full form when the server sends one.
    pub fn version_string(&self) -> String {
        if self.version.is_empty() {
            format!("{}.{}", self.version_major, self.version_minor)
        } else {
            self.version.clone()
        }
    }
}

/// Licensing context as sent over the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextMsg {
    /// `PREMIUM` or `ENTRY`
    pub licensing: String,
    /// Content of the plugin configuration document, if any
    pub xml: Option<String>,
}

/// Initializes an in-process server with a context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InitializeRequest {
    pub context: ContextMsg,
}
impl Request for InitializeRequest {
    const METHOD: Method = Method::Initialize;
    type Response = Empty;
}

/// Applies a context to an already running server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApplyContextRequest {
    pub context: ContextMsg,
}
impl Request for ApplyContextRequest {
    const METHOD: Method = Method::ApplyContext;
    type Response = Empty;
}

/// Announces that the client is about to go away.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PrepareShutdownRequest {}
impl Request for PrepareShutdownRequest {
    const METHOD: Method = Method::PrepareShutdown;
    type Response = Empty;
}

/// Releases the client's reference to a server-side object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub id: EntityId,
}
impl Request for ReleaseRequest {
    const METHOD: Method = Method::Release;
    type Response = Empty;
}

/// Requests a new, independently counted reference to an object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DuplicateReferenceRequest {
    pub id: EntityId,
}
impl Request for DuplicateReferenceRequest {
    const METHOD: Method = Method::DuplicateReference;
    type Response = EntityRef;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DescribeRequest {
    pub id: EntityId,
}
impl Request for DescribeRequest {
    const METHOD: Method = Method::Describe;
    type Response = StringMsg;
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StringMsg {
    pub v: String,
}

/// Loads a plugin library on the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PluginRequest {
    pub name: String,
    #[serde(rename = "dllPath")]
    pub dll_path: String,
    pub symbol: String,
}
impl Request for PluginRequest {
    const METHOD: Method = Method::LoadLibrary;
    type Response = Empty;
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TmpDirRequest {}
impl Request for TmpDirRequest {
    const METHOD: Method = Method::GetTmpDir;
    type Response = StringMsg;
}

/// Single frame of a file upload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UploadChunk {
    pub server_file_path: String,
    pub use_tmp_dir: bool,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Response to a completed upload, with the final server-side path.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub server_file_path: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub server_file_path: String,
    pub chunk_size: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DownloadFolderRequest {
    pub server_folder_path: String,
    pub chunk_size: u64,
}

/// Single frame of a file download. The path tag changes between
/// successive files of a folder download.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DownloadChunk {
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    pub server_file_path: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeCoreConfigRequest {}
impl Request for RuntimeCoreConfigRequest {
    const METHOD: Method = Method::GetRuntimeCoreConfig;
    type Response = EntityRef;
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeClientConfigRequest {}
impl Request for RuntimeClientConfigRequest {
    const METHOD: Method = Method::GetRuntimeClientConfig;
    type Response = EntityRef;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataTreeGetRequest {
    pub id: EntityId,
    pub name: String,
}
impl Request for DataTreeGetRequest {
    const METHOD: Method = Method::DataTreeGet;
    type Response = DataTreeValue;
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DataTreeValue {
    pub value: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataTreeSetRequest {
    pub id: EntityId,
    pub name: String,
    pub value: String,
}
impl Request for DataTreeSetRequest {
    const METHOD: Method = Method::DataTreeSet;
    type Response = Empty;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataTreeListRequest {
    pub id: EntityId,
}
impl Request for DataTreeListRequest {
    const METHOD: Method = Method::DataTreeList;
    type Response = DataTreeEntries;
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DataTreeEntries {
    pub entries: Vec<(String, String)>,
}

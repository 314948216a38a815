//! Message definitions exchanged with the server.
//!
//! Each remote procedure is identified by a [`Method`], which maps to a fully
//! qualified name of the form `dpf.<service>.v0.<Service>/<Procedure>`.
//! Request bodies are plain serializable structs implementing [`Request`],
//! which ties them to their method and response type.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{Error, Result};

pub mod base;
pub mod operator;
pub mod value;

pub use base::*;
pub use operator::*;
pub use value::*;

/// Remote procedures understood by the server.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    // base service
    GetServerInfo,
    Initialize,
    ApplyContext,
    PrepareShutdown,
    Release,
    DuplicateReference,
    Describe,
    LoadLibrary,
    GetTmpDir,
    UploadFile,
    DownloadFile,
    DownloadFilesInFolder,
    GetRuntimeCoreConfig,
    GetRuntimeClientConfig,
    // data tree service
    DataTreeGet,
    DataTreeSet,
    DataTreeList,
    // operator service
    CreateOperator,
    UpdateInput,
    UpdateInputStreamed,
    GetOutput,
    GetOutputWithProgress,
    RunOperator,
    GetSpecification,
    GetConfig,
    SetConfig,
    // workflow service
    CreateWorkflow,
    WorkflowAddOperators,
    WorkflowSetInputName,
    WorkflowSetOutputName,
    // scoping service
    CreateScoping,
    ScopingSetIds,
    ScopingSetIdsStreamed,
    ScopingGetIds,
    // field service
    CreateStringField,
    StringFieldGetData,
}

impl Method {
    pub const ALL: [Method; 36] = [
        Method::GetServerInfo,
        Method::Initialize,
        Method::ApplyContext,
        Method::PrepareShutdown,
        Method::Release,
        Method::DuplicateReference,
        Method::Describe,
        Method::LoadLibrary,
        Method::GetTmpDir,
        Method::UploadFile,
        Method::DownloadFile,
        Method::DownloadFilesInFolder,
        Method::GetRuntimeCoreConfig,
        Method::GetRuntimeClientConfig,
        Method::DataTreeGet,
        Method::DataTreeSet,
        Method::DataTreeList,
        Method::CreateOperator,
        Method::UpdateInput,
        Method::UpdateInputStreamed,
        Method::GetOutput,
        Method::GetOutputWithProgress,
        Method::RunOperator,
        Method::GetSpecification,
        Method::GetConfig,
        Method::SetConfig,
        Method::CreateWorkflow,
        Method::WorkflowAddOperators,
        Method::WorkflowSetInputName,
        Method::WorkflowSetOutputName,
        Method::CreateScoping,
        Method::ScopingSetIds,
        Method::ScopingSetIdsStreamed,
        Method::ScopingGetIds,
        Method::CreateStringField,
        Method::StringFieldGetData,
    ];

    /// Fully qualified service name the procedure belongs to.
    pub fn service(&self) -> &'static str {
        use Method::*;
        match self {
            GetServerInfo | Initialize | ApplyContext | PrepareShutdown | Release
            | DuplicateReference | Describe | LoadLibrary | GetTmpDir | UploadFile
            | DownloadFile | DownloadFilesInFolder | GetRuntimeCoreConfig
            | GetRuntimeClientConfig => "dpf.base.v0.BaseService",
            DataTreeGet | DataTreeSet | DataTreeList => "dpf.data_tree.v0.DataTreeService",
            CreateOperator | UpdateInput | UpdateInputStreamed | GetOutput
            | GetOutputWithProgress | RunOperator | GetSpecification | GetConfig
            | SetConfig => "dpf.operator.v0.OperatorService",
            CreateWorkflow | WorkflowAddOperators | WorkflowSetInputName
            | WorkflowSetOutputName => "dpf.workflow.v0.WorkflowService",
            CreateScoping | ScopingSetIds | ScopingSetIdsStreamed | ScopingGetIds => {
                "dpf.scoping.v0.ScopingService"
            }
            CreateStringField | StringFieldGetData => "dpf.field.v0.FieldService",
        }
    }

    /// Name of the procedure within its service.
    pub fn procedure(&self) -> &'static str {
        use Method::*;
        match self {
            GetServerInfo => "GetServerInfo",
            Initialize => "Initialize",
            ApplyContext => "ApplyContext",
            PrepareShutdown => "PrepareShutdown",
            Release => "Release",
            DuplicateReference => "DuplicateReference",
            Describe => "Describe",
            LoadLibrary => "LoadLibrary",
            GetTmpDir => "GetTmpDir",
            UploadFile => "UploadFile",
            DownloadFile => "DownloadFile",
            DownloadFilesInFolder => "DownloadFilesInFolder",
            GetRuntimeCoreConfig => "GetRuntimeCoreConfig",
            GetRuntimeClientConfig => "GetRuntimeClientConfig",
            DataTreeGet => "Get",
            DataTreeSet => "Set",
            DataTreeList => "List",
            CreateOperator => "Create",
            UpdateInput => "UpdateInput",
            UpdateInputStreamed => "UpdateInputStreamed",
            GetOutput => "Get",
            GetOutputWithProgress => "GetWithProgress",
            RunOperator => "Run",
            GetSpecification => "GetSpecification",
            GetConfig => "GetConfig",
            SetConfig => "UpdateConfig",
            CreateWorkflow => "Create",
            WorkflowAddOperators => "AddOperators",
            WorkflowSetInputName => "SetInputName",
            WorkflowSetOutputName => "SetOutputName",
            CreateScoping => "Create",
            ScopingSetIds => "UpdateIds",
            ScopingSetIdsStreamed => "UpdateIdsStreamed",
            ScopingGetIds => "List",
            CreateStringField => "CreateStringField",
            StringFieldGetData => "ListStringData",
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.service(), self.procedure())
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service(), self.procedure())
    }
}

impl FromStr for Method {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Method::ALL
            .iter()
            .find(|m| m.full_name() == s)
            .copied()
            .ok_or_else(|| Error::ParseError(format!("unknown method: {}", s)))
    }
}

/// Ties a request body to its remote procedure and response type.
pub trait Request: Serialize {
    const METHOD: Method;
    type Response: DeserializeOwned;
}

/// Empty message body.
#[derive(Debug, Copy, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Empty {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_names_are_unique_and_parse_back() {
        let mut names = std::collections::HashSet::new();
        for m in Method::ALL.iter() {
            let name = m.full_name();
            assert!(names.insert(name.clone()), "duplicate method name {}", name);
            assert_eq!(name.parse::<Method>().unwrap(), *m);
        }
    }

    #[test]
    fn display_matches_full_name() {
        assert_eq!(
            Method::GetServerInfo.to_string(),
            "dpf.base.v0.BaseService/GetServerInfo"
        );
        assert_eq!(
            Method::GetOutput.to_string(),
            "dpf.operator.v0.OperatorService/Get"
        );
    }
}

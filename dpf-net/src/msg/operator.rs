//! Messages of the operator, workflow, scoping and field procedures.

use std::collections::BTreeMap;

use dpf_core::{EntityId, Pin, Specification, ValueType};

use crate::msg::{Array, Empty, EntityRef, Method, Request, WireValue};

/// Operator configuration, option name to string value.
pub type ConfigMap = BTreeMap<String, String>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateOperatorRequest {
    pub name: String,
    pub config: Option<ConfigMap>,
}
impl Request for CreateOperatorRequest {
    const METHOD: Method = Method::CreateOperator;
    type Response = EntityRef;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateInputRequest {
    pub op: EntityId,
    pub pin: Pin,
    pub value: WireValue,
}
impl Request for UpdateInputRequest {
    const METHOD: Method = Method::UpdateInput;
    type Response = Empty;
}

/// First frame of a streamed input update. Following frames carry the raw
/// little-endian array bytes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamedInputHeader {
    pub op: EntityId,
    pub pin: Pin,
    /// `ElemType` code
    pub elem_type: u8,
    pub count: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetOutputRequest {
    pub op: EntityId,
    pub pin: Pin,
    /// Type the caller expects, a pin may produce several
    pub value_type: ValueType,
    /// Return list outputs as a single array rather than element-wise
    pub as_array: bool,
}
impl Request for GetOutputRequest {
    const METHOD: Method = Method::GetOutput;
    type Response = WireValue;
}

/// Frames of the output-with-progress stream. The stream ends with exactly
/// one `Output` frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum OutputStreamFrame {
    Progress { current: u64, total: u64 },
    Output(WireValue),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub op: EntityId,
}
impl Request for RunRequest {
    const METHOD: Method = Method::RunOperator;
    type Response = Empty;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpecificationRequest {
    pub op: EntityId,
}
impl Request for SpecificationRequest {
    const METHOD: Method = Method::GetSpecification;
    type Response = Specification;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetConfigRequest {
    pub op: EntityId,
}
impl Request for GetConfigRequest {
    const METHOD: Method = Method::GetConfig;
    type Response = ConfigResponse;
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigResponse {
    pub options: ConfigMap,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SetConfigRequest {
    pub op: EntityId,
    pub options: ConfigMap,
}
impl Request for SetConfigRequest {
    const METHOD: Method = Method::SetConfig;
    type Response = Empty;
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateWorkflowRequest {}
impl Request for CreateWorkflowRequest {
    const METHOD: Method = Method::CreateWorkflow;
    type Response = EntityRef;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowAddOperatorsRequest {
    pub wf: EntityId,
    pub ops: Vec<EntityId>,
}
impl Request for WorkflowAddOperatorsRequest {
    const METHOD: Method = Method::WorkflowAddOperators;
    type Response = Empty;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSetInputNameRequest {
    pub wf: EntityId,
    pub name: String,
    pub op: EntityId,
    pub pin: Pin,
}
impl Request for WorkflowSetInputNameRequest {
    const METHOD: Method = Method::WorkflowSetInputName;
    type Response = Empty;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSetOutputNameRequest {
    pub wf: EntityId,
    pub name: String,
    pub op: EntityId,
    pub pin: Pin,
}
impl Request for WorkflowSetOutputNameRequest {
    const METHOD: Method = Method::WorkflowSetOutputName;
    type Response = Empty;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateScopingRequest {
    pub location: String,
}
impl Request for CreateScopingRequest {
    const METHOD: Method = Method::CreateScoping;
    type Response = EntityRef;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScopingSetIdsRequest {
    pub id: EntityId,
    pub ids: Array,
}
impl Request for ScopingSetIdsRequest {
    const METHOD: Method = Method::ScopingSetIds;
    type Response = Empty;
}

/// First frame of a streamed ids update.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScopingSetIdsHeader {
    pub id: EntityId,
    pub count: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScopingGetIdsRequest {
    pub id: EntityId,
}
impl Request for ScopingGetIdsRequest {
    const METHOD: Method = Method::ScopingGetIds;
    type Response = Array;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateStringFieldRequest {
    pub location: String,
    pub data: Vec<String>,
}
impl Request for CreateStringFieldRequest {
    const METHOD: Method = Method::CreateStringField;
    type Response = EntityRef;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StringFieldGetDataRequest {
    pub id: EntityId,
}
impl Request for StringFieldGetDataRequest {
    const METHOD: Method = Method::StringFieldGetData;
    type Response = StringListMsg;
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StringListMsg {
    pub v: Vec<String>,
}

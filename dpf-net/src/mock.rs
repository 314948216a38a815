//! In-memory server engine.
//!
//! `MockEngine` answers the whole protocol without a server install. It
//! knows a handful of operators (`forward`, `min_max`, serialization,
//! string fields, license checkout and code generation), keeps scopings,
//! workflows, data trees and files in memory, and hands out a distinct
//! reference id for every reference a client holds.
//!
//! It can be used directly through [`Session::local`](crate::Session::local)
//! or served over tcp with [`MockEngine::serve`], which exercises the remote
//! transport end to end.

use std::collections::BTreeMap;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use fnv::FnvHashMap;

use dpf_core::spec::ConfigOptionSpec;
use dpf_core::{
    runtime_config, EntityId, ObjectKind, Pin, PinSpecification, Specification,
    NULL_OBJECT_MARKER,
};

use crate::msg::*;
use crate::objects::LOCATION_NODAL;
use crate::socket::{pack, read_frame, unpack, write_frame, Encoding, Frame, FrameKind};
use crate::transport::{ChunkSource, ChunkStream, Engine, Ownership, Reply};
use crate::{Error, Result};

/// Increment name the mock refuses to check out.
pub const UNAVAILABLE_INCREMENT: &str = "unavailable_increment";

/// Operators known to the mock.
pub const MOCK_OPERATORS: [&str; 8] = [
    "forward",
    "min_max",
    "serializer_to_string",
    "string_deserializer",
    "make_string_field",
    "identical_string_fields",
    "license_checkout",
    "python_generator",
];

/// Error message as the server would report it.
struct Fault(String);

impl From<Error> for Fault {
    fn from(e: Error) -> Self {
        Fault(fault_message(&e))
    }
}

type MockResult<T> = std::result::Result<T, Fault>;

fn fault<T>(message: String) -> MockResult<T> {
    Err(Fault(message))
}

/// Text sent in a fault frame for an error.
fn fault_message(e: &Error) -> String {
    match e {
        Error::ServerError(m) | Error::MissingObject(m) => m.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Input {
    Value(WireValue),
    Object(u64),
    Output { op: u64, pin: Pin },
}

#[derive(Debug, Clone)]
struct MockOperator {
    name: String,
    inputs: BTreeMap<Pin, Input>,
    config: ConfigMap,
    holds_license: bool,
}

#[derive(Debug, Clone, Default)]
struct MockWorkflow {
    ops: Vec<u64>,
    inputs: BTreeMap<String, (u64, Pin)>,
    outputs: BTreeMap<String, (u64, Pin)>,
}

/// Serialized form of the objects the mock can copy between servers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Serialized {
    StringField { location: String, data: Vec<String> },
    Scoping { location: String, ids: Vec<i32> },
}

#[derive(Debug, Clone)]
enum Stored {
    Operator(MockOperator),
    Workflow(MockWorkflow),
    Scoping { location: String, ids: Vec<i32> },
    StringField { location: String, data: Vec<String> },
    DataTree(BTreeMap<String, String>),
}

impl Stored {
    fn kind(&self) -> ObjectKind {
        match self {
            Stored::Operator(_) => ObjectKind::Operator,
            Stored::Workflow(_) => ObjectKind::Workflow,
            Stored::Scoping { .. } => ObjectKind::Scoping,
            Stored::StringField { .. } => ObjectKind::StringField,
            Stored::DataTree(_) => ObjectKind::DataTree,
        }
    }

    fn describe(&self) -> String {
        match self {
            Stored::Operator(op) => format!("DPF {} Operator", op.name),
            Stored::Workflow(wf) => format!(
                "DPF Workflow with {} operators, inputs {:?}, outputs {:?}",
                wf.ops.len(),
                wf.inputs.keys().collect::<Vec<_>>(),
                wf.outputs.keys().collect::<Vec<_>>()
            ),
            Stored::Scoping { location, ids } => {
                format!("DPF Scoping with {} {} entities", ids.len(), location)
            }
            Stored::StringField { location, data } => {
                format!("DPF String Field with {} {} entities", data.len(), location)
            }
            Stored::DataTree(entries) => format!("DPF DataTree with {} entries", entries.len()),
        }
    }

    fn serialize(&self) -> Option<Serialized> {
        match self {
            Stored::StringField { location, data } => Some(Serialized::StringField {
                location: location.clone(),
                data: data.clone(),
            }),
            Stored::Scoping { location, ids } => Some(Serialized::Scoping {
                location: location.clone(),
                ids: ids.clone(),
            }),
            _ => None,
        }
    }
}

impl From<Serialized> for Stored {
    fn from(s: Serialized) -> Self {
        match s {
            Serialized::StringField { location, data } => Stored::StringField { location, data },
            Serialized::Scoping { location, ids } => Stored::Scoping { location, ids },
        }
    }
}

/// Result of evaluating an operator pin.
enum Produced {
    Wire(WireValue),
    Object(u64),
}

#[derive(Default)]
struct MockState {
    next_ref: EntityId,
    next_object: u64,
    /// Reference id held by a client or by a server object, to object key
    refs: FnvHashMap<EntityId, u64>,
    objects: FnvHashMap<u64, Stored>,
    files: BTreeMap<String, Vec<u8>>,
    tmp_dir: Option<String>,
    plugins: Vec<String>,
    licenses: usize,
    context: Option<String>,
    shutdown_prepared: bool,
    releases: u64,
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn from_hex(s: &str) -> MockResult<Vec<u8>> {
    if s.len() % 2 != 0 {
        return fault("serialized string has odd length".to_string());
    }
    let digit = |b: u8| {
        (b as char)
            .to_digit(16)
            .ok_or_else(|| Fault(format!("invalid serialized string: {:?}", s)))
    };
    s.as_bytes()
        .chunks(2)
        .map(|pair| Ok((digit(pair[0])? * 16 + digit(pair[1])?) as u8))
        .collect()
}

fn pin_spec(name: &str, types: &[&str]) -> PinSpecification {
    PinSpecification::new(name, types, false, "")
}

fn optional_pin_spec(name: &str, types: &[&str]) -> PinSpecification {
    PinSpecification::new(name, types, true, "")
}

fn specification(name: &str) -> Specification {
    let mut spec = Specification::default();
    let mut pure = true;
    match name {
        "forward" => {
            spec.description = "Returns the input on the same output pin.".to_string();
            spec.inputs.insert(0, pin_spec("any", &["any"]).with_ellipsis());
            spec.outputs.insert(0, pin_spec("any", &["any"]));
        }
        "min_max" => {
            spec.description = "Computes the minimum and maximum of a list.".to_string();
            spec.inputs
                .insert(0, pin_spec("field", &["vector<double>", "field"]));
            spec.outputs.insert(0, pin_spec("field_min", &["double"]));
            spec.outputs.insert(1, pin_spec("field_max", &["double"]));
        }
        "serializer_to_string" => {
            spec.description = "Serializes an object to a string.".to_string();
            spec.inputs
                .insert(-1, optional_pin_spec("stream_type", &["int32"]));
            spec.inputs.insert(1, pin_spec("any_input", &["any"]));
            spec.outputs
                .insert(0, pin_spec("serialized_string", &["string", "bytes"]));
        }
        "string_deserializer" => {
            spec.description = "Rebuilds an object from its serialized string.".to_string();
            spec.inputs
                .insert(-1, optional_pin_spec("stream_type", &["int32"]));
            spec.inputs
                .insert(0, pin_spec("serialized_string", &["string", "bytes"]));
            spec.outputs.insert(1, pin_spec("any_output", &["any"]));
            pure = false;
        }
        "make_string_field" => {
            spec.inputs.insert(0, pin_spec("data", &["vector<string>"]));
            spec.outputs.insert(0, pin_spec("field", &["string_field"]));
            pure = false;
        }
        "identical_string_fields" => {
            spec.inputs.insert(0, pin_spec("fieldA", &["string_field"]));
            spec.inputs.insert(1, pin_spec("fieldB", &["string_field"]));
            spec.outputs.insert(0, pin_spec("are_identical", &["bool"]));
        }
        "license_checkout" => {
            spec.inputs
                .insert(0, optional_pin_spec("license_increment", &["string"]));
            spec.inputs
                .insert(1, optional_pin_spec("license_timeout_in_seconds", &["double"]));
            pure = false;
        }
        "python_generator" => {
            spec.inputs.insert(0, pin_spec("dll_source_path", &["string"]));
            spec.inputs.insert(1, pin_spec("output_path", &["string"]));
            spec.inputs.insert(2, pin_spec("library_name", &["string"]));
            pure = false;
        }
        _ => (),
    }
    spec.properties
        .insert("pure".to_string(), pure.to_string());
    spec.properties
        .insert("category".to_string(), "mock".to_string());
    spec.config_options.insert(
        "mutex".to_string(),
        ConfigOptionSpec {
            name: "mutex".to_string(),
            type_names: vec!["bool".to_string()],
            default_value: "false".to_string(),
            document: "Serializes evaluations of the operator.".to_string(),
        },
    );
    spec
}

impl MockState {
    fn new_ref(&mut self, key: u64) -> EntityId {
        self.next_ref += 1;
        self.refs.insert(self.next_ref, key);
        self.next_ref
    }

    fn create(&mut self, object: Stored) -> EntityRef {
        self.next_object += 1;
        let key = self.next_object;
        let kind = object.kind();
        self.objects.insert(key, object);
        EntityRef {
            id: self.new_ref(key),
            kind,
        }
    }

    fn resolve(&self, id: EntityId) -> MockResult<u64> {
        match self.refs.get(&id) {
            Some(key) if self.objects.contains_key(key) => Ok(*key),
            _ => fault(format!("{} (id {})", NULL_OBJECT_MARKER, id)),
        }
    }

    fn object(&self, key: u64) -> MockResult<&Stored> {
        self.objects
            .get(&key)
            .ok_or_else(|| Fault(format!("{} (object {})", NULL_OBJECT_MARKER, key)))
    }

    fn object_mut(&mut self, key: u64) -> MockResult<&mut Stored> {
        self.objects
            .get_mut(&key)
            .ok_or_else(|| Fault(format!("{} (object {})", NULL_OBJECT_MARKER, key)))
    }

    fn operator(&self, key: u64) -> MockResult<&MockOperator> {
        match self.object(key)? {
            Stored::Operator(op) => Ok(op),
            other => fault(format!("{} is not an operator", other.kind())),
        }
    }

    fn operator_mut(&mut self, key: u64) -> MockResult<&mut MockOperator> {
        match self.object_mut(key)? {
            Stored::Operator(op) => Ok(op),
            other => fault(format!("{} is not an operator", other.kind())),
        }
    }

    fn workflow_mut(&mut self, key: u64) -> MockResult<&mut MockWorkflow> {
        match self.object_mut(key)? {
            Stored::Workflow(wf) => Ok(wf),
            other => fault(format!("{} is not a workflow", other.kind())),
        }
    }

    fn data_tree_mut(&mut self, key: u64) -> MockResult<&mut BTreeMap<String, String>> {
        match self.object_mut(key)? {
            Stored::DataTree(tree) => Ok(tree),
            other => fault(format!("{} is not a data tree", other.kind())),
        }
    }

    fn release(&mut self, id: EntityId) -> MockResult<()> {
        let key = match self.refs.remove(&id) {
            Some(key) => key,
            None => return fault(format!("{} (id {})", NULL_OBJECT_MARKER, id)),
        };
        self.releases += 1;
        let referenced = self.refs.values().any(|k| *k == key);
        if !referenced {
            if let Some(Stored::Operator(op)) = self.objects.get_mut(&key) {
                if op.holds_license {
                    op.holds_license = false;
                    self.licenses -= 1;
                }
            }
        }
        Ok(())
    }

    fn to_input(&self, value: WireValue) -> MockResult<Input> {
        Ok(match value {
            WireValue::Entity(entity) => Input::Object(self.resolve(entity.id)?),
            WireValue::OperatorInput(oi) => Input::Output {
                op: self.resolve(oi.inputop)?,
                pin: oi.pin_out,
            },
            other => Input::Value(other),
        })
    }

    /// Turns an evaluation result into a wire value, handing out a new
    /// reference for objects.
    fn to_wire(&mut self, produced: Produced) -> MockResult<WireValue> {
        Ok(match produced {
            Produced::Wire(w) => w,
            Produced::Object(key) => {
                let kind = self.object(key)?.kind();
                WireValue::Entity(EntityRef {
                    id: self.new_ref(key),
                    kind,
                })
            }
        })
    }

    fn input(&mut self, key: u64, pin: Pin, depth: usize) -> MockResult<Option<Produced>> {
        let input = self.operator(key)?.inputs.get(&pin).cloned();
        Ok(match input {
            None => None,
            Some(Input::Value(w)) => Some(Produced::Wire(w)),
            Some(Input::Object(k)) => Some(Produced::Object(k)),
            Some(Input::Output { op, pin }) => Some(self.eval(op, pin, depth + 1)?),
        })
    }

    fn required_input(&mut self, key: u64, pin: Pin, depth: usize) -> MockResult<Produced> {
        match self.input(key, pin, depth)? {
            Some(p) => Ok(p),
            None => {
                let name = self.operator(key)?.name.clone();
                fault(format!("input pin {} of operator {} is not connected", pin, name))
            }
        }
    }

    fn string_input(&mut self, key: u64, pin: Pin, depth: usize) -> MockResult<Option<String>> {
        match self.input(key, pin, depth)? {
            None => Ok(None),
            Some(Produced::Wire(WireValue::Str(s))) => Ok(Some(s)),
            Some(_) => fault(format!("input pin {} expects a string", pin)),
        }
    }

    fn stream_type(&mut self, key: u64, depth: usize) -> MockResult<i32> {
        match self.input(key, -1, depth)? {
            None => Ok(0),
            Some(Produced::Wire(WireValue::Int(v))) => Ok(v),
            Some(_) => fault("stream type must be an int32".to_string()),
        }
    }

    fn serialized_object(&mut self, key: u64, pin: Pin, depth: usize) -> MockResult<Serialized> {
        match self.required_input(key, pin, depth)? {
            Produced::Object(k) => {
                let stored = self.object(k)?;
                stored
                    .serialize()
                    .ok_or_else(|| Fault(format!("cannot serialize {}", stored.kind())))
            }
            Produced::Wire(w) => fault(format!(
                "input pin {} expects an object, got {}",
                pin,
                w.variant_name()
            )),
        }
    }

    fn eval(&mut self, key: u64, pin: Pin, depth: usize) -> MockResult<Produced> {
        if depth > 64 {
            return fault("operator graph is too deep or cyclic".to_string());
        }
        let name = self.operator(key)?.name.clone();
        let no_output = || fault(format!("operator {} has no output pin {}", name, pin));
        match name.as_str() {
            "forward" => self.required_input(key, pin, depth),
            "min_max" => {
                let values = match self.required_input(key, 0, depth)? {
                    Produced::Wire(WireValue::Array(a)) => a.to_f64s()?,
                    _ => return fault("min_max expects a list of doubles".to_string()),
                };
                if values.is_empty() {
                    return fault("min_max of an empty list".to_string());
                }
                let v = match pin {
                    0 => values.iter().cloned().fold(f64::INFINITY, f64::min),
                    1 => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
                    _ => return no_output(),
                };
                Ok(Produced::Wire(WireValue::Double(v)))
            }
            "serializer_to_string" => {
                if pin != 0 {
                    return no_output();
                }
                let stream_type = self.stream_type(key, depth)?;
                let serialized = self.serialized_object(key, 1, depth)?;
                let bytes = bincode::serialize(&serialized).map_err(Error::from)?;
                Ok(Produced::Wire(match stream_type {
                    1 => WireValue::Bytes(bytes),
                    _ => WireValue::Str(to_hex(&bytes)),
                }))
            }
            "string_deserializer" => {
                if pin != 1 {
                    return no_output();
                }
                let stream_type = self.stream_type(key, depth)?;
                let bytes = match (stream_type, self.required_input(key, 0, depth)?) {
                    (1, Produced::Wire(WireValue::Bytes(b))) => b,
                    (0, Produced::Wire(WireValue::Str(s))) => from_hex(&s)?,
                    (t, _) => return fault(format!("payload doesn't match stream type {}", t)),
                };
                let serialized: Serialized =
                    bincode::deserialize(&bytes).map_err(Error::from)?;
                self.next_object += 1;
                let new_key = self.next_object;
                self.objects.insert(new_key, serialized.into());
                Ok(Produced::Object(new_key))
            }
            "make_string_field" => {
                if pin != 0 {
                    return no_output();
                }
                let data = match self.required_input(key, 0, depth)? {
                    Produced::Wire(WireValue::StringList(v)) => v,
                    _ => return fault("make_string_field expects a list of strings".to_string()),
                };
                self.next_object += 1;
                let new_key = self.next_object;
                self.objects.insert(
                    new_key,
                    Stored::StringField {
                        location: LOCATION_NODAL.to_string(),
                        data,
                    },
                );
                Ok(Produced::Object(new_key))
            }
            "identical_string_fields" => {
                if pin != 0 {
                    return no_output();
                }
                let a = self.serialized_object(key, 0, depth)?;
                let b = self.serialized_object(key, 1, depth)?;
                Ok(Produced::Wire(WireValue::Bool(a == b)))
            }
            _ => no_output(),
        }
    }

    fn run(&mut self, key: u64) -> MockResult<()> {
        let name = self.operator(key)?.name.clone();
        match name.as_str() {
            "license_checkout" => {
                let increment = self.string_input(key, 0, 0)?;
                if increment.as_deref() == Some(UNAVAILABLE_INCREMENT) {
                    return fault(format!(
                        "license increment {} could not be checked out",
                        UNAVAILABLE_INCREMENT
                    ));
                }
                let op = self.operator_mut(key)?;
                if !op.holds_license {
                    op.holds_license = true;
                    self.licenses += 1;
                }
                Ok(())
            }
            "python_generator" => {
                let dll = self.string_input(key, 0, 0)?.unwrap_or_default();
                let dir = self.string_input(key, 1, 0)?.unwrap_or_default();
                let library = self.string_input(key, 2, 0)?.unwrap_or_default();
                if !self.plugins.contains(&library) {
                    return fault(format!("plugin {} is not loaded", library));
                }
                let base = format!("{}/{}", dir.trim_end_matches('/'), library);
                self.files.insert(
                    format!("{}/__init__.txt", base),
                    format!("operators of {}\n", dll).into_bytes(),
                );
                self.files.insert(
                    format!("{}/operators/{}_op.txt", base, library),
                    format!("generated from {}\n", dll).into_bytes(),
                );
                Ok(())
            }
            _ => {
                let outputs = specification(&name).outputs;
                for pin in outputs.keys() {
                    self.eval(key, *pin, 0)?;
                }
                Ok(())
            }
        }
    }

    fn tmp_dir(&mut self) -> String {
        self.tmp_dir
            .get_or_insert_with(|| format!("/tmp/dpf_mock_{}", std::process::id()))
            .clone()
    }
}

/// In-memory server engine.
pub struct MockEngine {
    state: Mutex<MockState>,
    version: String,
    capabilities: Vec<String>,
    encoding: Encoding,
    borrow_replies: bool,
    port: AtomicU16,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    /// Engine reporting version 8.0.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            version: "8.0".to_string(),
            capabilities: Vec::new(),
            encoding: Encoding::default(),
            borrow_replies: false,
            port: AtomicU16::new(0),
        }
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    /// Capabilities advertised in the server info, on top of the ones
    /// implied by the version.
    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.capabilities = capabilities.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Keeps the reference of newly handed out objects on the server side,
    /// the way an in-process server does.
    pub fn borrowing_replies(mut self, borrow: bool) -> Self {
        self.borrow_replies = borrow;
        self
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Number of reference ids currently alive.
    pub fn live_references(&self) -> usize {
        self.state().refs.len()
    }

    /// Number of release requests served.
    pub fn releases(&self) -> u64 {
        self.state().releases
    }

    pub fn licenses_in_use(&self) -> usize {
        self.state().licenses
    }

    /// Licensing context last applied, `PREMIUM` or `ENTRY`.
    pub fn context(&self) -> Option<String> {
        self.state().context.clone()
    }

    pub fn shutdown_prepared(&self) -> bool {
        self.state().shutdown_prepared
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state().files.get(path).cloned()
    }

    pub fn put_file(&self, path: &str, data: &[u8]) {
        self.state().files.insert(path.to_string(), data.to_vec());
    }

    pub fn file_paths(&self) -> Vec<String> {
        self.state().files.keys().cloned().collect()
    }

    fn decode<T: serde::de::DeserializeOwned>(&self, body: &[u8]) -> MockResult<T> {
        Ok(unpack(body, self.encoding)?)
    }

    fn encode<S: serde::Serialize>(&self, body: &S) -> MockResult<Vec<u8>> {
        Ok(pack(body, self.encoding)?)
    }

    fn reply<S: serde::Serialize>(&self, body: &S) -> MockResult<Reply> {
        Ok(Reply::owned(self.encode(body)?))
    }

    /// Reply carrying a newly handed out reference.
    fn handle_reply<S: serde::Serialize>(&self, body: &S) -> MockResult<Reply> {
        let body = self.encode(body)?;
        Ok(if self.borrow_replies {
            Reply::borrowed(body)
        } else {
            Reply::owned(body)
        })
    }

    fn entity_reply(&self, entity: EntityRef) -> MockResult<Reply> {
        self.handle_reply(&entity)
    }

    fn server_info(&self) -> ServerInfo {
        let mut parts = self.version.split('.').map(|p| p.parse::<u32>().unwrap_or(0));
        ServerInfo {
            ip: "127.0.0.1".to_string(),
            port: self.port.load(Ordering::SeqCst),
            pid: std::process::id(),
            version_major: parts.next().unwrap_or(0),
            version_minor: parts.next().unwrap_or(0),
            version: self.version.clone(),
            os: std::env::consts::OS.to_string(),
            capabilities: self.capabilities.clone(),
        }
    }

    fn call(&self, method: Method, body: &[u8]) -> MockResult<Reply> {
        use Method::*;
        match method {
            GetServerInfo => self.reply(&self.server_info()),
            Initialize => {
                let req: InitializeRequest = self.decode(body)?;
                self.state().context = Some(req.context.licensing);
                self.reply(&Empty {})
            }
            ApplyContext => {
                let req: ApplyContextRequest = self.decode(body)?;
                self.state().context = Some(req.context.licensing);
                self.reply(&Empty {})
            }
            PrepareShutdown => {
                self.state().shutdown_prepared = true;
                self.reply(&Empty {})
            }
            Release => {
                let req: ReleaseRequest = self.decode(body)?;
                self.state().release(req.id)?;
                self.reply(&Empty {})
            }
            DuplicateReference => {
                let req: DuplicateReferenceRequest = self.decode(body)?;
                let mut state = self.state();
                let key = state.resolve(req.id)?;
                let kind = state.object(key)?.kind();
                let id = state.new_ref(key);
                self.reply(&EntityRef { id, kind })
            }
            Describe => {
                let req: DescribeRequest = self.decode(body)?;
                let state = self.state();
                let key = state.resolve(req.id)?;
                let v = state.object(key)?.describe();
                self.reply(&StringMsg { v })
            }
            LoadLibrary => {
                let req: PluginRequest = self.decode(body)?;
                if req.dll_path.trim().is_empty() {
                    return fault(format!("cannot load plugin {}: empty library path", req.name));
                }
                self.state().plugins.push(req.name);
                self.reply(&Empty {})
            }
            GetTmpDir => {
                let v = self.state().tmp_dir();
                self.reply(&StringMsg { v })
            }
            GetRuntimeCoreConfig => {
                let mut tree = BTreeMap::new();
                tree.insert("num_threads".to_string(), "4".to_string());
                tree.insert("license_timeout_in_seconds".to_string(), "10".to_string());
                let entity = self.state().create(Stored::DataTree(tree));
                self.entity_reply(entity)
            }
            GetRuntimeClientConfig => {
                let tree = runtime_config()
                    .options()
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect();
                let entity = self.state().create(Stored::DataTree(tree));
                self.entity_reply(entity)
            }
            DataTreeGet => {
                let req: DataTreeGetRequest = self.decode(body)?;
                let mut state = self.state();
                let key = state.resolve(req.id)?;
                let value = state.data_tree_mut(key)?.get(&req.name).cloned();
                self.reply(&DataTreeValue { value })
            }
            DataTreeSet => {
                let req: DataTreeSetRequest = self.decode(body)?;
                let mut state = self.state();
                let key = state.resolve(req.id)?;
                state.data_tree_mut(key)?.insert(req.name, req.value);
                self.reply(&Empty {})
            }
            DataTreeList => {
                let req: DataTreeListRequest = self.decode(body)?;
                let mut state = self.state();
                let key = state.resolve(req.id)?;
                let entries = state
                    .data_tree_mut(key)?
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                self.reply(&DataTreeEntries { entries })
            }
            CreateOperator => {
                let req: CreateOperatorRequest = self.decode(body)?;
                if !MOCK_OPERATORS.contains(&req.name.as_str()) {
                    return fault(format!("operator {} is not registered", req.name));
                }
                let mut config: ConfigMap = specification(&req.name)
                    .config_options
                    .into_iter()
                    .map(|(k, v)| (k, v.default_value))
                    .collect();
                config.extend(req.config.unwrap_or_default());
                let entity = self.state().create(Stored::Operator(MockOperator {
                    name: req.name,
                    inputs: BTreeMap::new(),
                    config,
                    holds_license: false,
                }));
                self.entity_reply(entity)
            }
            UpdateInput => {
                let req: UpdateInputRequest = self.decode(body)?;
                let mut state = self.state();
                let key = state.resolve(req.op)?;
                let input = state.to_input(req.value)?;
                state.operator_mut(key)?.inputs.insert(req.pin, input);
                self.reply(&Empty {})
            }
            GetOutput => {
                let req: GetOutputRequest = self.decode(body)?;
                let mut state = self.state();
                let key = state.resolve(req.op)?;
                let produced = state.eval(key, req.pin, 0)?;
                let wire = state.to_wire(produced)?;
                match wire {
                    WireValue::Entity(_) => self.handle_reply(&wire),
                    _ => self.reply(&wire),
                }
            }
            RunOperator => {
                let req: RunRequest = self.decode(body)?;
                let mut state = self.state();
                let key = state.resolve(req.op)?;
                state.run(key)?;
                self.reply(&Empty {})
            }
            GetSpecification => {
                let req: SpecificationRequest = self.decode(body)?;
                let state = self.state();
                let key = state.resolve(req.op)?;
                let spec = specification(&state.operator(key)?.name);
                self.reply(&spec)
            }
            GetConfig => {
                let req: GetConfigRequest = self.decode(body)?;
                let state = self.state();
                let key = state.resolve(req.op)?;
                let options = state.operator(key)?.config.clone();
                self.reply(&ConfigResponse { options })
            }
            SetConfig => {
                let req: SetConfigRequest = self.decode(body)?;
                let mut state = self.state();
                let key = state.resolve(req.op)?;
                state.operator_mut(key)?.config.extend(req.options);
                self.reply(&Empty {})
            }
            CreateWorkflow => {
                let entity = self
                    .state()
                    .create(Stored::Workflow(MockWorkflow::default()));
                self.entity_reply(entity)
            }
            WorkflowAddOperators => {
                let req: WorkflowAddOperatorsRequest = self.decode(body)?;
                let mut state = self.state();
                let wf = state.resolve(req.wf)?;
                let mut keys = Vec::with_capacity(req.ops.len());
                for id in &req.ops {
                    let key = state.resolve(*id)?;
                    state.operator(key)?;
                    keys.push(key);
                }
                // the workflow now holds the references it was handed
                let workflow = state.workflow_mut(wf)?;
                for key in keys {
                    if !workflow.ops.contains(&key) {
                        workflow.ops.push(key);
                    }
                }
                self.reply(&Empty {})
            }
            WorkflowSetInputName => {
                let req: WorkflowSetInputNameRequest = self.decode(body)?;
                let mut state = self.state();
                let wf = state.resolve(req.wf)?;
                let op = state.resolve(req.op)?;
                state.workflow_mut(wf)?.inputs.insert(req.name, (op, req.pin));
                self.reply(&Empty {})
            }
            WorkflowSetOutputName => {
                let req: WorkflowSetOutputNameRequest = self.decode(body)?;
                let mut state = self.state();
                let wf = state.resolve(req.wf)?;
                let op = state.resolve(req.op)?;
                state.workflow_mut(wf)?.outputs.insert(req.name, (op, req.pin));
                self.reply(&Empty {})
            }
            CreateScoping => {
                let req: CreateScopingRequest = self.decode(body)?;
                let entity = self.state().create(Stored::Scoping {
                    location: req.location,
                    ids: Vec::new(),
                });
                self.entity_reply(entity)
            }
            ScopingSetIds => {
                let req: ScopingSetIdsRequest = self.decode(body)?;
                let new_ids = req.ids.to_i32s()?;
                self.set_scoping_ids(req.id, new_ids)?;
                self.reply(&Empty {})
            }
            ScopingGetIds => {
                let req: ScopingGetIdsRequest = self.decode(body)?;
                let state = self.state();
                let key = state.resolve(req.id)?;
                match state.object(key)? {
                    Stored::Scoping { ids, .. } => self.reply(&Array::from_i32s(ids)),
                    other => fault(format!("{} is not a scoping", other.kind())),
                }
            }
            CreateStringField => {
                let req: CreateStringFieldRequest = self.decode(body)?;
                let entity = self.state().create(Stored::StringField {
                    location: req.location,
                    data: req.data,
                });
                self.entity_reply(entity)
            }
            StringFieldGetData => {
                let req: StringFieldGetDataRequest = self.decode(body)?;
                let state = self.state();
                let key = state.resolve(req.id)?;
                match state.object(key)? {
                    Stored::StringField { data, .. } => {
                        self.reply(&StringListMsg { v: data.clone() })
                    }
                    other => fault(format!("{} is not a string field", other.kind())),
                }
            }
            other => fault(format!("{} is not a unary procedure", other)),
        }
    }

    fn set_scoping_ids(&self, id: EntityId, new_ids: Vec<i32>) -> MockResult<()> {
        let mut state = self.state();
        let key = state.resolve(id)?;
        match state.object_mut(key)? {
            Stored::Scoping { ids, .. } => {
                *ids = new_ids;
                Ok(())
            }
            other => fault(format!("{} is not a scoping", other.kind())),
        }
    }

    fn chunk_file(&self, path: &str, data: &[u8], chunk_size: usize) -> MockResult<Vec<Vec<u8>>> {
        if data.is_empty() {
            return Ok(vec![self.encode(&DownloadChunk {
                data: Vec::new(),
                server_file_path: path.to_string(),
            })?]);
        }
        data.chunks(chunk_size.max(1))
            .map(|c| {
                self.encode(&DownloadChunk {
                    data: c.to_vec(),
                    server_file_path: path.to_string(),
                })
            })
            .collect()
    }

    fn server_stream(&self, method: Method, body: &[u8]) -> MockResult<Vec<Vec<u8>>> {
        match method {
            Method::DownloadFile => {
                let req: DownloadRequest = self.decode(body)?;
                let data = match self.state().files.get(&req.server_file_path) {
                    Some(data) => data.clone(),
                    None => return fault(format!("file {} not found", req.server_file_path)),
                };
                self.chunk_file(&req.server_file_path, &data, req.chunk_size as usize)
            }
            Method::DownloadFilesInFolder => {
                let req: DownloadFolderRequest = self.decode(body)?;
                let prefix = format!("{}/", req.server_folder_path.trim_end_matches('/'));
                let files = self
                    .state()
                    .files
                    .iter()
                    .filter(|(path, _)| path.starts_with(&prefix))
                    .map(|(path, data)| (path.clone(), data.clone()))
                    .collect::<Vec<_>>();
                let mut chunks = Vec::new();
                for (path, data) in files {
                    chunks.extend(self.chunk_file(&path, &data, req.chunk_size as usize)?);
                }
                Ok(chunks)
            }
            Method::GetOutputWithProgress => {
                let req: GetOutputRequest = self.decode(body)?;
                let mut state = self.state();
                let key = state.resolve(req.op)?;
                let total = 3;
                let mut frames = Vec::new();
                for current in 0..total {
                    frames.push(self.encode(&OutputStreamFrame::Progress { current, total })?);
                }
                let produced = state.eval(key, req.pin, 0)?;
                let wire = state.to_wire(produced)?;
                frames.push(self.encode(&OutputStreamFrame::Progress {
                    current: total,
                    total,
                })?);
                frames.push(self.encode(&OutputStreamFrame::Output(wire))?);
                Ok(frames)
            }
            other => fault(format!("{} is not a server streaming procedure", other)),
        }
    }

    fn client_stream(&self, method: Method, chunks: Vec<Vec<u8>>) -> MockResult<Reply> {
        let mut chunks = chunks.into_iter();
        match method {
            Method::UploadFile => {
                let mut path: Option<String> = None;
                let mut data = Vec::new();
                for chunk in chunks {
                    let chunk: UploadChunk = self.decode(&chunk)?;
                    if path.is_none() {
                        path = Some(if chunk.use_tmp_dir {
                            format!(
                                "{}/{}",
                                self.state().tmp_dir(),
                                chunk.server_file_path.trim_start_matches('/')
                            )
                        } else {
                            chunk.server_file_path.clone()
                        });
                    }
                    data.extend_from_slice(&chunk.data);
                }
                let path = match path {
                    Some(path) => path,
                    None => return fault("upload carried no data".to_string()),
                };
                self.state().files.insert(path.clone(), data);
                self.reply(&UploadResponse {
                    server_file_path: path,
                })
            }
            Method::UpdateInputStreamed => {
                let header: StreamedInputHeader = match chunks.next() {
                    Some(h) => self.decode(&h)?,
                    None => return fault("streamed input without header".to_string()),
                };
                let elem_type = elem_type_from_code(header.elem_type)?;
                let data = chunks.flatten().collect::<Vec<u8>>();
                let array = Array {
                    data,
                    elem_type,
                    count: header.count,
                };
                // validates the payload length
                array.to_f64s()?;
                let mut state = self.state();
                let key = state.resolve(header.op)?;
                state
                    .operator_mut(key)?
                    .inputs
                    .insert(header.pin, Input::Value(WireValue::Array(array)));
                self.reply(&Empty {})
            }
            Method::ScopingSetIdsStreamed => {
                let header: ScopingSetIdsHeader = match chunks.next() {
                    Some(h) => self.decode(&h)?,
                    None => return fault("streamed ids without header".to_string()),
                };
                let data = chunks.flatten().collect::<Vec<u8>>();
                let ids = Array {
                    data,
                    elem_type: ElemType::Int32,
                    count: header.count,
                }
                .to_i32s()?;
                self.set_scoping_ids(header.id, ids)?;
                self.reply(&Empty {})
            }
            other => fault(format!("{} is not a client streaming procedure", other)),
        }
    }

    /// Serves the remote protocol on every connection accepted by
    /// `listener`, one thread per connection. Returns when accepting fails.
    pub fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            self.port.store(addr.port(), Ordering::SeqCst);
            info!("mock server listening on {}", addr);
        }
        for stream in listener.incoming() {
            let stream = stream?;
            let engine = self.clone();
            thread::spawn(move || {
                if let Err(e) = engine.serve_connection(stream) {
                    debug!("mock connection ended: {}", e);
                }
            });
        }
        Ok(())
    }

    /// Binds an ephemeral local port and serves it on a background thread,
    /// returning the port.
    pub fn spawn_server(self: Arc<Self>) -> Result<u16> {
        let listener = TcpListener::bind(("127.0.0.1", 0))?;
        let port = listener.local_addr()?.port();
        self.port.store(port, Ordering::SeqCst);
        thread::spawn(move || {
            if let Err(e) = self.serve(listener) {
                warn!("mock server stopped: {}", e);
            }
        });
        Ok(port)
    }

    fn serve_connection(&self, stream: TcpStream) -> Result<()> {
        stream.set_nodelay(true)?;
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut writer = BufWriter::new(stream);
        loop {
            let frame = match read_frame(&mut reader) {
                Ok(frame) => frame,
                Err(Error::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            };
            let method = frame.method.parse::<Method>();
            match frame.kind {
                FrameKind::Call => {
                    let reply = method.and_then(|m| self.handle_call(m, &frame.bytes));
                    write_reply(&mut writer, reply)?;
                }
                FrameKind::ServerStreamCall => {
                    match method.and_then(|m| self.handle_server_stream(m, &frame.bytes)) {
                        Ok(chunks) => {
                            let mut failed = false;
                            for chunk in chunks {
                                match chunk {
                                    Ok(bytes) => write_frame(&mut writer, &Frame::chunk(bytes))?,
                                    Err(e) => {
                                        write_frame(&mut writer, &Frame::fault(&fault_message(&e)))?;
                                        failed = true;
                                        break;
                                    }
                                }
                            }
                            if !failed {
                                write_frame(&mut writer, &Frame::end_of_stream())?;
                            }
                        }
                        Err(e) => write_frame(&mut writer, &Frame::fault(&fault_message(&e)))?,
                    }
                }
                FrameKind::ClientStreamOpen => {
                    let mut chunks = FrameChunks {
                        reader: &mut reader,
                        done: false,
                        broken: false,
                    };
                    let reply = method.and_then(|m| self.handle_client_stream(m, &mut chunks));
                    // the client sends the whole stream before reading the reply
                    for _ in &mut chunks {}
                    if chunks.broken {
                        return Ok(());
                    }
                    write_reply(&mut writer, reply)?;
                }
                other => {
                    write_frame(
                        &mut writer,
                        &Frame::fault(&format!("unexpected {:?} frame", other)),
                    )?;
                }
            }
            writer.flush()?;
        }
    }
}

fn write_reply<W: Write>(writer: &mut W, reply: Result<Reply>) -> Result<()> {
    let frame = match reply {
        Ok(reply) => match reply.ownership {
            Ownership::Owned => Frame::new(FrameKind::Reply, "", reply.body),
            Ownership::Borrowed => Frame::new(FrameKind::BorrowedReply, "", reply.body),
        },
        Err(e) => Frame::fault(&fault_message(&e)),
    };
    write_frame(writer, &frame)
}

/// Chunk frames of a client stream, up to the end-of-stream frame.
struct FrameChunks<'a, R: Read> {
    reader: &'a mut R,
    done: bool,
    broken: bool,
}

impl<'a, R: Read> Iterator for FrameChunks<'a, R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match read_frame(self.reader) {
            Ok(frame) => match frame.kind {
                FrameKind::Chunk => Some(Ok(frame.bytes)),
                FrameKind::EndOfStream => {
                    self.done = true;
                    None
                }
                other => {
                    self.done = true;
                    self.broken = true;
                    Some(Err(Error::ParseError(format!(
                        "unexpected {:?} frame in client stream",
                        other
                    ))))
                }
            },
            Err(e) => {
                self.done = true;
                self.broken = true;
                Some(Err(e))
            }
        }
    }
}

fn into_error(f: Fault) -> Error {
    Error::from_server_message(f.0)
}

impl Engine for MockEngine {
    fn handle_call(&self, method: Method, body: &[u8]) -> Result<Reply> {
        self.call(method, body).map_err(into_error)
    }

    fn handle_server_stream(&self, method: Method, body: &[u8]) -> Result<ChunkStream> {
        let chunks = self.server_stream(method, body).map_err(into_error)?;
        Ok(Box::new(chunks.into_iter().map(Ok)))
    }

    fn handle_client_stream(&self, method: Method, chunks: ChunkSource<'_>) -> Result<Reply> {
        let chunks = chunks.collect::<Result<Vec<_>>>()?;
        self.client_stream(method, chunks).map_err(into_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn references_are_counted_per_holder() {
        let mut state = MockState::default();
        let entity = state.create(Stored::Scoping {
            location: LOCATION_NODAL.to_string(),
            ids: vec![1, 2],
        });
        let key = state.resolve(entity.id).unwrap_or_default();
        let dup = state.new_ref(key);
        assert_ne!(dup, entity.id);
        assert!(state.release(dup).is_ok());
        assert!(state.resolve(entity.id).is_ok());
        assert!(state.release(entity.id).is_ok());
        match state.resolve(entity.id) {
            Err(Fault(m)) => assert!(m.contains(NULL_OBJECT_MARKER)),
            Ok(_) => panic!("released reference still resolves"),
        }
        assert!(state.release(entity.id).is_err());
    }

    #[test]
    fn hex_round_trip() {
        let bytes = vec![0u8, 1, 254, 255, 16];
        assert_eq!(to_hex(&bytes), "0001feff10");
        assert_eq!(from_hex(&to_hex(&bytes)).ok(), Some(bytes));
        assert!(from_hex("abc").is_err());
        assert!(from_hex("zz").is_err());
        // two bytes of UTF-8, even length
        assert!(from_hex("é").is_err());
        assert!(from_hex("0é1").is_err());
    }

    #[test]
    fn unknown_operators_are_refused() {
        let engine = MockEngine::new();
        let body = engine
            .encode(&CreateOperatorRequest {
                name: "not_an_operator".to_string(),
                config: None,
            })
            .ok()
            .unwrap_or_default();
        match engine.handle_call(Method::CreateOperator, &body) {
            Err(Error::ServerError(m)) => assert!(m.contains("not_an_operator")),
            other => panic!("unexpected: {:?}", other.map(|r| r.body.len())),
        }
    }
}

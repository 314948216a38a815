//! Server-side operators: construction by name, pin connection, evaluation
//! and typed output retrieval.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use indicatif::{ProgressBar, ProgressStyle};

use dpf_core::{runtime_config, EntityId, ObjectKind, Pin, Specification, ValueType};

use crate::cache::CacheKey;
use crate::msg::{
    ConfigMap, CreateOperatorRequest, GetConfigRequest, GetOutputRequest, Method,
    OutputStreamFrame, RunRequest, SetConfigRequest, SpecificationRequest, StreamedInputHeader,
    UpdateInputRequest, WireValue,
};
use crate::registry::Handle;
use crate::session::Capability;
use crate::transport::Ownership;
use crate::value::{marshal, stream_with_header, unmarshal, Marshalled, Transfer, Value};
use crate::{Error, Result, Session};

/// Configuration of an operator, option name to value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperatorConfig {
    options: ConfigMap,
}

impl OperatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.options.get(name).map(|s| s.as_str())
    }

    pub fn set<V: ToString>(&mut self, name: &str, value: V) -> &mut Self {
        self.options.insert(name.to_string(), value.to_string());
        self
    }

    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }
}

struct OperatorInner {
    name: String,
    handle: Handle,
    spec: Mutex<Option<Arc<Specification>>>,
    progress: AtomicBool,
}

/// Named function exposed by the server, with numbered input and output
/// pins.
///
/// Cloning is cheap, clones refer to the same server-side operator.
#[derive(Clone)]
pub struct Operator {
    inner: Arc<OperatorInner>,
}

/// Maps evaluation failures reported by the server onto the error taxonomy.
fn map_eval_error(e: Error) -> Error {
    match e {
        Error::ServerError(m) if m.to_lowercase().contains("license") => Error::LicenseError(m),
        Error::Io(e) => Error::ServerError(e.to_string()),
        other => other,
    }
}

impl Operator {
    /// Creates the operator registered under `name` on the server.
    pub fn new(session: &Session, name: &str) -> Result<Self> {
        Self::new_with_config(session, name, None)
    }

    pub fn new_with_config(
        session: &Session,
        name: &str,
        config: Option<&OperatorConfig>,
    ) -> Result<Self> {
        let handle = session
            .rpc_handle(&CreateOperatorRequest {
                name: name.to_string(),
                config: config.map(|c| c.options.clone()),
            })
            .map_err(|e| match e {
                Error::ServerError(message) | Error::MissingObject(message) => {
                    Error::UnknownOperator {
                        name: name.to_string(),
                        message,
                    }
                }
                other => other,
            })?;
        if handle.kind() != ObjectKind::Operator {
            return Err(Error::TypeMismatch {
                pin: -1,
                expected: ObjectKind::Operator.type_name().to_string(),
                got: handle.kind().type_name().to_string(),
            });
        }
        debug!("created operator {} ({})", name, handle.id());
        Ok(Self {
            inner: Arc::new(OperatorInner {
                name: name.to_string(),
                handle,
                spec: Mutex::new(None),
                progress: AtomicBool::new(false),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn id(&self) -> EntityId {
        self.inner.handle.id()
    }

    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    pub fn session(&self) -> Result<Session> {
        self.inner.handle.session()
    }

    /// Places a value on an input pin. Objects are borrowed, the client
    /// keeps its reference.
    pub fn connect<V: Into<Value>>(&self, pin: Pin, value: V) -> Result<()> {
        self.connect_with(pin, value.into(), Transfer::Borrow)
    }

    /// Places a value on an input pin, choosing what happens to the client's
    /// reference of an object value.
    pub fn connect_with(&self, pin: Pin, value: Value, transfer: Transfer) -> Result<()> {
        let session = self.session()?;
        let spec = self.spec()?;
        let marshalled = marshal(&session, &value, pin, spec.input_pin(pin), transfer)?;
        match marshalled {
            Marshalled::Inline(wire) => {
                session.rpc(&UpdateInputRequest {
                    op: self.id(),
                    pin,
                    value: wire,
                })?;
            }
            Marshalled::Streamed(array) => {
                let chunk_size = runtime_config().default_file_chunk_size as usize;
                debug!(
                    "streaming {} bytes to pin {} of {}",
                    array.byte_len(),
                    pin,
                    self.name()
                );
                stream_with_header(
                    &session,
                    Method::UpdateInputStreamed,
                    &StreamedInputHeader {
                        op: self.id(),
                        pin,
                        elem_type: array.elem_type.into(),
                        count: array.count,
                    },
                    &array.data,
                    chunk_size,
                )?;
            }
        }
        session.inner().cache.clear();
        Ok(())
    }

    /// Connects an output pin of `producer` to an input pin of this
    /// operator. The producer is not evaluated.
    pub fn connect_output(&self, pin: Pin, producer: &Operator, producer_pin: Pin) -> Result<()> {
        self.connect_with(
            pin,
            Value::OperatorOutput(producer.clone(), producer_pin),
            Transfer::Borrow,
        )
    }

    /// Evaluates the operator as needed and returns the output of `pin` as
    /// a value of the given type.
    pub fn get_output(&self, pin: Pin, value_type: ValueType) -> Result<Value> {
        let session = self.session()?;
        let config = runtime_config();
        let request = GetOutputRequest {
            op: self.id(),
            pin,
            value_type,
            as_array: config.return_arrays,
        };

        if self.inner.progress.load(Ordering::SeqCst) {
            if session.supports(Capability::ProgressBar) {
                return self.get_output_with_progress(&session, &request);
            }
            debug!(
                "server {} has no progress reporting, evaluating {} silently",
                session.version(),
                self.name()
            );
        }

        let cache_key = if config.use_cache && self.spec()?.is_pure() {
            Some(CacheKey {
                op: self.id(),
                method: Method::GetOutput,
                args: session.encode(&(pin, value_type, request.as_array))?,
            })
        } else {
            None
        };
        if let Some(key) = &cache_key {
            if let Some(wire) = session.inner().cache.get(key) {
                trace!("cache hit for pin {} of {}", pin, self.name());
                return unmarshal(&session, wire, Ownership::Owned, value_type, pin);
            }
        }

        let reply = session
            .call_raw(Method::GetOutput, &request)
            .map_err(map_eval_error)?;
        let wire: WireValue = session.decode(&reply.body)?;
        if let Some(key) = cache_key {
            session.inner().cache.insert(key, wire.clone());
        }
        unmarshal(&session, wire, reply.ownership, value_type, pin)
    }

    fn get_output_with_progress(
        &self,
        session: &Session,
        request: &GetOutputRequest,
    ) -> Result<Value> {
        let stream = session
            .server_stream(Method::GetOutputWithProgress, request)
            .map_err(map_eval_error)?;
        let mut bar: Option<ProgressBar> = None;
        for chunk in stream {
            let chunk = chunk.map_err(map_eval_error)?;
            match session.decode::<OutputStreamFrame>(&chunk)? {
                OutputStreamFrame::Progress { current, total } => {
                    let bar = bar.get_or_insert_with(|| {
                        let bar = ProgressBar::new(total);
                        bar.set_style(
                            ProgressStyle::default_bar()
                                .template("{msg} [{bar:40.cyan/blue}] {pos}/{len}")
                                .unwrap_or_else(|_| ProgressStyle::default_bar())
                                .progress_chars("#>-"),
                        );
                        bar.set_message(self.name().to_string());
                        bar
                    });
                    bar.set_length(total);
                    bar.set_position(current);
                }
                OutputStreamFrame::Output(wire) => {
                    if let Some(bar) = bar.take() {
                        bar.finish_and_clear();
                    }
                    return unmarshal(
                        session,
                        wire,
                        Ownership::Owned,
                        request.value_type,
                        request.pin,
                    );
                }
            }
        }
        if let Some(bar) = bar {
            bar.abandon();
        }
        Err(Error::ServerError(format!(
            "progress stream of {} ended without an output",
            self.name()
        )))
    }

    /// Evaluates every output pin, each retrieved as the first type it
    /// declares. Pins declaring no type known to the client are skipped.
    pub fn eval(&self) -> Result<Vec<(Pin, Value)>> {
        let spec = self.spec()?;
        let mut outputs = Vec::new();
        for (pin, pin_spec) in &spec.outputs {
            match pin_spec.value_types().first() {
                Some(value_type) => outputs.push((*pin, self.get_output(*pin, *value_type)?)),
                None => trace!("skipping untyped output {} of {}", pin, self.name()),
            }
        }
        Ok(outputs)
    }

    /// Evaluates the operator for its side effects.
    pub fn run(&self) -> Result<()> {
        let session = self.session()?;
        session
            .rpc(&RunRequest { op: self.id() })
            .map_err(map_eval_error)?;
        Ok(())
    }

    /// Pin specification of the operator, fetched once and cached.
    pub fn spec(&self) -> Result<Arc<Specification>> {
        let mut cached = self.inner.spec.lock()?;
        if let Some(spec) = cached.as_ref() {
            return Ok(spec.clone());
        }
        let session = self.session()?;
        let spec = Arc::new(session.rpc(&SpecificationRequest { op: self.id() })?);
        *cached = Some(spec.clone());
        Ok(spec)
    }

    pub fn config(&self) -> Result<OperatorConfig> {
        let session = self.session()?;
        let response = session.rpc(&GetConfigRequest { op: self.id() })?;
        Ok(OperatorConfig {
            options: response.options,
        })
    }

    pub fn set_config(&self, config: &OperatorConfig) -> Result<()> {
        let session = self.session()?;
        session.rpc(&SetConfigRequest {
            op: self.id(),
            options: config.options.clone(),
        })?;
        session.inner().cache.clear();
        Ok(())
    }

    /// Opts in to progress reporting during output retrieval. Ignored on
    /// servers that don't report progress.
    pub fn progress_bar(&self, enabled: bool) {
        self.inner.progress.store(enabled, Ordering::SeqCst);
    }
}

impl fmt::Debug for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operator")
            .field("name", &self.inner.name)
            .field("handle", &self.inner.handle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn license_failures_are_classified() {
        let e = map_eval_error(Error::ServerError(
            "License checkout failed for increment dpf_premium".to_string(),
        ));
        assert!(matches!(e, Error::LicenseError(_)));
        let e = map_eval_error(Error::ServerError("division by zero".to_string()));
        assert!(matches!(e, Error::ServerError(_)));
    }

    #[test]
    fn config_builder() {
        let mut config = OperatorConfig::new();
        config.set("mutex", false).set("num_threads", 4);
        assert_eq!(config.get("num_threads"), Some("4"));
        assert_eq!(config.options().len(), 2);
    }

    fn cache_key(op: &Operator) -> CacheKey {
        CacheKey {
            op: op.id(),
            method: Method::GetOutput,
            args: vec![0],
        }
    }

    #[test]
    fn input_changes_clear_cached_outputs_of_other_operators() {
        let session = Session::local(Arc::new(crate::mock::MockEngine::new())).unwrap();
        let upstream = Operator::new(&session, "forward").unwrap();
        let downstream = Operator::new(&session, "forward").unwrap();
        session
            .inner()
            .cache
            .insert(cache_key(&downstream), WireValue::Double(1.));
        upstream.connect(0, 2.0).unwrap();
        assert_eq!(session.inner().cache.len(), 0);
    }

    #[test]
    fn released_operators_leave_no_cached_outputs() {
        let session = Session::local(Arc::new(crate::mock::MockEngine::new())).unwrap();
        let kept = Operator::new(&session, "forward").unwrap();
        let dropped = Operator::new(&session, "forward").unwrap();
        let cache = &session.inner().cache;
        cache.insert(cache_key(&kept), WireValue::Double(1.));
        cache.insert(cache_key(&dropped), WireValue::Double(2.));
        let key = cache_key(&dropped);
        drop(dropped);
        assert!(cache.get(&key).is_none());
        assert_eq!(cache.get(&cache_key(&kept)), Some(WireValue::Double(1.)));
    }
}

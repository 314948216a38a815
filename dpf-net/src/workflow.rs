//! Workflows: operators with externally named inputs and outputs.
//!
//! A workflow does no scheduling of its own. It is an index over operator
//! pins; evaluation happens on the server when a named output is requested.

use std::collections::{BTreeMap, BTreeSet};

use fnv::{FnvHashMap, FnvHashSet};

use dpf_core::{EntityId, ObjectKind, Pin, ValueType};

use crate::msg::{
    CreateWorkflowRequest, WorkflowAddOperatorsRequest, WorkflowSetInputNameRequest,
    WorkflowSetOutputNameRequest,
};
use crate::operator::Operator;
use crate::registry::Handle;
use crate::value::{Transfer, Value};
use crate::{Error, Result, Session};

/// Dataflow edge between two operators of a workflow.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Edge {
    pub producer: EntityId,
    pub producer_pin: Pin,
    pub consumer: EntityId,
    pub consumer_pin: Pin,
}

#[derive(Debug)]
pub struct Workflow {
    handle: Handle,
    operators: Vec<Operator>,
    inputs: BTreeMap<String, (Operator, Pin)>,
    outputs: BTreeMap<String, (Operator, Pin)>,
    edges: Vec<Edge>,
}

impl Workflow {
    /// Creates an empty workflow.
    pub fn new(session: &Session) -> Result<Self> {
        let handle = session.rpc_handle(&CreateWorkflowRequest {})?;
        if handle.kind() != ObjectKind::Workflow {
            return Err(Error::TypeMismatch {
                pin: -1,
                expected: ObjectKind::Workflow.type_name().to_string(),
                got: handle.kind().type_name().to_string(),
            });
        }
        Ok(Self {
            handle,
            operators: Vec::new(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            edges: Vec::new(),
        })
    }

    pub fn id(&self) -> EntityId {
        self.handle.id()
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn session(&self) -> Result<Session> {
        self.handle.session()
    }

    pub fn operators(&self) -> &[Operator] {
        &self.operators
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn input_names(&self) -> Vec<String> {
        self.inputs.keys().cloned().collect()
    }

    pub fn output_names(&self) -> Vec<String> {
        self.outputs.keys().cloned().collect()
    }

    fn contains(&self, op: &Operator) -> bool {
        self.operators.iter().any(|o| o.id() == op.id())
    }

    pub fn add(&mut self, op: &Operator) -> Result<()> {
        self.add_all(std::slice::from_ref(op))
    }

    /// Adds operators to the workflow. The server receives its own
    /// reference to each, the caller's operators stay usable.
    pub fn add_all(&mut self, ops: &[Operator]) -> Result<()> {
        let session = self.session()?;
        let mut seen = FnvHashSet::default();
        let new_ops = ops
            .iter()
            .filter(|op| !self.contains(op) && seen.insert(op.id()))
            .cloned()
            .collect::<Vec<_>>();
        if new_ops.is_empty() {
            return Ok(());
        }
        let mut ids = Vec::with_capacity(new_ops.len());
        for op in &new_ops {
            if !op.handle().belongs_to(&session) {
                return Err(Error::InvalidArgument(format!(
                    "operator {} belongs to another session",
                    op.name()
                )));
            }
        }
        for op in &new_ops {
            let duplicate = op.handle().duplicate_reference()?;
            ids.push(duplicate.take_ownership());
        }
        session.rpc(&WorkflowAddOperatorsRequest {
            wf: self.id(),
            ops: ids,
        })?;
        debug!("added {} operators to workflow {}", new_ops.len(), self.id());
        self.operators.extend(new_ops);
        Ok(())
    }

    /// Exposes an input pin of `op` under `name`. The operator is added to
    /// the workflow if it isn't part of it yet.
    pub fn set_input_name(&mut self, name: &str, op: &Operator, pin: Pin) -> Result<()> {
        self.add(op)?;
        let session = self.session()?;
        session.rpc(&WorkflowSetInputNameRequest {
            wf: self.id(),
            name: name.to_string(),
            op: op.id(),
            pin,
        })?;
        self.inputs.insert(name.to_string(), (op.clone(), pin));
        Ok(())
    }

    /// Exposes an output pin of `op` under `name`. The operator is added to
    /// the workflow if it isn't part of it yet.
    pub fn set_output_name(&mut self, name: &str, op: &Operator, pin: Pin) -> Result<()> {
        self.add(op)?;
        let session = self.session()?;
        session.rpc(&WorkflowSetOutputNameRequest {
            wf: self.id(),
            name: name.to_string(),
            op: op.id(),
            pin,
        })?;
        self.outputs.insert(name.to_string(), (op.clone(), pin));
        Ok(())
    }

    /// Connects two operators of the workflow and records the edge.
    pub fn link(
        &mut self,
        consumer: &Operator,
        consumer_pin: Pin,
        producer: &Operator,
        producer_pin: Pin,
    ) -> Result<()> {
        self.add_all(&[consumer.clone(), producer.clone()])?;
        consumer.connect_output(consumer_pin, producer, producer_pin)?;
        self.edges.push(Edge {
            producer: producer.id(),
            producer_pin,
            consumer: consumer.id(),
            consumer_pin,
        });
        Ok(())
    }

    fn input(&self, name: &str) -> Result<&(Operator, Pin)> {
        self.inputs.get(name).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "workflow {} has no input named {}",
                self.id(),
                name
            ))
        })
    }

    fn output(&self, name: &str) -> Result<&(Operator, Pin)> {
        self.outputs.get(name).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "workflow {} has no output named {}",
                self.id(),
                name
            ))
        })
    }

    /// Places a value on a named input.
    pub fn connect<V: Into<Value>>(&self, name: &str, value: V) -> Result<()> {
        let (op, pin) = self.input(name)?;
        op.connect(*pin, value)
    }

    pub fn connect_with(&self, name: &str, value: Value, transfer: Transfer) -> Result<()> {
        let (op, pin) = self.input(name)?;
        op.connect_with(*pin, value, transfer)
    }

    /// Evaluates and returns a named output.
    pub fn get_output(&self, name: &str, value_type: ValueType) -> Result<Value> {
        let (op, pin) = self.output(name)?;
        op.get_output(*pin, value_type)
    }

    /// Composes two workflows, feeding outputs of `self` into inputs of
    /// `other` as listed in `mapping` (output name, input name).
    ///
    /// The result exposes the inputs of both workflows that are not fed by
    /// the mapping, and the outputs of both that are not consumed by it.
    /// Names of `other` take precedence when both workflows use one.
    pub fn chain(&self, other: &Workflow, mapping: &[(&str, &str)]) -> Result<Workflow> {
        let session = self.session()?;
        if !other.handle.belongs_to(&session) {
            return Err(Error::InvalidArgument(
                "cannot chain workflows of different sessions".to_string(),
            ));
        }

        let mut bridges = Vec::with_capacity(mapping.len());
        for (out_name, in_name) in mapping {
            let (src, src_pin) = self.output(out_name)?;
            let (dst, dst_pin) = other.input(in_name)?;
            bridges.push((src.clone(), *src_pin, dst.clone(), *dst_pin));
        }

        let mut edges = self.edges.clone();
        edges.extend(other.edges.iter().copied());
        edges.extend(bridges.iter().map(|(src, src_pin, dst, dst_pin)| Edge {
            producer: src.id(),
            producer_pin: *src_pin,
            consumer: dst.id(),
            consumer_pin: *dst_pin,
        }));
        check_acyclic(&edges)?;

        let mut chained = Workflow::new(&session)?;
        let mut operators = self.operators.clone();
        operators.extend(other.operators.iter().cloned());
        chained.add_all(&operators)?;
        for (src, src_pin, dst, dst_pin) in &bridges {
            dst.connect_output(*dst_pin, src, *src_pin)?;
        }
        chained.edges = edges;

        let fed = mapping.iter().map(|(_, i)| *i).collect::<BTreeSet<_>>();
        let consumed = mapping.iter().map(|(o, _)| *o).collect::<BTreeSet<_>>();

        let mut inputs = BTreeMap::new();
        for (name, binding) in &self.inputs {
            inputs.insert(name.clone(), binding.clone());
        }
        for (name, binding) in &other.inputs {
            if !fed.contains(name.as_str()) {
                inputs.insert(name.clone(), binding.clone());
            }
        }
        let mut outputs = BTreeMap::new();
        for (name, binding) in &self.outputs {
            if !consumed.contains(name.as_str()) {
                outputs.insert(name.clone(), binding.clone());
            }
        }
        for (name, binding) in &other.outputs {
            outputs.insert(name.clone(), binding.clone());
        }

        for (name, (op, pin)) in &inputs {
            chained.set_input_name(name, op, *pin)?;
        }
        for (name, (op, pin)) in &outputs {
            chained.set_output_name(name, op, *pin)?;
        }
        debug!(
            "chained workflows {} and {} into {}",
            self.id(),
            other.id(),
            chained.id()
        );
        Ok(chained)
    }
}

/// Depth-first walk over the operator graph, failing on the first operator
/// found on a cycle.
fn check_acyclic(edges: &[Edge]) -> Result<()> {
    let mut graph: FnvHashMap<EntityId, Vec<EntityId>> = FnvHashMap::default();
    for edge in edges {
        graph.entry(edge.producer).or_default().push(edge.consumer);
        graph.entry(edge.consumer).or_default();
    }

    #[derive(Copy, Clone, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }
    let mut marks: FnvHashMap<EntityId, Mark> = FnvHashMap::default();

    // iterate in a stable order so the reported operator is deterministic
    let mut roots = graph.keys().copied().collect::<Vec<_>>();
    roots.sort_unstable();
    for root in roots {
        if marks.contains_key(&root) {
            continue;
        }
        let mut stack = vec![(root, 0usize)];
        marks.insert(root, Mark::Visiting);
        while let Some((node, next)) = stack.pop() {
            let successors = &graph[&node];
            if next < successors.len() {
                stack.push((node, next + 1));
                let succ = successors[next];
                match marks.get(&succ) {
                    Some(Mark::Visiting) => return Err(Error::Cycle(succ)),
                    Some(Mark::Done) => (),
                    None => {
                        marks.insert(succ, Mark::Visiting);
                        stack.push((succ, 0));
                    }
                }
            } else {
                marks.insert(node, Mark::Done);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(producer: EntityId, consumer: EntityId) -> Edge {
        Edge {
            producer,
            producer_pin: 0,
            consumer,
            consumer_pin: 0,
        }
    }

    #[test]
    fn chains_are_acyclic() {
        assert!(check_acyclic(&[edge(1, 2), edge(2, 3), edge(1, 3)]).is_ok());
        assert!(check_acyclic(&[]).is_ok());
    }

    #[test]
    fn cycles_are_reported() {
        let err = check_acyclic(&[edge(1, 2), edge(2, 3), edge(3, 1)]).unwrap_err();
        assert!(matches!(err, Error::Cycle(1)));
        assert!(matches!(
            check_acyclic(&[edge(5, 5)]).unwrap_err(),
            Error::Cycle(5)
        ));
    }
}

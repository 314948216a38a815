//! Typed wrappers over server-side data objects.

use dpf_core::version::set_ids_requires_gate;
use dpf_core::{runtime_config, EntityId, ObjectKind};

use crate::msg::{
    Array, CreateScopingRequest, CreateStringFieldRequest, Method, ScopingGetIdsRequest,
    ScopingSetIdsHeader, ScopingSetIdsRequest, StringFieldGetDataRequest,
};
use crate::session::Capability;
use crate::value::{stream_with_header, Object, Value};
use crate::{Error, Result, Session};

pub const LOCATION_NODAL: &str = "Nodal";
pub const LOCATION_ELEMENTAL: &str = "Elemental";

fn check_kind(object: &Object, kind: ObjectKind) -> Result<()> {
    if object.kind() == kind {
        Ok(())
    } else {
        Err(Error::TypeMismatch {
            pin: -1,
            expected: kind.type_name().to_string(),
            got: object.kind().type_name().to_string(),
        })
    }
}

/// Set of entity ids at a given location.
#[derive(Debug, Clone)]
pub struct Scoping {
    object: Object,
}

impl Scoping {
    pub fn new(session: &Session, location: &str) -> Result<Self> {
        let handle = session.rpc_handle(&CreateScopingRequest {
            location: location.to_string(),
        })?;
        Self::from_object(Object::new(handle))
    }

    pub fn from_object(object: Object) -> Result<Self> {
        check_kind(&object, ObjectKind::Scoping)?;
        Ok(Self { object })
    }

    pub fn id(&self) -> EntityId {
        self.object.id()
    }

    pub fn as_object(&self) -> &Object {
        &self.object
    }

    /// Replaces the ids of the scoping.
    ///
    /// Payloads above the streaming threshold are sent in chunks, which
    /// older servers can't receive. Smaller ones go inline on any server.
    pub fn set_ids(&self, ids: &[i32]) -> Result<()> {
        let session = self.object.session()?;
        let array = Array::from_i32s(ids);
        if !set_ids_requires_gate(ids.len(), 4) {
            session.rpc(&ScopingSetIdsRequest {
                id: self.id(),
                ids: array,
            })?;
            session.inner().cache.clear();
            return Ok(());
        }
        session.require_capability(Capability::StreamedScopingIds)?;
        debug!("streaming {} ids to scoping {}", ids.len(), self.id());
        stream_with_header(
            &session,
            Method::ScopingSetIdsStreamed,
            &ScopingSetIdsHeader {
                id: self.id(),
                count: array.count,
            },
            &array.data,
            runtime_config().default_file_chunk_size as usize,
        )?;
        session.inner().cache.clear();
        Ok(())
    }

    pub fn ids(&self) -> Result<Vec<i32>> {
        let session = self.object.session()?;
        session.rpc(&ScopingGetIdsRequest { id: self.id() })?.to_i32s()
    }
}

impl From<Scoping> for Value {
    fn from(s: Scoping) -> Self {
        Value::Object(s.object)
    }
}

/// Field of strings, one entry per entity.
#[derive(Debug, Clone)]
pub struct StringField {
    object: Object,
}

impl StringField {
    pub fn new(session: &Session, location: &str, data: &[String]) -> Result<Self> {
        let handle = session.rpc_handle(&CreateStringFieldRequest {
            location: location.to_string(),
            data: data.to_vec(),
        })?;
        Self::from_object(Object::new(handle))
    }

    pub fn from_object(object: Object) -> Result<Self> {
        check_kind(&object, ObjectKind::StringField)?;
        Ok(Self { object })
    }

    pub fn id(&self) -> EntityId {
        self.object.id()
    }

    pub fn as_object(&self) -> &Object {
        &self.object
    }

    pub fn data(&self) -> Result<Vec<String>> {
        let session = self.object.session()?;
        Ok(session.rpc(&StringFieldGetDataRequest { id: self.id() })?.v)
    }
}

impl From<StringField> for Value {
    fn from(f: StringField) -> Self {
        Value::Object(f.object)
    }
}

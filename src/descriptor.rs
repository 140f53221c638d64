//! Connection descriptors: the desired state of one queue client connection.
//!
//! A connection is identified by `<kind>:<flowId>:<componentId>`. The cluster
//! registry stores a [`DescriptorRecord`] under that key; [`ConnectionDescriptor::from_entry`]
//! validates the pair and produces the typed form the reconciler acts on.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Separator between the segments of a connection identifier.
const ID_SEPARATOR: char = ':';

/// Kind of queue client a connection represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    /// Subscribes to topics as part of a consumer group.
    Consumer,
    /// Publishes messages on behalf of a flow component.
    Producer,
}

impl ConnectionKind {
    /// Prefix used in connection identifiers.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Consumer => "consumer",
            Self::Producer => "producer",
        }
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionKind {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "consumer" => Ok(Self::Consumer),
            "producer" => Ok(Self::Producer),
            other => Err(DescriptorError::UnknownKind(other.to_owned())),
        }
    }
}

/// Errors produced while parsing or validating descriptors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    /// The identifier does not have the `kind:flow:component` shape.
    #[error("malformed connection id '{0}'")]
    MalformedId(String),
    /// The identifier prefix is not a known connection kind.
    #[error("unknown connection kind '{0}'")]
    UnknownKind(String),
    /// The registry key differs from the id derived from the descriptor.
    #[error("registry key '{key}' does not match derived id '{derived}'")]
    KeyMismatch {
        /// Key the entry is stored under.
        key: String,
        /// Id derived from the descriptor's kind, flow and component.
        derived: String,
    },
    /// The descriptor names a kind other than its key prefix.
    #[error("descriptor kind '{declared}' contradicts key kind '{key_kind}'")]
    KindMismatch {
        /// Kind taken from the key prefix.
        key_kind: ConnectionKind,
        /// Kind declared inside the descriptor.
        declared: ConnectionKind,
    },
    /// A consumer was registered without topics.
    #[error("consumer has no topics")]
    MissingTopics,
    /// A consumer was registered without a group id.
    #[error("consumer has no group id")]
    MissingGroupId,
    /// A producer carries consumer-only fields.
    #[error("producer carries consumer-only field '{0}'")]
    ConsumerFieldOnProducer(&'static str),
    /// The registry value is not a descriptor record.
    #[error("malformed registry value: {0}")]
    MalformedRecord(String),
}

/// Identifier of one connection, unique within the cluster registry.
///
/// Rendered and parsed as `<kind>:<flowId>:<componentId>`. Flow and
/// component ids are opaque but may not be empty or contain `:`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    kind: ConnectionKind,
    flow_id: String,
    component_id: String,
}

impl ConnectionId {
    /// Derive the id for a kind, flow and component.
    ///
    /// # Errors
    ///
    /// Returns [`DescriptorError::MalformedId`] if either segment is empty or
    /// contains the separator.
    pub fn new(
        kind: ConnectionKind,
        flow_id: impl Into<String>,
        component_id: impl Into<String>,
    ) -> Result<Self, DescriptorError> {
        let flow_id = flow_id.into();
        let component_id = component_id.into();
        let bad = |s: &str| s.is_empty() || s.contains(ID_SEPARATOR);
        if bad(&flow_id) || bad(&component_id) {
            return Err(DescriptorError::MalformedId(format!(
                "{kind}{ID_SEPARATOR}{flow_id}{ID_SEPARATOR}{component_id}"
            )));
        }
        Ok(Self {
            kind,
            flow_id,
            component_id,
        })
    }

    /// Connection kind encoded in the id.
    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    /// Owning flow.
    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    /// Owning component instance.
    pub fn component_id(&self) -> &str {
        &self.component_id
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{ID_SEPARATOR}{}{ID_SEPARATOR}{}",
            self.kind, self.flow_id, self.component_id
        )
    }
}

impl FromStr for ConnectionId {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(ID_SEPARATOR);
        let (Some(kind), Some(flow), Some(component), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(DescriptorError::MalformedId(s.to_owned()));
        };
        let kind = kind.parse::<ConnectionKind>()?;
        Self::new(kind, flow, component).map_err(|_| DescriptorError::MalformedId(s.to_owned()))
    }
}

impl TryFrom<String> for ConnectionId {
    type Error = DescriptorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ConnectionId> for String {
    fn from(id: ConnectionId) -> Self {
        id.to_string()
    }
}

/// Opaque credential and client configuration blob.
///
/// Passed through to the queue client untouched. Debug output never shows
/// the contents.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthBlob(serde_json::Value);

impl AuthBlob {
    /// Wrap a raw JSON value.
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// Expose the raw value. Use only when handing it to a queue client.
    pub fn expose(&self) -> &serde_json::Value {
        &self.0
    }
}

impl fmt::Debug for AuthBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("__REDACTED__")
    }
}

/// Registry value as written by flow lifecycle management.
///
/// Field names follow the registry's camelCase layout. Unknown fields are
/// ignored. Every field is optional: flow and component default to the
/// segments of the key the record is stored under.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptorRecord {
    /// Optional explicit kind; the key prefix is authoritative.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ConnectionKind>,
    /// Owning flow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    /// Owning component instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_id: Option<String>,
    /// Consumer topics.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub topics: BTreeSet<String>,
    /// Consumer group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    /// Whether a new consumer group starts from the earliest offset.
    #[serde(default)]
    pub from_beginning: bool,
    /// Credentials and client options.
    #[serde(default)]
    pub auth: AuthBlob,
}

impl DescriptorRecord {
    /// Read a record from a raw registry value.
    ///
    /// # Errors
    ///
    /// Returns [`DescriptorError::MalformedRecord`] if the value does not
    /// have the record's shape.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, DescriptorError> {
        Self::deserialize(value).map_err(|e| DescriptorError::MalformedRecord(e.to_string()))
    }

    /// Raw registry value for this record.
    pub fn to_value(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        if let Some(kind) = self.kind {
            map.insert("kind".to_owned(), kind.as_str().into());
        }
        if let Some(flow_id) = &self.flow_id {
            map.insert("flowId".to_owned(), flow_id.as_str().into());
        }
        if let Some(component_id) = &self.component_id {
            map.insert("componentId".to_owned(), component_id.as_str().into());
        }
        if !self.topics.is_empty() {
            let topics = self.topics.iter().map(|t| t.as_str().into()).collect();
            map.insert("topics".to_owned(), serde_json::Value::Array(topics));
        }
        if let Some(group_id) = &self.group_id {
            map.insert("groupId".to_owned(), group_id.as_str().into());
        }
        map.insert("fromBeginning".to_owned(), self.from_beginning.into());
        map.insert("auth".to_owned(), self.auth.expose().clone());
        serde_json::Value::Object(map)
    }
}

/// Kind-specific connection parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionSpec {
    /// Consumer group subscription.
    Consumer {
        /// Topics to subscribe to.
        topics: BTreeSet<String>,
        /// Consumer group id.
        group_id: String,
        /// Start from the earliest offset when the group has none.
        from_beginning: bool,
    },
    /// Producer client.
    Producer,
}

impl ConnectionSpec {
    /// Kind of connection this spec describes.
    pub fn kind(&self) -> ConnectionKind {
        match self {
            Self::Consumer { .. } => ConnectionKind::Consumer,
            Self::Producer => ConnectionKind::Producer,
        }
    }
}

/// Validated desired state of one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionDescriptor {
    id: ConnectionId,
    /// Kind-specific parameters.
    pub spec: ConnectionSpec,
    /// Credentials passed through to the queue client.
    pub auth: AuthBlob,
}

impl ConnectionDescriptor {
    /// Build a consumer descriptor.
    ///
    /// # Errors
    ///
    /// Returns an error if the ids are malformed, `topics` is empty or
    /// `group_id` is empty.
    pub fn consumer(
        flow_id: &str,
        component_id: &str,
        topics: impl IntoIterator<Item = impl Into<String>>,
        group_id: &str,
        from_beginning: bool,
        auth: AuthBlob,
    ) -> Result<Self, DescriptorError> {
        let id = ConnectionId::new(ConnectionKind::Consumer, flow_id, component_id)?;
        let topics: BTreeSet<String> = topics.into_iter().map(Into::into).collect();
        if topics.is_empty() {
            return Err(DescriptorError::MissingTopics);
        }
        if group_id.is_empty() {
            return Err(DescriptorError::MissingGroupId);
        }
        Ok(Self {
            id,
            spec: ConnectionSpec::Consumer {
                topics,
                group_id: group_id.to_owned(),
                from_beginning,
            },
            auth,
        })
    }

    /// Build a producer descriptor.
    ///
    /// # Errors
    ///
    /// Returns an error if the ids are malformed.
    pub fn producer(
        flow_id: &str,
        component_id: &str,
        auth: AuthBlob,
    ) -> Result<Self, DescriptorError> {
        let id = ConnectionId::new(ConnectionKind::Producer, flow_id, component_id)?;
        Ok(Self {
            id,
            spec: ConnectionSpec::Producer,
            auth,
        })
    }

    /// Validate a raw registry `{key, value}` pair.
    ///
    /// # Errors
    ///
    /// Returns [`DescriptorError::MalformedRecord`] if the value is not a
    /// record, otherwise the first failure reported by [`Self::from_entry`].
    pub fn from_value(key: &str, value: &serde_json::Value) -> Result<Self, DescriptorError> {
        Self::from_entry(key, &DescriptorRecord::from_value(value)?)
    }

    /// Validate a registry entry and produce the typed descriptor.
    ///
    /// The key prefix decides the kind. Flow and component missing from the
    /// record are taken from the key; present ones must match it.
    ///
    /// # Errors
    ///
    /// Returns the first validation failure found.
    pub fn from_entry(key: &str, record: &DescriptorRecord) -> Result<Self, DescriptorError> {
        let key_id: ConnectionId = key.parse()?;
        let kind = key_id.kind();
        if let Some(declared) = record.kind {
            if declared != kind {
                return Err(DescriptorError::KindMismatch {
                    key_kind: kind,
                    declared,
                });
            }
        }

        let flow_id = record.flow_id.as_deref().unwrap_or(key_id.flow_id());
        let component_id = record
            .component_id
            .as_deref()
            .unwrap_or(key_id.component_id());
        let derived = ConnectionId::new(kind, flow_id, component_id)?;
        if derived != key_id {
            return Err(DescriptorError::KeyMismatch {
                key: key.to_owned(),
                derived: derived.to_string(),
            });
        }

        match kind {
            ConnectionKind::Consumer => Self::consumer(
                flow_id,
                component_id,
                record.topics.iter().cloned(),
                record.group_id.as_deref().unwrap_or_default(),
                record.from_beginning,
                record.auth.clone(),
            ),
            ConnectionKind::Producer => {
                if !record.topics.is_empty() {
                    return Err(DescriptorError::ConsumerFieldOnProducer("topics"));
                }
                if record.group_id.is_some() {
                    return Err(DescriptorError::ConsumerFieldOnProducer("groupId"));
                }
                Self::producer(flow_id, component_id, record.auth.clone())
            }
        }
    }

    /// Registry record for this descriptor (the inverse of [`Self::from_entry`]).
    pub fn to_record(&self) -> DescriptorRecord {
        let (topics, group_id, from_beginning) = match &self.spec {
            ConnectionSpec::Consumer {
                topics,
                group_id,
                from_beginning,
            } => (topics.clone(), Some(group_id.clone()), *from_beginning),
            ConnectionSpec::Producer => (BTreeSet::new(), None, false),
        };
        DescriptorRecord {
            kind: Some(self.kind()),
            flow_id: Some(self.id.flow_id.clone()),
            component_id: Some(self.id.component_id.clone()),
            topics,
            group_id,
            from_beginning,
            auth: self.auth.clone(),
        }
    }

    /// Connection identifier.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Connection kind.
    pub fn kind(&self) -> ConnectionKind {
        self.spec.kind()
    }
}

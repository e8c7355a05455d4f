//! Call shapes and the opaque receiver/meta wrappers.
//!
//! Every outbound operation takes one struct-shaped request built with
//! chained methods: the leading receiver, the publish options and the
//! metadata are consumed by their own builder slots, everything else is a
//! user parameter. [`Receiver`] and [`Meta`] stay opaque and collapse to a
//! plain peer-id string and key-value map at the engine boundary.

use crate::stream::ByteSource;
use crate::transport::PublishOptions;
use patchbay_proto::{MetaMap, Value};

/// Directed-delivery target: the peer id the message is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receiver(String);

impl Receiver {
    /// Wrap a peer id.
    #[must_use]
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self(peer_id.into())
    }

    pub(crate) fn into_id(self) -> String {
        self.0
    }
}

impl From<&str> for Receiver {
    fn from(peer_id: &str) -> Self {
        Self::new(peer_id)
    }
}

impl From<String> for Receiver {
    fn from(peer_id: String) -> Self {
        Self::new(peer_id)
    }
}

/// Out-of-band metadata attached to a push, delivered on the first chunk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Meta(MetaMap);

impl Meta {
    /// An empty metadata map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one entry.
    #[must_use]
    pub fn entry(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub(crate) fn into_map(self) -> MetaMap {
        self.0
    }
}

impl From<MetaMap> for Meta {
    fn from(map: MetaMap) -> Self {
        Self(map)
    }
}

/// Out-of-band delivery details handed to event and service handlers
/// after the user parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallInfo {
    /// Peer id of the message sender
    pub sender: Option<String>,
    /// Directed-delivery target carried by the envelope
    pub receiver: Option<String>,
}

/// An event emission being built.
#[derive(Debug, Clone)]
pub struct Emission {
    pub(crate) event: String,
    pub(crate) params: Option<Vec<Value>>,
    pub(crate) receiver: Option<String>,
    pub(crate) options: Option<PublishOptions>,
}

impl Emission {
    /// Start building an emission of the named event.
    #[must_use]
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            params: None,
            receiver: None,
            options: None,
        }
    }

    /// Append one positional parameter.
    #[must_use]
    pub fn param(mut self, value: impl Into<Value>) -> Self {
        self.params.get_or_insert_with(Vec::new).push(value.into());
        self
    }

    /// Set all positional parameters at once.
    #[must_use]
    pub fn params(mut self, params: Vec<Value>) -> Self {
        self.params = Some(params);
        self
    }

    /// Address the emission at one peer instead of broadcasting.
    #[must_use]
    pub fn receiver(mut self, receiver: impl Into<Receiver>) -> Self {
        self.receiver = Some(receiver.into().into_id());
        self
    }

    /// Override the default publish options (QoS 0).
    #[must_use]
    pub fn options(mut self, options: PublishOptions) -> Self {
        self.options = Some(options);
        self
    }
}

/// A service call being built.
#[derive(Debug, Clone)]
pub struct Call {
    pub(crate) service: String,
    pub(crate) params: Option<Vec<Value>>,
    pub(crate) receiver: Option<String>,
    pub(crate) options: Option<PublishOptions>,
}

impl Call {
    /// Start building a call to the named service.
    #[must_use]
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            params: None,
            receiver: None,
            options: None,
        }
    }

    /// Append one positional parameter.
    #[must_use]
    pub fn param(mut self, value: impl Into<Value>) -> Self {
        self.params.get_or_insert_with(Vec::new).push(value.into());
        self
    }

    /// Set all positional parameters at once.
    #[must_use]
    pub fn params(mut self, params: Vec<Value>) -> Self {
        self.params = Some(params);
        self
    }

    /// Address the call at one registrant instead of broadcasting.
    #[must_use]
    pub fn receiver(mut self, receiver: impl Into<Receiver>) -> Self {
        self.receiver = Some(receiver.into().into_id());
        self
    }

    /// Override the default publish options (QoS 2).
    #[must_use]
    pub fn options(mut self, options: PublishOptions) -> Self {
        self.options = Some(options);
        self
    }
}

/// A resource fetch being built.
#[derive(Debug, Clone)]
pub struct Fetch {
    pub(crate) resource: String,
    pub(crate) params: Option<Vec<Value>>,
    pub(crate) receiver: Option<String>,
    pub(crate) options: Option<PublishOptions>,
}

impl Fetch {
    /// Start building a fetch of the named resource.
    #[must_use]
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            params: None,
            receiver: None,
            options: None,
        }
    }

    /// Append one positional parameter.
    #[must_use]
    pub fn param(mut self, value: impl Into<Value>) -> Self {
        self.params.get_or_insert_with(Vec::new).push(value.into());
        self
    }

    /// Set all positional parameters at once.
    #[must_use]
    pub fn params(mut self, params: Vec<Value>) -> Self {
        self.params = Some(params);
        self
    }

    /// Address the fetch at one provisioner instead of broadcasting.
    #[must_use]
    pub fn receiver(mut self, receiver: impl Into<Receiver>) -> Self {
        self.receiver = Some(receiver.into().into_id());
        self
    }

    /// Override the default publish options (QoS 2).
    #[must_use]
    pub fn options(mut self, options: PublishOptions) -> Self {
        self.options = Some(options);
        self
    }
}

/// A resource push being built.
#[derive(Debug)]
pub struct Push {
    pub(crate) resource: String,
    pub(crate) source: ByteSource,
    pub(crate) params: Option<Vec<Value>>,
    pub(crate) meta: Option<MetaMap>,
    pub(crate) receiver: Option<String>,
    pub(crate) options: Option<PublishOptions>,
}

impl Push {
    /// Start building a push of the given data to the named resource.
    #[must_use]
    pub fn new(resource: impl Into<String>, source: impl Into<ByteSource>) -> Self {
        Self {
            resource: resource.into(),
            source: source.into(),
            params: None,
            meta: None,
            receiver: None,
            options: None,
        }
    }

    /// Append one positional parameter.
    #[must_use]
    pub fn param(mut self, value: impl Into<Value>) -> Self {
        self.params.get_or_insert_with(Vec::new).push(value.into());
        self
    }

    /// Set all positional parameters at once.
    #[must_use]
    pub fn params(mut self, params: Vec<Value>) -> Self {
        self.params = Some(params);
        self
    }

    /// Attach metadata, carried on the first chunk only.
    #[must_use]
    pub fn meta(mut self, meta: Meta) -> Self {
        self.meta = Some(meta.into_map());
        self
    }

    /// Address the push at one provisioner instead of broadcasting.
    #[must_use]
    pub fn receiver(mut self, receiver: impl Into<Receiver>) -> Self {
        self.receiver = Some(receiver.into().into_id());
        self
    }

    /// Override the default publish options (QoS 2).
    #[must_use]
    pub fn options(mut self, options: PublishOptions) -> Self {
        self.options = Some(options);
        self
    }
}

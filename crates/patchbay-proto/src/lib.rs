//! # patchbay-proto
//!
//! Wire protocol definitions for the patchbay MQTT overlay.
//!
//! ## Pieces
//!
//! - [`Value`]: codec-neutral value model carried inside envelopes
//! - [`Codec`]: the two interchangeable wire formats (CBOR and JSON)
//! - [`Envelope`]: the five message kinds plus a validating parser
//! - [`TopicScheme`]: pluggable mapping between endpoints and MQTT topics
//!
//! ## Topic scheme
//!
//! Default topic structure: `{name}/{operation}/{peer-id or "any"}`

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod envelope;
pub mod topics;
pub mod value;

pub use codec::{Codec, CodecError};
pub use envelope::{
    Envelope, EventEmission, MetaMap, ProtocolError, ResourceRequest, ResourceResponse,
    ServiceRequest, ServiceResponse,
};
pub use topics::{Operation, SlashScheme, TopicAddress, TopicScheme};
pub use value::Value;

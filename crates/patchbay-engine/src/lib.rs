//! # patchbay-engine
//!
//! Peer-side protocol engine layering four interaction patterns over a
//! plain MQTT publish/subscribe transport:
//!
//! 1. **Events**: fire-and-forget emissions to subscribers
//! 2. **Services**: request/response calls with correlation and timeouts
//! 3. **Resource fetch**: pull a chunked byte stream from a provisioner
//! 4. **Resource push**: push a chunked byte stream to a provisioner
//!
//! A [`Peer`] owns the dispatch tables and talks to the broker through the
//! [`Transport`] contract; any MQTT client can sit behind it. Delivery can
//! be broadcast (every provisioning peer) or directed at one peer id.

pub mod dispatch;
pub mod error;
pub mod events;
pub mod ids;
pub mod options;
pub mod peer;
pub mod resources;
pub mod services;
pub mod stream;
pub mod transport;

pub use error::OverlayError;
pub use options::{Call, CallInfo, Emission, Fetch, Meta, Push, Receiver};
pub use peer::{Peer, PeerConfig, Provision, Registration, Subscription};
pub use resources::{DeferredReply, Fetched, ResourceContext};
pub use stream::{ByteSource, ByteStream, StreamWriter};
pub use transport::{
    InboundHandler, PublishOptions, PublishTuple, QosLevel, Transport, TransportError,
};

pub use patchbay_proto as proto;

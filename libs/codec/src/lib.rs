//! # Cache Protocol Codec
//!
//! The "rules" layer between the value types in `cache-types` and the
//! transports in `cache-network`:
//!
//! - request / response / event / locator envelopes ([`messages`])
//! - bincode framing with a shared size limit ([`frame`])
//! - the value type registry mapping type codes to constructors ([`registry`])
//!
//! ```text
//! cache-types → [cache-codec] → cache-network
//!     ↑              ↓                ↓
//! Keys/Values   Envelopes/Codes   Connections
//! ```
//!
//! Nothing here performs I/O.

pub mod error;
pub mod frame;
pub mod messages;
pub mod registry;

pub use error::{CodecError, Result};
pub use frame::{decode_message, encode_message, MAX_FRAME_SIZE};
pub use messages::{
    BucketLocations, BucketServerLocation, ClientIdentity, ConflationPreference, ConnectionKind,
    CorrelationId, Credentials, FunctionOptions, Handshake, LocatorRequest, LocatorResponse,
    Operation, PartitionAttributes, RegionEvent, Request, Response, ResponseBody, ServerError,
    ServerMessage,
};
pub use registry::{Constructor, EncodedValue, TypeRegistry, WireValue};

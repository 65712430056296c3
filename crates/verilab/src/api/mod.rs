//! Client layer for the hypervisor management API.
//!
//! Layered bottom-up: `transport` performs one HTTP round trip, `retry`
//! decides how often and how long to back off, `context` carries per-call
//! identity, and `adapter` hides the differences between the two supported
//! API generations behind one logical interface.

pub mod adapter;
pub mod context;
pub mod retry;
pub mod transport;

pub use adapter::{Entity, EntityKind, EntityVersion, ProtocolAdapter, TaskState, TaskStatus};
pub use context::{ApiGeneration, RequestContext};
pub use retry::RetryPolicy;
pub use transport::{
    ApiClient, ApiRequest, ApiResponse, Auth, FakeTransport, HttpTransport, Method, Transport,
};

//! Client-side plumbing for talking to a remote job engine.
//!
//! This crate holds the request dispatcher (cache, in-flight coalescing and
//! retry) and the live update channel (reconnecting push connection with
//! per-event-type subscriptions). Concrete HTTP and WebSocket transports live
//! in `jobline-net`.

/// Jittered reconnect backoff.
pub mod backoff;
/// TTL response cache keyed by request signature.
pub mod cache;
/// Request dispatcher and the transport seam.
pub mod dispatcher;
/// Stable error types and HTTP classification helpers.
pub mod error;
/// Coalescing registry for pending read-only requests.
pub mod inflight;
/// Live update channel and its connector seam.
pub mod live;
/// Exponential retry policy for read-only requests.
pub mod retry;
/// Cancellable timers and background tasks.
pub mod scheduler;
/// Deterministic request signatures.
pub mod signature;
/// Live channel lifecycle state machine.
pub mod state_machine;
/// Event and state-change handler registry.
pub mod subscriptions;
/// Wire and protocol types.
pub mod types;

pub use backoff::ReconnectBackoff;
pub use cache::ResponseCache;
pub use dispatcher::{DispatchOptions, DispatcherConfig, RequestDispatcher, Transport};
pub use error::{ApiError, ChannelError, ErrorCategory, HandlerError, classify_http_status};
pub use inflight::InFlightRegistry;
pub use live::{
    ChannelOrigin, LiveChannelConfig, LiveConnection, LiveConnector, LiveUpdateChannel,
    NORMAL_CLOSURE,
};
pub use retry::{RetryPolicy, run_with_retry};
pub use scheduler::ScheduledTask;
pub use signature::RequestSignature;
pub use state_machine::{ChannelTrigger, ConnectionStateMachine, Transition, TransitionError};
pub use subscriptions::{DeliveryReport, Subscription, SubscriptionRegistry};
pub use types::{ApiRequest, ConnectionState, InboundEvent, Method, OutboundMessage, event_types};

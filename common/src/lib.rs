pub mod animator;
pub mod bus;
pub mod config;
pub mod connectivity;
pub mod dispatch;
pub mod identity;
pub mod local;
pub mod node;
pub mod store;
pub mod timers;
pub mod topics;

#[cfg(test)]
mod testing;

pub use animator::{LightingAnimator, PwmChannel, PwmOutput, CHANNEL_LAYOUT, PWM_MAX_LEVEL};
pub use bus::{
    BusError, BusTransport, EventCategory, InboundMessage, LogEvent, MessageBusSession,
    SessionOptions,
};
pub use config::{ActivationSchedule, DeviceConfig, LightingProgram, TIMEZONES};
pub use connectivity::{
    ConnectivityMachine, ConnectivityState, JoinPolicy, Link, LinkDetails, LinkError,
    ReachabilityProbe,
};
pub use dispatch::{parse_form, Command, FormError, FormRoute, Origin, RestartReason};
pub use identity::DeviceIdentity;
pub use local::{
    decode_form, local_channel, LocalAuth, LocalError, LocalHandle, LocalInbox, LocalReply,
    LoginOutcome,
};
pub use node::{Board, Node, SystemInfo, TickOutcome, UpdateAgent};
pub use store::{ConfigStore, FileStorage, LoadError, RecordStorage, StoreError};
pub use timers::{idle_until, DueSignal, PolledTimers, TimerDriver, TimerKind};
pub use topics::*;

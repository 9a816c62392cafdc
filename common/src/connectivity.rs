use std::{
    net::{SocketAddr, TcpStream},
    time::{Duration, Instant},
};

use log::{info, warn};
use thiserror::Error;

use crate::config::DeviceConfig;

pub const JOIN_ATTEMPTS: u32 = 60;
pub const JOIN_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const ACCESS_POINT_PASSWORD: &str = "esp12345678";

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
pub const PROBE_CACHE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
#[error("link: {0}")]
pub struct LinkError(pub String);

/// Network details reported in the heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkDetails {
    pub ssid: String,
    pub mac: String,
    pub ip: String,
}

/// The network interface as seen by the state machine.
///
/// `backoff` is the only place the machine sleeps; implementations should
/// keep the platform watchdog fed while waiting.
pub trait Link: Send {
    fn is_connected(&mut self) -> bool;
    fn begin_join(&mut self, ssid: &str, password: &str, hostname: &str) -> Result<(), LinkError>;
    fn backoff(&mut self, delay: Duration);
    fn probe_internet(&mut self) -> bool;
    fn start_time_sync(&mut self);
    fn start_access_point(&mut self, ssid: &str, password: &str) -> Result<(), LinkError>;
    fn details(&self) -> LinkDetails;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    CheckLink,
    AcquireLink,
    VerifyInternet,
    SessionActive,
}

/// What the tick should do after one machine step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Nothing beyond the transition itself.
    Idle,
    /// Link confirmed up; local requests may be serviced.
    LinkUp,
    /// Session work is due this tick.
    Session,
    /// Join failed; the node is now its own access point.
    ProvisioningEntered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for JoinPolicy {
    fn default() -> Self {
        Self {
            attempts: JOIN_ATTEMPTS,
            delay: JOIN_RETRY_DELAY,
        }
    }
}

#[derive(Debug)]
pub struct ConnectivityMachine {
    state: ConnectivityState,
    provisioning: bool,
    time_sync_started: bool,
    policy: JoinPolicy,
}

impl Default for ConnectivityMachine {
    fn default() -> Self {
        Self::new(JoinPolicy::default())
    }
}

impl ConnectivityMachine {
    pub fn new(policy: JoinPolicy) -> Self {
        Self {
            state: ConnectivityState::CheckLink,
            provisioning: false,
            time_sync_started: false,
            policy,
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    pub fn is_provisioning(&self) -> bool {
        self.provisioning
    }

    /// Runs exactly one state's work. Does nothing once provisioning.
    pub fn step(&mut self, link: &mut dyn Link, config: &DeviceConfig, session_id: &str) -> Step {
        if self.provisioning {
            return Step::Idle;
        }

        match self.state {
            ConnectivityState::CheckLink => {
                if link.is_connected() {
                    self.state = ConnectivityState::VerifyInternet;
                    Step::LinkUp
                } else {
                    self.state = ConnectivityState::AcquireLink;
                    Step::Idle
                }
            }
            ConnectivityState::AcquireLink => {
                if self.acquire(link, config, session_id) {
                    self.state = ConnectivityState::VerifyInternet;
                    Step::Idle
                } else {
                    self.enter_provisioning(link, session_id);
                    Step::ProvisioningEntered
                }
            }
            ConnectivityState::VerifyInternet => {
                if link.probe_internet() {
                    if !self.time_sync_started {
                        self.time_sync_started = true;
                        link.start_time_sync();
                    }
                    self.state = ConnectivityState::SessionActive;
                } else {
                    warn!("reachability probe failed");
                    self.state = ConnectivityState::CheckLink;
                }
                Step::Idle
            }
            ConnectivityState::SessionActive => {
                self.state = ConnectivityState::CheckLink;
                Step::Session
            }
        }
    }

    fn acquire(&mut self, link: &mut dyn Link, config: &DeviceConfig, session_id: &str) -> bool {
        if !config.has_station_credentials() {
            info!("no station credentials stored");
            return false;
        }

        info!("joining network {}", config.ssid);
        if let Err(err) = link.begin_join(&config.ssid, &config.password, session_id) {
            warn!("join request rejected: {err}");
            return false;
        }
        for attempt in 1..=self.policy.attempts {
            if link.is_connected() {
                info!("joined {} after {attempt} polls", config.ssid);
                return true;
            }
            link.backoff(self.policy.delay);
        }
        warn!(
            "gave up joining {} after {} attempts",
            config.ssid, self.policy.attempts
        );
        false
    }

    fn enter_provisioning(&mut self, link: &mut dyn Link, session_id: &str) {
        self.provisioning = true;
        info!("entering provisioning mode as {session_id}");
        if let Err(err) = link.start_access_point(session_id, ACCESS_POINT_PASSWORD) {
            warn!("failed to start access point: {err}");
        }
    }
}

/// TCP reachability check with a short-lived cached result.
#[derive(Debug)]
pub struct ReachabilityProbe {
    target: SocketAddr,
    timeout: Duration,
    cache_for: Duration,
    last: Option<(Instant, bool)>,
}

impl ReachabilityProbe {
    pub fn new(target: SocketAddr) -> Self {
        Self {
            target,
            timeout: PROBE_TIMEOUT,
            cache_for: PROBE_CACHE,
            last: None,
        }
    }

    pub fn check(&mut self) -> bool {
        if let Some((at, reachable)) = self.last {
            if at.elapsed() < self.cache_for {
                return reachable;
            }
        }
        let reachable = TcpStream::connect_timeout(&self.target, self.timeout).is_ok();
        self.last = Some((Instant::now(), reachable));
        reachable
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::FakeLink;

    fn configured() -> DeviceConfig {
        DeviceConfig {
            ssid: "home".to_string(),
            password: "secret".to_string(),
            ..DeviceConfig::default()
        }
    }

    #[test]
    fn healthy_link_cycles_through_session() {
        let mut link = FakeLink::up();
        let mut machine = ConnectivityMachine::default();
        let config = configured();

        assert_eq!(machine.step(&mut link, &config, "node"), Step::LinkUp);
        assert_eq!(machine.state(), ConnectivityState::VerifyInternet);
        assert_eq!(machine.step(&mut link, &config, "node"), Step::Idle);
        assert_eq!(machine.state(), ConnectivityState::SessionActive);
        assert_eq!(machine.step(&mut link, &config, "node"), Step::Session);
        assert_eq!(machine.state(), ConnectivityState::CheckLink);
    }

    #[test]
    fn link_loss_after_session_goes_back_through_check_link() {
        let mut link = FakeLink::up();
        let mut machine = ConnectivityMachine::default();
        let config = configured();
        for _ in 0..3 {
            machine.step(&mut link, &config, "node");
        }

        link.handle().set_connected(false);
        link.handle().set_join_after(None);

        assert_eq!(machine.state(), ConnectivityState::CheckLink);
        assert_eq!(machine.step(&mut link, &config, "node"), Step::Idle);
        assert_eq!(machine.state(), ConnectivityState::AcquireLink);
    }

    #[test]
    fn time_sync_starts_once() {
        let mut link = FakeLink::up();
        let mut machine = ConnectivityMachine::default();
        let config = configured();

        for _ in 0..9 {
            machine.step(&mut link, &config, "node");
        }

        assert_eq!(link.handle().time_syncs(), 1);
    }

    #[test]
    fn failed_probe_returns_to_check_link() {
        let mut link = FakeLink::up();
        link.handle().set_probe(false);
        let mut machine = ConnectivityMachine::default();
        let config = configured();

        machine.step(&mut link, &config, "node");
        machine.step(&mut link, &config, "node");

        assert_eq!(machine.state(), ConnectivityState::CheckLink);
        assert_eq!(link.handle().time_syncs(), 0);
    }

    #[test]
    fn join_succeeds_within_attempt_ceiling() {
        let mut link = FakeLink::down();
        link.handle().set_join_after(Some(3));
        let mut machine = ConnectivityMachine::default();
        let config = configured();

        machine.step(&mut link, &config, "node");
        assert_eq!(machine.step(&mut link, &config, "node"), Step::Idle);

        assert_eq!(machine.state(), ConnectivityState::VerifyInternet);
        assert_eq!(link.handle().backoffs(), 2);
        assert_eq!(
            link.handle().joins(),
            vec![("home".to_string(), "node".to_string())]
        );
    }

    #[test]
    fn exhausted_join_enters_provisioning() {
        let mut link = FakeLink::down();
        let mut machine = ConnectivityMachine::default();
        let config = configured();

        machine.step(&mut link, &config, "vnode-1-000001");
        let step = machine.step(&mut link, &config, "vnode-1-000001");

        assert_eq!(step, Step::ProvisioningEntered);
        assert!(machine.is_provisioning());
        assert_eq!(link.handle().backoffs(), JOIN_ATTEMPTS);
        assert_eq!(
            link.handle().access_point(),
            Some(("vnode-1-000001".to_string(), ACCESS_POINT_PASSWORD.to_string()))
        );
        assert_eq!(machine.step(&mut link, &config, "vnode-1-000001"), Step::Idle);
    }

    #[test]
    fn empty_ssid_provisions_without_joining() {
        let mut link = FakeLink::down();
        let mut machine = ConnectivityMachine::default();
        let config = DeviceConfig::default();

        machine.step(&mut link, &config, "node");
        assert_eq!(
            machine.step(&mut link, &config, "node"),
            Step::ProvisioningEntered
        );
        assert!(link.handle().joins().is_empty());
        assert_eq!(link.handle().backoffs(), 0);
    }
}

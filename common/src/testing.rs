//! In-memory drivers for unit and scenario tests.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::{DateTime, TimeZone, Utc};
use rand::{rngs::StdRng, SeedableRng};

use crate::{
    animator::PwmOutput,
    bus::{BusError, BusTransport, InboundMessage, SessionOptions},
    config::DeviceConfig,
    connectivity::{Link, LinkDetails, LinkError},
    identity::DeviceIdentity,
    node::{Board, SystemInfo, UpdateAgent},
    store::{ConfigStore, RecordStorage, StoreError},
    timers::PolledTimers,
};

pub const TEST_MAC: [u8; 6] = [0x5c, 0xcf, 0x7f, 0x0a, 0x1b, 0x2c];

fn lock<T>(shared: &Mutex<T>) -> MutexGuard<'_, T> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<(Option<Vec<u8>>, bool)>>,
}

impl MemoryStorage {
    pub fn with_bytes(bytes: Vec<u8>) -> Self {
        let storage = Self::default();
        lock(&storage.inner).0 = Some(bytes);
        storage
    }

    pub fn bytes(&self) -> Option<Vec<u8>> {
        lock(&self.inner).0.clone()
    }

    pub fn fail_writes(&self, fail: bool) {
        lock(&self.inner).1 = fail;
    }
}

impl RecordStorage for MemoryStorage {
    fn read(&mut self) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.bytes())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        let mut inner = lock(&self.inner);
        if inner.1 {
            return Err(StoreError::Backend("write refused".to_string()));
        }
        inner.0 = Some(bytes.to_vec());
        Ok(())
    }
}

#[derive(Default)]
struct LinkState {
    connected: bool,
    joining: bool,
    join_after: Option<u32>,
    join_polls: u32,
    probe_fails: bool,
    joins: Vec<(String, String)>,
    backoffs: u32,
    time_syncs: u32,
    access_point: Option<(String, String)>,
}

#[derive(Clone, Default)]
pub struct FakeLink {
    state: Arc<Mutex<LinkState>>,
}

impl FakeLink {
    pub fn up() -> Self {
        let link = Self::default();
        link.set_connected(true);
        link
    }

    pub fn down() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> Self {
        self.clone()
    }

    pub fn set_connected(&self, connected: bool) {
        lock(&self.state).connected = connected;
    }

    /// Join completes on the given poll after `begin_join`; `None` never.
    pub fn set_join_after(&self, polls: Option<u32>) {
        lock(&self.state).join_after = polls;
    }

    pub fn set_probe(&self, ok: bool) {
        lock(&self.state).probe_fails = !ok;
    }

    pub fn joins(&self) -> Vec<(String, String)> {
        lock(&self.state).joins.clone()
    }

    pub fn backoffs(&self) -> u32 {
        lock(&self.state).backoffs
    }

    pub fn time_syncs(&self) -> u32 {
        lock(&self.state).time_syncs
    }

    pub fn access_point(&self) -> Option<(String, String)> {
        lock(&self.state).access_point.clone()
    }
}

impl Link for FakeLink {
    fn is_connected(&mut self) -> bool {
        let mut state = lock(&self.state);
        if state.connected {
            return true;
        }
        if state.joining {
            state.join_polls += 1;
            if state.join_after.is_some_and(|after| state.join_polls >= after) {
                state.joining = false;
                state.connected = true;
            }
        }
        state.connected
    }

    fn begin_join(&mut self, ssid: &str, _password: &str, hostname: &str) -> Result<(), LinkError> {
        let mut state = lock(&self.state);
        state.joins.push((ssid.to_string(), hostname.to_string()));
        state.joining = true;
        state.join_polls = 0;
        Ok(())
    }

    fn backoff(&mut self, _delay: Duration) {
        lock(&self.state).backoffs += 1;
    }

    fn probe_internet(&mut self) -> bool {
        let state = lock(&self.state);
        state.connected && !state.probe_fails
    }

    fn start_time_sync(&mut self) {
        lock(&self.state).time_syncs += 1;
    }

    fn start_access_point(&mut self, ssid: &str, password: &str) -> Result<(), LinkError> {
        lock(&self.state).access_point = Some((ssid.to_string(), password.to_string()));
        Ok(())
    }

    fn details(&self) -> LinkDetails {
        LinkDetails {
            ssid: "home".to_string(),
            mac: DeviceIdentity::from_mac(TEST_MAC).mac_string(),
            ip: "192.168.1.50".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retained: bool,
}

struct BusState {
    connected: bool,
    reachable: bool,
    fail_publishes: bool,
    options: Option<SessionOptions>,
    subscriptions: Vec<String>,
    published: Vec<Published>,
    inbound: VecDeque<InboundMessage>,
}

impl Default for BusState {
    fn default() -> Self {
        Self {
            connected: false,
            reachable: true,
            fail_publishes: false,
            options: None,
            subscriptions: Vec::new(),
            published: Vec::new(),
            inbound: VecDeque::new(),
        }
    }
}

#[derive(Clone, Default)]
pub struct FakeBus {
    state: Arc<Mutex<BusState>>,
}

impl FakeBus {
    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.state).reachable = reachable;
    }

    pub fn fail_publishes(&self, fail: bool) {
        lock(&self.state).fail_publishes = fail;
    }

    pub fn inject(&self, topic: &str, payload: Vec<u8>) {
        lock(&self.state).inbound.push_back(InboundMessage {
            topic: topic.to_string(),
            payload,
        });
    }

    pub fn last_options(&self) -> Option<SessionOptions> {
        lock(&self.state).options.clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.state).subscriptions.clone()
    }

    pub fn published(&self) -> Vec<Published> {
        lock(&self.state).published.clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<Published> {
        lock(&self.state)
            .published
            .iter()
            .filter(|message| message.topic == topic)
            .cloned()
            .collect()
    }

    pub fn clear_published(&self) {
        lock(&self.state).published.clear();
    }
}

impl BusTransport for FakeBus {
    fn connect(&mut self, options: &SessionOptions) -> Result<(), BusError> {
        let mut state = lock(&self.state);
        if !state.reachable {
            return Err(BusError::Unreachable(options.host.clone()));
        }
        state.connected = true;
        state.options = Some(options.clone());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), BusError> {
        lock(&self.state).subscriptions.push(topic.to_string());
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retained: bool) -> Result<(), BusError> {
        let mut state = lock(&self.state);
        if state.fail_publishes {
            return Err(BusError::Transport("publish refused".to_string()));
        }
        state.published.push(Published {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            retained,
        });
        Ok(())
    }

    fn poll(&mut self) -> Option<InboundMessage> {
        lock(&self.state).inbound.pop_front()
    }

    fn disconnect(&mut self) {
        lock(&self.state).connected = false;
    }
}

#[derive(Clone, Default)]
pub struct RecordingPwm {
    writes: Arc<Mutex<Vec<(u8, u16)>>>,
}

impl RecordingPwm {
    pub fn writes(&self) -> Vec<(u8, u16)> {
        lock(&self.writes).clone()
    }

    pub fn writes_for(&self, pin: u8) -> Vec<u16> {
        lock(&self.writes)
            .iter()
            .filter(|(written, _)| *written == pin)
            .map(|(_, level)| *level)
            .collect()
    }
}

impl PwmOutput for RecordingPwm {
    fn write(&mut self, pin: u8, level: u16) {
        lock(&self.writes).push((pin, level));
    }
}

pub struct FixedSystem;

impl SystemInfo for FixedSystem {
    fn free_heap(&self) -> u32 {
        40960
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 9)
            .single()
            .unwrap_or_default()
    }
}

pub struct NoUpdates;

impl UpdateAgent for NoUpdates {
    fn service(&mut self) {}
}

/// Handles onto the fake drivers inside a `Board`.
pub struct Rig {
    pub identity: DeviceIdentity,
    pub link: FakeLink,
    pub bus: FakeBus,
    pub storage: MemoryStorage,
    pub pwm: RecordingPwm,
}

impl Rig {
    /// Builds a board with `config` pre-stored (or nothing stored).
    pub fn new(config: Option<&DeviceConfig>, link_up: bool) -> (Board, Rig) {
        let storage = match config {
            Some(config) => {
                MemoryStorage::with_bytes(serde_json::to_vec_pretty(config).unwrap_or_default())
            }
            None => MemoryStorage::default(),
        };
        let link = if link_up { FakeLink::up() } else { FakeLink::down() };
        let rig = Rig {
            identity: DeviceIdentity::from_mac(TEST_MAC),
            link,
            bus: FakeBus::default(),
            storage,
            pwm: RecordingPwm::default(),
        };
        let board = Board {
            link: Box::new(rig.link.clone()),
            bus: Box::new(rig.bus.clone()),
            timers: Box::new(PolledTimers::new()),
            storage: Box::new(rig.storage.clone()),
            pwm: Box::new(rig.pwm.clone()),
            system: Box::new(FixedSystem),
            updates: Box::new(NoUpdates),
            local: None,
            rng: StdRng::seed_from_u64(42),
        };
        (board, rig)
    }

    pub fn stored_config(&self) -> Option<DeviceConfig> {
        let mut store = ConfigStore::new(Box::new(self.storage.clone()));
        store.load().ok().map(|loaded| loaded.config)
    }
}

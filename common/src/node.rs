use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::{
    animator::{LightingAnimator, PwmOutput},
    bus::{BusTransport, EventCategory, LogEvent, MessageBusSession},
    config::{DeviceConfig, LightingProgram},
    connectivity::{ConnectivityMachine, ConnectivityState, Link, Step},
    dispatch::{apply, parse_bus_message, Command, Origin, RestartReason},
    identity::DeviceIdentity,
    local::{LocalInbox, LocalReply},
    store::{ConfigStore, RecordStorage, StoreError},
    timers::{PendingWork, TaskScheduler, TimerDriver, TimerKind},
    topics::TopicSet,
};

pub const HEARTBEAT_TIME_FORMAT: &str = "%Y-%-m-%-d %-H:%M:%S";

pub trait SystemInfo: Send {
    fn free_heap(&self) -> u32;

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Firmware update agent, serviced once per session tick.
pub trait UpdateAgent: Send {
    fn service(&mut self);
}

/// Platform drivers handed to the node at boot.
pub struct Board {
    pub link: Box<dyn Link>,
    pub bus: Box<dyn BusTransport>,
    pub timers: Box<dyn TimerDriver>,
    pub storage: Box<dyn RecordStorage>,
    pub pwm: Box<dyn PwmOutput>,
    pub system: Box<dyn SystemInfo>,
    pub updates: Box<dyn UpdateAgent>,
    pub local: Option<LocalInbox>,
    pub rng: StdRng,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    Restart(RestartReason),
}

#[derive(Debug, Serialize)]
pub struct WifiDetails {
    #[serde(rename = "SSId")]
    pub ssid: String,
    #[serde(rename = "MACAddress")]
    pub mac_address: String,
    #[serde(rename = "IPAddress")]
    pub ip_address: String,
}

#[derive(Debug, Serialize)]
pub struct Heartbeat {
    #[serde(rename = "Time")]
    pub time: String,
    #[serde(rename = "Node")]
    pub node: u32,
    #[serde(rename = "Freeheap")]
    pub free_heap: u32,
    #[serde(rename = "FriendlyName")]
    pub friendly_name: String,
    #[serde(rename = "HeartbeatInterval")]
    pub heartbeat_interval_s: u32,
    #[serde(rename = "Wifi")]
    pub wifi: WifiDetails,
}

/// The whole runtime: one owned state struct driven by `tick`.
pub struct Node {
    identity: DeviceIdentity,
    session_id: String,
    config: DeviceConfig,
    store: ConfigStore,
    scheduler: TaskScheduler,
    machine: ConnectivityMachine,
    session: MessageBusSession,
    animator: LightingAnimator,
    link: Box<dyn Link>,
    pwm: Box<dyn PwmOutput>,
    system: Box<dyn SystemInfo>,
    updates: Box<dyn UpdateAgent>,
    local: Option<LocalInbox>,
    rng: StdRng,
}

impl Node {
    pub fn boot(board: Board, identity: DeviceIdentity) -> Self {
        let mut store = ConfigStore::new(board.storage);
        let config = store.load_or_recover(&identity);

        let topic = config.topic(&identity);
        let session_id = identity.session_id(&topic);
        let session = MessageBusSession::new(
            board.bus,
            TopicSet::new(&topic),
            &config.mqtt_server,
            config.mqtt_port,
            &session_id,
            identity.chip_id(),
        );

        let mut scheduler = TaskScheduler::new(board.timers);
        scheduler.arm_boot(&config);

        info!(
            "node {} booted as {session_id} ({})",
            identity.chip_id(),
            config.friendly_name
        );

        Self {
            identity,
            session_id,
            config,
            store,
            scheduler,
            machine: ConnectivityMachine::default(),
            session,
            animator: LightingAnimator::new(),
            link: board.link,
            pwm: board.pwm,
            system: board.system,
            updates: board.updates,
            local: board.local,
            rng: board.rng,
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn connectivity(&self) -> ConnectivityState {
        self.machine.state()
    }

    pub fn is_provisioning(&self) -> bool {
        self.machine.is_provisioning()
    }

    pub fn is_bus_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn animator(&self) -> &LightingAnimator {
        &self.animator
    }

    pub fn pending(&self) -> &PendingWork {
        self.scheduler.pending()
    }

    /// Next timer deadline the tick loop has to be awake for.
    pub fn next_due_ms(&self) -> Option<u64> {
        self.scheduler.next_due_ms()
    }

    /// One pass of the cooperative loop.
    pub fn tick(&mut self, now_ms: u64) -> TickOutcome {
        self.scheduler.poll(now_ms);
        self.run_animation();

        if self.machine.is_provisioning() {
            if let Some(outcome) = self.service_local() {
                return outcome;
            }
            if self.scheduler.take(TimerKind::AccessPoint) {
                warn!("provisioning timed out without new credentials");
                return self.restart(RestartReason::ProvisioningTimeout);
            }
            return TickOutcome::Continue;
        }

        match self
            .machine
            .step(self.link.as_mut(), &self.config, &self.session_id)
        {
            Step::Idle => TickOutcome::Continue,
            Step::LinkUp => self.service_local().unwrap_or(TickOutcome::Continue),
            Step::ProvisioningEntered => {
                self.scheduler.enter_provisioning();
                TickOutcome::Continue
            }
            Step::Session => self.run_session(),
        }
    }

    /// Applies one command, persisting before any follow-up work.
    ///
    /// On a failed write the previous config is restored and the command
    /// is abandoned.
    pub fn handle_command(
        &mut self,
        command: Command,
        origin: Origin,
    ) -> Result<Option<RestartReason>, StoreError> {
        if let Command::SetLevels(levels) = command {
            for (channel, level) in levels.into_iter().enumerate() {
                let Some(level) = level else { continue };
                if let Some(stored) = self.animator.set_target(channel, level) {
                    let target = &self.animator.channels()[channel];
                    debug!("{} (GPIO{}) target -> {stored}", target.label, target.pin);
                    self.publish_result(channel, stored);
                }
            }
            return Ok(None);
        }

        let previous = self.config.clone();
        let effects = apply(&mut self.config, command, origin);

        if effects.persist {
            if let Err(err) = self.store.save(&self.config) {
                error!("failed to persist config: {err}");
                self.config = previous;
                self.session.log_event(&LogEvent::new(
                    EventCategory::System,
                    4,
                    "Storage failure",
                    err.to_string(),
                ));
                return Err(err);
            }
        }

        for event in &effects.events {
            self.session.log_event(event);
        }
        if effects.rearm_heartbeat && !self.machine.is_provisioning() {
            self.scheduler.rearm_heartbeat(&self.config);
        }
        if effects.rearm_animation {
            self.scheduler.rearm_animation(&self.config);
        }
        if effects.reconnect_bus {
            let topic = self.config.topic(&self.identity);
            self.session_id = self.identity.session_id(&topic);
            self.session.reconfigure(
                TopicSet::new(&topic),
                &self.config.mqtt_server,
                self.config.mqtt_port,
                &self.session_id,
            );
        }
        Ok(effects.restart)
    }

    /// Stops the session and hands back the local inbox for the next boot.
    pub fn shutdown(mut self) -> Option<LocalInbox> {
        self.session.disconnect();
        self.local.take()
    }

    fn run_animation(&mut self) {
        if self.scheduler.take(TimerKind::PwmStep) {
            self.animator.step(self.pwm.as_mut());
        }

        if self.scheduler.take(TimerKind::PwmRandomize)
            && self.config.program() == LightingProgram::Randomize
        {
            let targets = self.animator.randomize(&mut self.rng);
            for (channel, target) in targets.into_iter().enumerate() {
                self.publish_result(channel, target);
            }
            let summary = targets
                .iter()
                .map(u16::to_string)
                .collect::<Vec<_>>()
                .join(",");
            self.session.log_event(&LogEvent::new(
                EventCategory::PwmAutoChange,
                0,
                "RGB values",
                summary,
            ));
        }
    }

    fn run_session(&mut self) -> TickOutcome {
        self.updates.service();

        let ip = self.link.details().ip;
        if let Err(err) = self.session.ensure_connected(&ip) {
            warn!("broker session unavailable: {err}");
        }

        if self.session.is_connected() {
            for message in self.session.drain_inbound() {
                let Some(command) = parse_bus_message(self.session.topics(), &message) else {
                    continue;
                };
                info!("bus command on {}: {command:?}", message.topic);
                match self.handle_command(command, Origin::Bus) {
                    Ok(Some(reason)) => return self.restart(reason),
                    Ok(None) => {}
                    Err(err) => warn!("bus command abandoned: {err}"),
                }
            }
        }

        if self.scheduler.take(TimerKind::Heartbeat) {
            if let Err(err) = self.send_heartbeat() {
                warn!("heartbeat not sent: {err}");
            }
        }

        TickOutcome::Continue
    }

    fn service_local(&mut self) -> Option<TickOutcome> {
        let requests = self.local.as_ref()?.drain();
        for request in requests {
            match self.handle_command(request.command.clone(), Origin::Local) {
                Ok(Some(reason)) => {
                    request.respond(LocalReply::accepted(true));
                    return Some(self.restart(reason));
                }
                Ok(None) => request.respond(LocalReply::accepted(false)),
                Err(err) => request.respond(LocalReply::rejected(err.to_string())),
            }
        }
        None
    }

    fn send_heartbeat(&mut self) -> Result<(), crate::bus::BusError> {
        let details = self.link.details();
        let heartbeat = Heartbeat {
            time: self
                .config
                .local_time(self.system.now_utc())
                .format(HEARTBEAT_TIME_FORMAT)
                .to_string(),
            node: self.identity.chip_id(),
            free_heap: self.system.free_heap(),
            friendly_name: self.config.friendly_name.clone(),
            heartbeat_interval_s: self.config.heartbeat_interval_s,
            wifi: WifiDetails {
                ssid: details.ssid,
                mac_address: details.mac,
                ip_address: details.ip,
            },
        };
        let topic = self.session.topics().heartbeat();
        self.session.publish_json(&topic, &heartbeat, false)
    }

    fn publish_result(&mut self, channel: usize, level: u16) {
        if !self.session.is_connected() {
            return;
        }
        let mut body = Map::new();
        body.insert(format!("PWM{channel}"), Value::String(level.to_string()));
        let topic = self.session.topics().result();
        if let Err(err) = self.session.publish_json(&topic, &Value::Object(body), false) {
            warn!("failed to acknowledge channel {channel}: {err}");
        }
    }

    fn restart(&mut self, reason: RestartReason) -> TickOutcome {
        info!("restart requested: {reason:?}");
        TickOutcome::Restart(reason)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use std::time::Duration;

    use super::*;
    use crate::{
        animator::PWM_MAX_LEVEL,
        local::{local_channel, LoginOutcome, LOCAL_REPLY_TIMEOUT},
        testing::Rig,
        timers::idle_until,
    };

    fn configured() -> DeviceConfig {
        DeviceConfig {
            ssid: "home".to_string(),
            password: "secret".to_string(),
            mqtt_topic: Some("porch".to_string()),
            friendly_name: "Porch lights".to_string(),
            ..DeviceConfig::default()
        }
    }

    /// Ticks until the session step has run once, returning the next time.
    fn run_to_session(node: &mut Node, mut now: u64) -> u64 {
        loop {
            let before = node.connectivity();
            assert_eq!(node.tick(now), TickOutcome::Continue);
            now += 1;
            if before == ConnectivityState::SessionActive {
                return now;
            }
        }
    }

    #[test]
    fn heartbeat_published_once_with_friendly_name() {
        let (board, rig) = Rig::new(Some(&configured()), true);
        let mut node = Node::boot(board, rig.identity);

        let now = run_to_session(&mut node, 0);
        assert!(node.is_bus_connected());
        assert!(rig.bus.published_to("viktak/spiti/porch/HEARTBEAT").is_empty());

        run_to_session(&mut node, now.max(300_000));
        run_to_session(&mut node, 300_100);

        let heartbeats = rig.bus.published_to("viktak/spiti/porch/HEARTBEAT");
        assert_eq!(heartbeats.len(), 1);
        let body: Value = serde_json::from_slice(&heartbeats[0].payload).unwrap();
        assert_eq!(
            body,
            json!({
                "Time": "2024-3-5 14:07:09",
                "Node": rig.identity.chip_id(),
                "Freeheap": 40960,
                "FriendlyName": "Porch lights",
                "HeartbeatInterval": 300,
                "Wifi": {
                    "SSId": "home",
                    "MACAddress": rig.identity.mac_string(),
                    "IPAddress": "192.168.1.50"
                }
            })
        );
        assert!(!node.pending().is_pending(TimerKind::Heartbeat));
    }

    #[test]
    fn heartbeat_flag_clears_when_publish_fails() {
        let (board, rig) = Rig::new(Some(&configured()), true);
        let mut node = Node::boot(board, rig.identity);
        run_to_session(&mut node, 0);

        rig.bus.fail_publishes(true);
        run_to_session(&mut node, 300_000);

        assert!(!node.pending().is_pending(TimerKind::Heartbeat));
        rig.bus.fail_publishes(false);
        run_to_session(&mut node, 300_100);
        assert!(rig.bus.published_to("viktak/spiti/porch/HEARTBEAT").is_empty());
    }

    #[test]
    fn heartbeat_uses_configured_zone() {
        let config = DeviceConfig {
            timezone: 8,
            ..configured()
        };
        let (board, rig) = Rig::new(Some(&config), true);
        let mut node = Node::boot(board, rig.identity);
        run_to_session(&mut node, 0);
        run_to_session(&mut node, 300_000);

        let heartbeats = rig.bus.published_to("viktak/spiti/porch/HEARTBEAT");
        let body: Value = serde_json::from_slice(&heartbeats[0].payload).unwrap();
        assert_eq!(body["Time"], "2024-3-5 23:07:09");
    }

    #[test]
    fn randomize_reports_four_targets_per_change() {
        let config = DeviceConfig {
            selected_program: LightingProgram::RANDOMIZE_ID,
            pwm_change_speed_s: 10,
            ..configured()
        };
        let (board, rig) = Rig::new(Some(&config), true);
        let mut node = Node::boot(board, rig.identity);
        run_to_session(&mut node, 0);

        for round in 1..=3u64 {
            rig.bus.clear_published();
            node.tick(round * 10_000);

            let acks = rig.bus.published_to("viktak/spiti/porch/RESULT");
            assert_eq!(acks.len(), 4);
            let targets = node.animator().targets();
            for (channel, ack) in acks.iter().enumerate() {
                let body: Value = serde_json::from_slice(&ack.payload).unwrap();
                let level = targets[channel];
                assert!(level <= 1023);
                assert_eq!(body, json!({ (format!("PWM{channel}")): level.to_string() }));
            }
        }
    }

    #[test]
    fn failed_join_provisions_then_restarts_on_timeout() {
        let (board, rig) = Rig::new(Some(&configured()), false);
        let mut node = Node::boot(board, rig.identity);

        assert_eq!(node.tick(0), TickOutcome::Continue);
        assert_eq!(node.tick(1), TickOutcome::Continue);
        assert!(node.is_provisioning());
        assert_eq!(rig.link.backoffs(), crate::connectivity::JOIN_ATTEMPTS);
        assert_eq!(
            rig.link.access_point().map(|(ssid, _)| ssid),
            Some("porch-0A1B2C".to_string())
        );

        assert_eq!(node.tick(2), TickOutcome::Continue);
        assert_eq!(node.tick(300_000), TickOutcome::Continue);
        assert!(!node.pending().is_pending(TimerKind::Heartbeat));
        assert_eq!(node.tick(300_001), TickOutcome::Continue);
        assert_eq!(
            node.tick(300_002),
            TickOutcome::Restart(RestartReason::ProvisioningTimeout)
        );
    }

    #[test]
    fn reset_command_restores_defaults_and_restarts() {
        let (board, rig) = Rig::new(Some(&configured()), true);
        let mut node = Node::boot(board, rig.identity);
        let now = run_to_session(&mut node, 0);

        rig.bus.inject(
            "viktak/spiti/porch/cmnd",
            br#"{"restart": true, "reset": true, "extra": [1]}"#.to_vec(),
        );
        node.tick(now);
        node.tick(now + 1);
        let outcome = node.tick(now + 2);

        assert_eq!(outcome, TickOutcome::Restart(RestartReason::FactoryReset));
        assert_eq!(node.config(), &DeviceConfig::default());
        assert_eq!(rig.stored_config(), Some(DeviceConfig::default()));
    }

    #[test]
    fn bus_restart_is_logged_as_bus_command() {
        let (board, rig) = Rig::new(Some(&configured()), true);
        let mut node = Node::boot(board, rig.identity);
        let now = run_to_session(&mut node, 0);
        rig.bus.clear_published();

        rig.bus
            .inject("viktak/spiti/porch/cmnd", br#"{"restart": null}"#.to_vec());
        let mut outcome = TickOutcome::Continue;
        for step in 0..3 {
            outcome = node.tick(now + step);
            if outcome != TickOutcome::Continue {
                break;
            }
        }

        assert_eq!(outcome, TickOutcome::Restart(RestartReason::Requested));
        let log = rig.bus.published_to("viktak/spiti/porch/log");
        assert_eq!(log.len(), 1);
        let record: Value = serde_json::from_slice(&log[0].payload).unwrap();
        assert_eq!(record["Category"], 3);
        assert_eq!(record["ID"], 2);
        assert_eq!(record["Title"], "Restart");
    }

    #[test]
    fn login_outcomes_reach_remote_log() {
        let (handle, inbox) = local_channel(4);
        let (mut board, rig) = Rig::new(Some(&configured()), true);
        board.local = Some(inbox);
        let mut node = Node::boot(board, rig.identity);
        let now = run_to_session(&mut node, 0);
        rig.bus.clear_published();

        handle.notify(LoginOutcome::Success.record("admin")).unwrap();
        run_to_session(&mut node, now);

        let log = rig.bus.published_to("viktak/spiti/porch/log");
        assert_eq!(log.len(), 1);
        let record: Value = serde_json::from_slice(&log[0].payload).unwrap();
        assert_eq!(
            record,
            json!({
                "Node": rig.identity.chip_id(),
                "Category": 7,
                "ID": 2,
                "Title": "Success",
                "Data": "User name: admin"
            })
        );
        assert_eq!(rig.stored_config(), Some(configured()));
    }

    #[test]
    fn bare_level_sets_target_and_acknowledges() {
        let (board, rig) = Rig::new(Some(&configured()), true);
        let mut node = Node::boot(board, rig.identity);
        let now = run_to_session(&mut node, 0);

        rig.bus
            .inject("viktak/spiti/porch/cmnd/pwm2", b"640".to_vec());
        run_to_session(&mut node, now);

        assert_eq!(node.animator().targets(), [0, 0, 640, 0]);
        let acks = rig.bus.published_to("viktak/spiti/porch/RESULT");
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].payload, br#"{"PWM2":"640"}"#);
    }

    #[test]
    fn failed_save_keeps_previous_config() {
        let (board, rig) = Rig::new(Some(&configured()), true);
        let mut node = Node::boot(board, rig.identity);
        rig.storage.fail_writes(true);

        let result = node.handle_command(Command::SelectProgram(1), Origin::Local);

        assert!(result.is_err());
        assert_eq!(node.config().selected_program, 0);
        assert_eq!(rig.stored_config(), Some(configured()));
    }

    #[test]
    fn animation_runs_while_provisioning() {
        let (board, rig) = Rig::new(None, false);
        let mut node = Node::boot(board, rig.identity);
        node.tick(0);
        node.tick(1);
        assert!(node.is_provisioning());

        node.handle_command(Command::level(0, 3).unwrap(), Origin::Local)
            .unwrap();
        for now in (10..100).step_by(4) {
            node.tick(now);
        }

        assert_eq!(node.animator().levels()[0], 3);
        assert_eq!(rig.pwm.writes_for(16), vec![1, 2, 3]);
    }

    /// Ticks at each timer deadline for one second and reports channel 0.
    fn ramp_for_one_second(adjustment_ms: u32) -> u16 {
        let config = DeviceConfig {
            pwm_adjustment_speed_ms: adjustment_ms,
            ..configured()
        };
        let (board, rig) = Rig::new(Some(&config), true);
        let mut node = Node::boot(board, rig.identity);
        node.handle_command(Command::level(0, PWM_MAX_LEVEL).unwrap(), Origin::Local)
            .unwrap();

        let mut now = 0;
        while now < 1_000 {
            node.tick(now);
            let idle = idle_until(node.next_due_ms(), now, Duration::from_millis(10));
            now += u64::try_from(idle.as_millis()).unwrap().max(1);
        }
        node.animator().levels()[0]
    }

    #[test]
    fn adjustment_speed_sets_ramp_rate() {
        let fast = ramp_for_one_second(1);
        let slow = ramp_for_one_second(10);

        assert!(fast >= 990, "fast ramp reached {fast}");
        assert!((95..=100).contains(&slow), "slow ramp reached {slow}");
    }

    #[test]
    fn local_credentials_in_provisioning_restart_node() {
        let (handle, inbox) = local_channel(4);
        let (mut board, rig) = Rig::new(None, false);
        board.local = Some(inbox);
        let mut node = Node::boot(board, rig.identity);
        node.tick(0);
        node.tick(1);
        assert!(node.is_provisioning());

        let submitter = std::thread::spawn(move || {
            handle.submit(
                Command::UpdateCredentials {
                    ssid: "home".to_string(),
                    password: "secret".to_string(),
                },
                LOCAL_REPLY_TIMEOUT,
            )
        });
        let mut now = 2;
        let outcome = loop {
            match node.tick(now) {
                TickOutcome::Continue => {
                    now += 1;
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                restart => break restart,
            }
        };

        assert_eq!(outcome, TickOutcome::Restart(RestartReason::ConfigChanged));
        assert!(submitter.join().unwrap().unwrap().restarting);
        assert_eq!(rig.stored_config().unwrap().ssid, "home");
    }

    #[test]
    fn missing_record_boots_with_saved_defaults() {
        let (board, rig) = Rig::new(None, true);
        let node = Node::boot(board, rig.identity);

        assert_eq!(node.config(), &DeviceConfig::default());
        assert_eq!(rig.stored_config(), Some(DeviceConfig::default()));
        assert_eq!(node.session_id(), "vnode-662316-0A1B2C");
    }
}

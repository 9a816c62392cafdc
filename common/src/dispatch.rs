use std::{collections::HashMap, str::FromStr};

use log::debug;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{
    animator::PWM_MAX_LEVEL,
    bus::{EventCategory, InboundMessage, LogEvent},
    config::{ActivationSchedule, DeviceConfig},
    topics::{InboundTopic, TopicSet, PWM_CHANNELS},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    FactoryReset,
    Requested,
    ConfigChanged,
    ProvisioningTimeout,
}

/// Optional edits from the general settings surface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneralUpdate {
    pub timezone: Option<u8>,
    pub friendly_name: Option<String>,
    pub heartbeat_interval_s: Option<u32>,
    pub mqtt_server: Option<String>,
    pub mqtt_port: Option<u16>,
    /// An empty topic reverts to the identity-derived one.
    pub mqtt_topic: Option<String>,
}

/// Where a command came from. Reboots are logged per origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Bus,
    Local,
}

impl Origin {
    fn reboot_category(self) -> EventCategory {
        match self {
            Origin::Bus => EventCategory::BusCommand,
            Origin::Local => EventCategory::Reboot,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SetLevels([Option<u16>; PWM_CHANNELS]),
    FactoryReset,
    Restart,
    UpdateGeneral(GeneralUpdate),
    UpdateCredentials { ssid: String, password: String },
    SelectProgram(u8),
    SetAnimationSpeed {
        change_s: Option<u32>,
        adjustment_ms: Option<u32>,
    },
    SetActivation(ActivationSchedule),
    /// Only mirrors the event to the remote log.
    Record(LogEvent),
}

impl Command {
    pub fn level(channel: usize, level: u16) -> Option<Self> {
        let mut levels = [None; PWM_CHANNELS];
        *levels.get_mut(channel)? = Some(level.min(PWM_MAX_LEVEL));
        Some(Self::SetLevels(levels))
    }
}

/// What the node must do after a command changed the config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Effects {
    pub persist: bool,
    pub restart: Option<RestartReason>,
    pub rearm_heartbeat: bool,
    pub rearm_animation: bool,
    pub reconnect_bus: bool,
    pub events: Vec<LogEvent>,
}

/// Interprets a message received on one of this node's command topics.
///
/// A JSON object carries directives; anything else on `cmnd/pwm<N>` is a
/// bare level. Everything else is dropped.
pub fn parse_bus_message(topics: &TopicSet, message: &InboundMessage) -> Option<Command> {
    let target = topics.classify(&message.topic)?;

    if let Ok(Value::Object(directives)) = serde_json::from_slice::<Value>(&message.payload) {
        return parse_directives(&directives);
    }

    match target {
        InboundTopic::Pwm(channel) => {
            let text = std::str::from_utf8(&message.payload).ok()?.trim();
            let level: i64 = text.parse().ok()?;
            let level = level.clamp(0, i64::from(PWM_MAX_LEVEL)) as u16;
            Command::level(channel, level)
        }
        InboundTopic::Command => {
            debug!("dropping unstructured payload on {}", message.topic);
            None
        }
    }
}

// Directives act on key presence; their values are not inspected.
fn parse_directives(directives: &Map<String, Value>) -> Option<Command> {
    if directives.contains_key("reset") {
        Some(Command::FactoryReset)
    } else if directives.contains_key("restart") {
        Some(Command::Restart)
    } else {
        None
    }
}

/// Applies a command to the config and reports the follow-up work.
///
/// `SetLevels` never touches the config and yields no effects.
pub fn apply(config: &mut DeviceConfig, command: Command, origin: Origin) -> Effects {
    let mut effects = Effects::default();
    match command {
        Command::SetLevels(_) => {}
        Command::FactoryReset => {
            *config = DeviceConfig::default();
            effects.persist = true;
            effects.restart = Some(RestartReason::FactoryReset);
            effects
                .events
                .push(LogEvent::new(origin.reboot_category(), 1, "Reset", ""));
        }
        Command::Restart => {
            effects.restart = Some(RestartReason::Requested);
            effects
                .events
                .push(LogEvent::new(origin.reboot_category(), 2, "Restart", ""));
        }
        Command::UpdateGeneral(update) => apply_general(config, update, &mut effects),
        Command::UpdateCredentials { ssid, password } => {
            config.ssid = ssid;
            config.password = password;
            config.sanitize();
            effects.persist = true;
            effects.restart = Some(RestartReason::ConfigChanged);
            effects.events.push(LogEvent::new(
                EventCategory::SettingsChange,
                5,
                "New network",
                config.ssid.clone(),
            ));
        }
        Command::SelectProgram(program) => {
            config.selected_program = program;
            effects.persist = true;
            effects.rearm_animation = true;
            effects.events.push(LogEvent::new(
                EventCategory::SettingsChange,
                6,
                "New program",
                program.to_string(),
            ));
        }
        Command::SetAnimationSpeed {
            change_s,
            adjustment_ms,
        } => {
            if let Some(change_s) = change_s {
                config.pwm_change_speed_s = change_s;
            }
            if let Some(adjustment_ms) = adjustment_ms {
                config.pwm_adjustment_speed_ms = adjustment_ms;
            }
            config.sanitize();
            effects.persist = true;
            effects.rearm_animation = true;
        }
        Command::SetActivation(schedule) => {
            config.activation = schedule;
            config.activation.sanitize();
            effects.persist = true;
        }
        Command::Record(event) => effects.events.push(event),
    }
    effects
}

fn apply_general(config: &mut DeviceConfig, update: GeneralUpdate, effects: &mut Effects) {
    let previous = config.clone();

    if let Some(timezone) = update.timezone {
        config.timezone = timezone;
    }
    if let Some(name) = update.friendly_name {
        config.friendly_name = name;
    }
    if let Some(interval) = update.heartbeat_interval_s {
        config.heartbeat_interval_s = interval;
    }
    if let Some(server) = update.mqtt_server {
        config.mqtt_server = server;
    }
    if let Some(port) = update.mqtt_port {
        config.mqtt_port = port;
    }
    if let Some(topic) = update.mqtt_topic {
        config.mqtt_topic = Some(topic);
    }
    config.sanitize();
    effects.persist = true;

    if config.timezone != previous.timezone {
        effects.events.push(LogEvent::new(
            EventCategory::SettingsChange,
            1,
            "New time zone",
            crate::config::TIMEZONES[usize::from(config.timezone)].0,
        ));
    }
    if config.friendly_name != previous.friendly_name {
        effects.events.push(LogEvent::new(
            EventCategory::SettingsChange,
            2,
            "New friendly name",
            config.friendly_name.clone(),
        ));
    }
    if config.heartbeat_interval_s != previous.heartbeat_interval_s {
        effects.rearm_heartbeat = true;
        effects.events.push(LogEvent::new(
            EventCategory::SettingsChange,
            3,
            "New heartbeat interval",
            config.heartbeat_interval_s.to_string(),
        ));
    }
    if config.mqtt_server != previous.mqtt_server
        || config.mqtt_port != previous.mqtt_port
        || config.mqtt_topic != previous.mqtt_topic
    {
        effects.reconnect_bus = true;
        effects.restart = Some(RestartReason::ConfigChanged);
        effects.events.push(LogEvent::new(
            EventCategory::SettingsChange,
            4,
            "New broker",
            format!("{}:{}", config.mqtt_server, config.mqtt_port),
        ));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormRoute {
    General,
    Network,
    Tools,
    Colour,
    Program,
    Speed,
    Activation,
}

impl FormRoute {
    pub const ALL: [FormRoute; 7] = [
        FormRoute::General,
        FormRoute::Network,
        FormRoute::Tools,
        FormRoute::Colour,
        FormRoute::Program,
        FormRoute::Speed,
        FormRoute::Activation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FormRoute::General => "general",
            FormRoute::Network => "network",
            FormRoute::Tools => "tools",
            FormRoute::Colour => "colour",
            FormRoute::Program => "program",
            FormRoute::Speed => "speed",
            FormRoute::Activation => "activation",
        }
    }
}

impl FromStr for FormRoute {
    type Err = FormError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        FormRoute::ALL
            .into_iter()
            .find(|route| route.as_str() == value)
            .ok_or_else(|| FormError::UnknownRoute(value.to_string()))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormError {
    #[error("unknown form `{0}`")]
    UnknownRoute(String),
    #[error("missing field `{0}`")]
    Missing(&'static str),
    #[error("field `{field}` has invalid value `{value}`")]
    Invalid { field: &'static str, value: String },
}

/// Turns a local form submission into a command.
pub fn parse_form(route: FormRoute, fields: &HashMap<String, String>) -> Result<Command, FormError> {
    let form = Form { fields };
    match route {
        FormRoute::General => Ok(Command::UpdateGeneral(GeneralUpdate {
            timezone: form.number("timezone")?,
            friendly_name: form.text("friendlyName"),
            heartbeat_interval_s: form.number("heartbeatInterval")?,
            mqtt_server: form.text("mqttServer"),
            mqtt_port: form.number("mqttPort")?,
            mqtt_topic: form.text("mqttTopic"),
        })),
        FormRoute::Network => Ok(Command::UpdateCredentials {
            ssid: form.text("ssid").ok_or(FormError::Missing("ssid"))?,
            password: form.text("password").unwrap_or_default(),
        }),
        FormRoute::Tools => {
            if form.has("reset") {
                Ok(Command::FactoryReset)
            } else if form.has("restart") {
                Ok(Command::Restart)
            } else {
                Err(FormError::Missing("reset"))
            }
        }
        FormRoute::Colour => {
            const FIELDS: [&str; PWM_CHANNELS] = ["pwm0", "pwm1", "pwm2", "pwm3"];
            let mut levels = [None; PWM_CHANNELS];
            for (level, field) in levels.iter_mut().zip(FIELDS) {
                *level = form
                    .number::<u16>(field)?
                    .map(|value| value.min(PWM_MAX_LEVEL));
            }
            Ok(Command::SetLevels(levels))
        }
        FormRoute::Program => form
            .number("program")?
            .map(Command::SelectProgram)
            .ok_or(FormError::Missing("program")),
        FormRoute::Speed => Ok(Command::SetAnimationSpeed {
            change_s: form.number("changeSpeed")?,
            adjustment_ms: form.number("adjustmentSpeed")?,
        }),
        FormRoute::Activation => Ok(Command::SetActivation(ActivationSchedule {
            on_hours: form.number("onHours")?.unwrap_or(0),
            on_minutes: form.number("onMinutes")?.unwrap_or(0),
            on_timer_hours: form.number("onTimerHours")?.unwrap_or(0),
            on_timer_minutes: form.number("onTimerMinutes")?.unwrap_or(0),
            off_hours: form.number("offHours")?.unwrap_or(0),
            off_minutes: form.number("offMinutes")?.unwrap_or(0),
            off_timer_hours: form.number("offTimerHours")?.unwrap_or(0),
            off_timer_minutes: form.number("offTimerMinutes")?.unwrap_or(0),
        })),
    }
}

struct Form<'a> {
    fields: &'a HashMap<String, String>,
}

impl Form<'_> {
    fn has(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    fn text(&self, field: &str) -> Option<String> {
        self.fields.get(field).map(|value| value.trim().to_string())
    }

    /// Absent or blank fields are `None`; unparsable ones are an error.
    fn number<T: FromStr>(&self, field: &'static str) -> Result<Option<T>, FormError> {
        match self.fields.get(field).map(|value| value.trim()) {
            None | Some("") => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| FormError::Invalid {
                field,
                value: raw.to_string(),
            }),
        }
    }
}

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use log::warn;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::identity::DeviceIdentity;

pub const DEFAULT_MQTT_SERVER: &str = "test.mosquitto.org";
pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_FRIENDLY_NAME: &str = "vNode";
pub const DEFAULT_HEARTBEAT_INTERVAL_S: u32 = 300;
pub const DEFAULT_PWM_ADJUSTMENT_SPEED_MS: u32 = 4;
pub const DEFAULT_PWM_CHANGE_SPEED_S: u32 = 10;

pub const MAX_SSID_CHARS: usize = 32;
pub const MAX_PASSWORD_CHARS: usize = 64;
pub const MAX_SERVER_CHARS: usize = 63;
pub const MAX_TOPIC_CHARS: usize = 31;
pub const MAX_FRIENDLY_NAME_CHARS: usize = 29;

pub const HEARTBEAT_INTERVAL_RANGE_S: (u32, u32) = (10, 86_400);
pub const PWM_ADJUSTMENT_SPEED_RANGE_MS: (u32, u32) = (1, 10);
pub const PWM_CHANGE_SPEED_RANGE_S: (u32, u32) = (1, 60);

/// Selectable zones, addressed by the persisted `timezone` index.
pub const TIMEZONES: [(&str, Tz); 10] = [
    ("UTC", Tz::UTC),
    ("Europe/London", Tz::Europe__London),
    ("Europe/Athens", Tz::Europe__Athens),
    ("Europe/Berlin", Tz::Europe__Berlin),
    ("America/New_York", Tz::America__New_York),
    ("America/Chicago", Tz::America__Chicago),
    ("America/Denver", Tz::America__Denver),
    ("America/Los_Angeles", Tz::America__Los_Angeles),
    ("Asia/Tokyo", Tz::Asia__Tokyo),
    ("Australia/Sydney", Tz::Australia__Sydney),
];

/// Animation program selected by `selectedProgram`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightingProgram {
    Manual,
    Randomize,
}

impl LightingProgram {
    pub const RANDOMIZE_ID: u8 = 1;

    pub fn from_id(id: u8) -> Self {
        match id {
            Self::RANDOMIZE_ID => Self::Randomize,
            _ => Self::Manual,
        }
    }
}

/// Daily on/off times plus their timer durations, kept as hour/minute pairs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActivationSchedule {
    #[serde(rename = "activationOnHours")]
    pub on_hours: u8,
    #[serde(rename = "activationOnMinutes")]
    pub on_minutes: u8,
    #[serde(rename = "activationOnTimerHours")]
    pub on_timer_hours: u8,
    #[serde(rename = "activationOnTimerMinutes")]
    pub on_timer_minutes: u8,
    #[serde(rename = "activationOffHours")]
    pub off_hours: u8,
    #[serde(rename = "activationOffMinutes")]
    pub off_minutes: u8,
    #[serde(rename = "activationOffTimerHours")]
    pub off_timer_hours: u8,
    #[serde(rename = "activationOffTimerMinutes")]
    pub off_timer_minutes: u8,
}

impl ActivationSchedule {
    pub fn sanitize(&mut self) {
        for hours in [
            &mut self.on_hours,
            &mut self.on_timer_hours,
            &mut self.off_hours,
            &mut self.off_timer_hours,
        ] {
            *hours = (*hours).min(23);
        }
        for minutes in [
            &mut self.on_minutes,
            &mut self.on_timer_minutes,
            &mut self.off_minutes,
            &mut self.off_timer_minutes,
        ] {
            *minutes = (*minutes).min(59);
        }
    }
}

/// The single persisted configuration record.
///
/// Field order is the on-disk key order, which keeps repeated saves
/// byte-identical.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceConfig {
    pub ssid: String,
    pub password: String,
    #[serde(rename = "mqttServer")]
    pub mqtt_server: String,
    #[serde(rename = "mqttPort")]
    pub mqtt_port: u16,
    /// `None` means "derive from the hardware identity on every boot".
    #[serde(rename = "mqttTopic", skip_serializing_if = "Option::is_none")]
    pub mqtt_topic: Option<String>,
    #[serde(rename = "friendlyName")]
    pub friendly_name: String,
    pub timezone: u8,
    #[serde(rename = "heartbeatInterval")]
    pub heartbeat_interval_s: u32,
    #[serde(rename = "selectedProgram")]
    pub selected_program: u8,
    #[serde(rename = "pwmAdjustmentSpeed")]
    pub pwm_adjustment_speed_ms: u32,
    #[serde(rename = "pwmChangeSpeed")]
    pub pwm_change_speed_s: u32,
    #[serde(flatten)]
    pub activation: ActivationSchedule,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            ssid: String::new(),
            password: String::new(),
            mqtt_server: DEFAULT_MQTT_SERVER.to_string(),
            mqtt_port: DEFAULT_MQTT_PORT,
            mqtt_topic: None,
            friendly_name: DEFAULT_FRIENDLY_NAME.to_string(),
            timezone: 0,
            heartbeat_interval_s: DEFAULT_HEARTBEAT_INTERVAL_S,
            selected_program: 0,
            pwm_adjustment_speed_ms: DEFAULT_PWM_ADJUSTMENT_SPEED_MS,
            pwm_change_speed_s: DEFAULT_PWM_CHANGE_SPEED_S,
            activation: ActivationSchedule::default(),
        }
    }
}

impl DeviceConfig {
    /// Builds a config from a parsed record, defaulting each field on its own.
    ///
    /// Returns the keys that fell back to their default. A key that is
    /// present but empty or zero counts as absent.
    pub fn from_record(record: &Map<String, Value>) -> (Self, Vec<&'static str>) {
        let defaults = Self::default();
        let mut fields = Fields {
            record,
            defaulted: Vec::new(),
        };

        let timezone = fields.number("timezone", u64::from(defaults.timezone));
        let index = usize::try_from(timezone)
            .ok()
            .filter(|index| *index < TIMEZONES.len());
        let timezone = if let Some(index) = index {
            index as u8
        } else {
            warn!("config key `timezone` index {timezone} out of range, using default");
            fields.defaulted.push("timezone");
            defaults.timezone
        };

        let activation = ActivationSchedule {
            on_hours: fields.small("activationOnHours"),
            on_minutes: fields.small("activationOnMinutes"),
            on_timer_hours: fields.small("activationOnTimerHours"),
            on_timer_minutes: fields.small("activationOnTimerMinutes"),
            off_hours: fields.small("activationOffHours"),
            off_minutes: fields.small("activationOffMinutes"),
            off_timer_hours: fields.small("activationOffTimerHours"),
            off_timer_minutes: fields.small("activationOffTimerMinutes"),
        };

        let mut config = Self {
            ssid: fields.string("ssid", &defaults.ssid),
            password: fields.string("password", &defaults.password),
            mqtt_server: fields.string("mqttServer", &defaults.mqtt_server),
            mqtt_port: fields
                .number("mqttPort", u64::from(defaults.mqtt_port))
                .min(u64::from(u16::MAX)) as u16,
            mqtt_topic: fields.optional_string("mqttTopic"),
            friendly_name: fields.string("friendlyName", &defaults.friendly_name),
            timezone,
            heartbeat_interval_s: fields
                .number("heartbeatInterval", u64::from(defaults.heartbeat_interval_s))
                .min(u64::from(u32::MAX)) as u32,
            selected_program: fields
                .number("selectedProgram", u64::from(defaults.selected_program))
                .min(u64::from(u8::MAX)) as u8,
            pwm_adjustment_speed_ms: fields
                .number(
                    "pwmAdjustmentSpeed",
                    u64::from(defaults.pwm_adjustment_speed_ms),
                )
                .min(u64::from(u32::MAX)) as u32,
            pwm_change_speed_s: fields
                .number("pwmChangeSpeed", u64::from(defaults.pwm_change_speed_s))
                .min(u64::from(u32::MAX)) as u32,
            activation,
        };
        config.sanitize();

        (config, fields.defaulted)
    }

    /// Clamps numeric fields to their bounds and truncates over-long strings.
    pub fn sanitize(&mut self) {
        truncate_chars(&mut self.ssid, MAX_SSID_CHARS);
        truncate_chars(&mut self.password, MAX_PASSWORD_CHARS);
        truncate_chars(&mut self.mqtt_server, MAX_SERVER_CHARS);
        truncate_chars(&mut self.friendly_name, MAX_FRIENDLY_NAME_CHARS);
        if let Some(topic) = self.mqtt_topic.as_mut() {
            truncate_chars(topic, MAX_TOPIC_CHARS);
        }
        if self.mqtt_topic.as_deref().is_some_and(str::is_empty) {
            self.mqtt_topic = None;
        }

        if self.mqtt_server.trim().is_empty() {
            self.mqtt_server = DEFAULT_MQTT_SERVER.to_string();
        }
        if self.mqtt_port == 0 {
            self.mqtt_port = DEFAULT_MQTT_PORT;
        }
        if self.friendly_name.is_empty() {
            self.friendly_name = DEFAULT_FRIENDLY_NAME.to_string();
        }
        if usize::from(self.timezone) >= TIMEZONES.len() {
            self.timezone = 0;
        }

        let (min, max) = HEARTBEAT_INTERVAL_RANGE_S;
        self.heartbeat_interval_s = self.heartbeat_interval_s.clamp(min, max);
        let (min, max) = PWM_ADJUSTMENT_SPEED_RANGE_MS;
        self.pwm_adjustment_speed_ms = self.pwm_adjustment_speed_ms.clamp(min, max);
        let (min, max) = PWM_CHANGE_SPEED_RANGE_S;
        self.pwm_change_speed_s = self.pwm_change_speed_s.clamp(min, max);

        self.activation.sanitize();
    }

    pub fn topic(&self, identity: &DeviceIdentity) -> String {
        self.mqtt_topic
            .clone()
            .unwrap_or_else(|| identity.default_topic())
    }

    pub fn program(&self) -> LightingProgram {
        LightingProgram::from_id(self.selected_program)
    }

    pub fn has_station_credentials(&self) -> bool {
        !self.ssid.trim().is_empty()
    }

    pub fn zone(&self) -> Tz {
        TIMEZONES
            .get(usize::from(self.timezone))
            .map(|(_, tz)| *tz)
            .unwrap_or(Tz::UTC)
    }

    pub fn local_time(&self, now: DateTime<Utc>) -> DateTime<Tz> {
        now.with_timezone(&self.zone())
    }
}

struct Fields<'a> {
    record: &'a Map<String, Value>,
    defaulted: Vec<&'static str>,
}

impl Fields<'_> {
    fn string(&mut self, key: &'static str, default: &str) -> String {
        self.optional_string(key)
            .unwrap_or_else(|| default.to_string())
    }

    fn optional_string(&mut self, key: &'static str) -> Option<String> {
        match self.record.get(key) {
            Some(Value::String(value)) if !value.is_empty() => Some(value.clone()),
            Some(Value::String(_)) | None => {
                self.defaulted.push(key);
                None
            }
            Some(_) => {
                warn!("config key `{key}` is not a string, using default");
                self.defaulted.push(key);
                None
            }
        }
    }

    fn number(&mut self, key: &'static str, default: u64) -> u64 {
        match self.record.get(key) {
            Some(value) => match value.as_u64() {
                Some(0) => {
                    self.defaulted.push(key);
                    default
                }
                Some(number) => number,
                None => {
                    warn!("config key `{key}` is not an unsigned integer, using default");
                    self.defaulted.push(key);
                    default
                }
            },
            None => {
                self.defaulted.push(key);
                default
            }
        }
    }
}

impl Fields<'_> {
    /// Hour or minute value; clamped later by `ActivationSchedule::sanitize`.
    fn small(&mut self, key: &'static str) -> u8 {
        self.number(key, 0).min(u64::from(u8::MAX)) as u8
    }
}

fn truncate_chars(value: &mut String, max_chars: usize) {
    if let Some((index, _)) = value.char_indices().nth(max_chars) {
        value.truncate(index);
    }
}

use core::convert::TryInto;
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, SyncSender, TrySendError},
        Arc, Condvar, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    gpio::{AnyOutputPin, Output, PinDriver, Pins},
    ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver, Resolution, LEDC},
    units::FromValueType,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    mqtt::client::{EspMqttClient, LwtConfiguration, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    ota::EspOta,
    sntp::EspSntp,
    sys::EspError,
    timer::{EspTaskTimerService, EspTimer},
    wifi::EspWifi,
};
use log::{info, warn};
use rand::{rngs::StdRng, SeedableRng};
use serde::Serialize;

use lightnode_common::{
    decode_form, idle_until,
    local::{LOCAL_QUEUE_DEPTH, LOCAL_REPLY_TIMEOUT},
    local_channel, parse_form, Board, BusError, BusTransport, ConfigStore, DeviceIdentity,
    DueSignal, FormRoute, InboundMessage, Link, LinkDetails, LinkError, LocalAuth, LocalError,
    LocalHandle, LoginOutcome, Node, PwmOutput, ReachabilityProbe, RecordStorage, SessionOptions,
    StoreError, SystemInfo, TickOutcome, TimerDriver, TimerKind, UpdateAgent, CHANNEL_LAYOUT,
};

const NVS_NAMESPACE: &str = "lightnode";
const NVS_CONFIG_KEY: &str = "config_json";
const MAX_HTTP_BODY: usize = 1024;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const MAX_TICK_IDLE: Duration = Duration::from_millis(10);
const WATCHDOG_SLICE: Duration = Duration::from_millis(100);
const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(30);
const MQTT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MQTT_INBOUND_DEPTH: usize = 16;
const PROBE_ADDR: ([u8; 4], u16) = ([1, 1, 1, 1], 53);
const PWM_FREQUENCY_KHZ: u32 = 1;
const STATUS_LED_PIN: i32 = 0;
const LED_FAST_BLINK_MS: u64 = 200;
const LED_SLOW_BLINK_MS: u64 = 900;

struct StatusLed {
    pin: PinDriver<'static, AnyOutputPin, Output>,
    lit: bool,
}

#[derive(Clone)]
struct NvsStorage {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    accepted: bool,
    restarting: bool,
    message: String,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let storage = NvsStorage {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let Peripherals {
        modem, ledc, pins, ..
    } = Peripherals::take()?;

    let wifi = EspWifi::new(modem, sys_loop, Some(nvs_partition)).context("wifi init failed")?;
    let identity = DeviceIdentity::from_mac(
        wifi.sta_netif()
            .get_mac()
            .context("failed to read station MAC")?,
    );
    info!("node {identity} starting");
    ensure_wifi_defaults(&storage, &identity);

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    let pwm = init_pwm(ledc, pins)?;
    let status_led = init_status_led(STATUS_LED_PIN);

    let (local, inbox) = local_channel(LOCAL_QUEUE_DEPTH);
    let auth = Arc::new(LocalAuth::new(
        option_env!("ADMIN_USER").unwrap_or("admin"),
        option_env!("ADMIN_PASS").unwrap_or("admin"),
    ));
    let server = create_http_server(local, auth)?;

    let wake = Arc::new(TickWake::default());
    let board = Board {
        link: Box::new(EspLink::new(wifi)),
        bus: Box::new(EspBus::new()),
        timers: Box::new(EspTimers::new(Arc::clone(&wake))?),
        storage: Box::new(storage),
        pwm: Box::new(pwm),
        system: Box::new(EspSystem),
        updates: Box::new(EspUpdates::default()),
        local: Some(inbox),
        rng: StdRng::from_entropy(),
    };
    spawn_tick_loop(board, identity, wake, status_led)?;

    // Keep the server alive for the program lifetime.
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

/// Seeds empty station credentials from the build environment.
fn ensure_wifi_defaults(storage: &NvsStorage, identity: &DeviceIdentity) {
    let Some(ssid) = option_env!("WIFI_SSID") else {
        return;
    };

    let mut store = ConfigStore::new(Box::new(storage.clone()));
    let mut config = store.load_or_recover(identity);
    if !config.ssid.is_empty() {
        return;
    }

    config.ssid = ssid.to_string();
    config.password = option_env!("WIFI_PASS").unwrap_or_default().to_string();
    config.sanitize();
    match store.save(&config) {
        Ok(()) => info!("seeded wifi credentials for `{ssid}` from build environment"),
        Err(err) => warn!("failed to seed wifi credentials: {err}"),
    }
}

fn spawn_tick_loop(
    board: Board,
    identity: DeviceIdentity,
    wake: Arc<TickWake>,
    mut status_led: Option<StatusLed>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("tick".into())
        .stack_size(16 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register tick loop with watchdog: {err:#}");
            }

            let mut node = Node::boot(board, identity);
            loop {
                feed_watchdog();
                let now_ms = monotonic_ms();

                if let TickOutcome::Restart(reason) = node.tick(now_ms) {
                    warn!("restarting device ({reason:?})");
                    drop(node.shutdown());
                    thread::sleep(Duration::from_millis(100));
                    unsafe { esp_idf_svc::sys::esp_restart() };
                }

                update_status_led(
                    &mut status_led,
                    node.is_provisioning(),
                    node.is_bus_connected(),
                    now_ms,
                );
                wake.wait(idle_until(node.next_due_ms(), monotonic_ms(), MAX_TICK_IDLE));
            }
        })
        .context("failed to spawn tick thread")?;
    Ok(())
}

fn create_http_server(
    local: LocalHandle,
    auth: Arc<LocalAuth>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    {
        let auth = auth.clone();
        let local = local.clone();
        server.fn_handler::<anyhow::Error, _>("/login", Method::Post, move |mut req| {
            let fields = decode_form(&read_request_text(&mut req)?);
            let user = fields.get("user").map(String::as_str).unwrap_or_default();
            let password = fields
                .get("password")
                .map(String::as_str)
                .unwrap_or_default();

            let Some(token) = auth.login(user, password) else {
                warn!("rejected local login as {user}");
                record_login(&local, LoginOutcome::Failure, user);
                return write_error(req, 401, "invalid credentials");
            };
            record_login(&local, LoginOutcome::Success, user);

            info!("local login as {user}");
            let cookie = LocalAuth::set_cookie(&token);
            let body = serde_json::to_vec(&SubmitResponse {
                accepted: true,
                restarting: false,
                message: "logged in".to_string(),
            })?;
            req.into_response(
                200,
                Some("OK"),
                &[
                    ("Content-Type", "application/json; charset=utf-8"),
                    ("Set-Cookie", cookie.as_str()),
                ],
            )?
            .write_all(&body)?;
            Ok(())
        })?;
    }

    {
        let auth = auth.clone();
        let local = local.clone();
        server.fn_handler::<anyhow::Error, _>("/logout", Method::Post, move |req| {
            auth.logout(req.header("Cookie"));
            record_login(&local, LoginOutcome::Logout, "");
            req.into_status_response(204)?;
            Ok(())
        })?;
    }

    for route in FormRoute::ALL {
        let local = local.clone();
        let auth = auth.clone();
        let uri = format!("/settings/{}", route.as_str());
        server.fn_handler::<anyhow::Error, _>(&uri, Method::Post, move |mut req| {
            if !auth.is_authorized(req.header("Cookie")) {
                return write_error(req, 401, "login required");
            }

            let fields = decode_form(&read_request_text(&mut req)?);
            let command = match parse_form(route, &fields) {
                Ok(command) => command,
                Err(err) => return write_error(req, 400, &err.to_string()),
            };

            match local.submit(command, LOCAL_REPLY_TIMEOUT) {
                Ok(reply) if reply.accepted => write_json(
                    req,
                    &SubmitResponse {
                        accepted: true,
                        restarting: reply.restarting,
                        message: reply.message,
                    },
                ),
                Ok(reply) => write_error(req, 500, &reply.message),
                Err(err @ LocalError::Timeout(_)) => write_error(req, 504, &err.to_string()),
                Err(err) => write_error(req, 503, &err.to_string()),
            }
        })?;
    }

    Ok(server)
}

fn record_login(local: &LocalHandle, outcome: LoginOutcome, user: &str) {
    if let Err(err) = local.notify(outcome.record(user)) {
        warn!("login event for `{user}` not queued: {err}");
    }
}

fn read_request_text(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<String> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    String::from_utf8(body).context("request body is not utf-8")
}

fn write_json<T: Serialize>(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

/// Station and provisioning AP on the built-in radio.
struct EspLink {
    wifi: EspWifi<'static>,
    probe: ReachabilityProbe,
    sntp: Option<EspSntp<'static>>,
    ssid: String,
}

impl EspLink {
    fn new(wifi: EspWifi<'static>) -> Self {
        Self {
            wifi,
            probe: ReachabilityProbe::new(SocketAddr::from(PROBE_ADDR)),
            sntp: None,
            ssid: String::new(),
        }
    }

    fn join(&mut self, ssid: &str, password: &str, hostname: &str) -> anyhow::Result<()> {
        if let Err(err) = self.wifi.sta_netif_mut().set_hostname(hostname) {
            warn!("failed to set hostname `{hostname}`: {err}");
        }

        let auth_method = if password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: ssid
                    .try_into()
                    .map_err(|_| anyhow!("wifi ssid too long"))?,
                password: password
                    .try_into()
                    .map_err(|_| anyhow!("wifi password too long"))?,
                auth_method,
                ..Default::default()
            }))?;

        self.wifi.start()?;
        self.wifi.connect()?;
        disable_wifi_power_save();
        self.ssid = ssid.to_string();
        info!("wifi started, joining `{ssid}` as {hostname}");
        Ok(())
    }

    fn open_access_point(&mut self, ssid: &str, password: &str) -> anyhow::Result<()> {
        let _ = self.wifi.disconnect();
        let _ = self.wifi.stop();

        self.wifi
            .set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
                ssid: ssid
                    .try_into()
                    .map_err(|_| anyhow!("provisioning AP SSID too long"))?,
                password: password
                    .try_into()
                    .map_err(|_| anyhow!("provisioning AP password too long"))?,
                auth_method: AuthMethod::WPA2Personal,
                channel: 1,
                ..Default::default()
            }))?;
        self.wifi.start()?;
        info!("provisioning AP started on `{ssid}`");
        Ok(())
    }
}

impl Link for EspLink {
    fn is_connected(&mut self) -> bool {
        self.wifi.is_up().unwrap_or(false)
    }

    fn begin_join(&mut self, ssid: &str, password: &str, hostname: &str) -> Result<(), LinkError> {
        self.join(ssid, password, hostname)
            .map_err(|err| LinkError(format!("{err:#}")))
    }

    fn backoff(&mut self, delay: Duration) {
        let deadline = Instant::now() + delay;
        loop {
            feed_watchdog();
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            thread::sleep(remaining.min(WATCHDOG_SLICE));
        }
    }

    fn probe_internet(&mut self) -> bool {
        self.is_connected() && self.probe.check()
    }

    fn start_time_sync(&mut self) {
        match EspSntp::new_default() {
            Ok(sntp) => {
                info!("SNTP initialized");
                self.sntp = Some(sntp);
            }
            Err(err) => warn!("failed to start SNTP: {err}"),
        }
    }

    fn start_access_point(&mut self, ssid: &str, password: &str) -> Result<(), LinkError> {
        self.open_access_point(ssid, password)
            .map_err(|err| LinkError(format!("{err:#}")))
    }

    fn details(&self) -> LinkDetails {
        let netif = self.wifi.sta_netif();
        LinkDetails {
            ssid: self.ssid.clone(),
            mac: netif
                .get_mac()
                .map(|mac| DeviceIdentity::from_mac(mac).mac_string())
                .unwrap_or_default(),
            ip: netif
                .get_ip_info()
                .map(|info| info.ip.to_string())
                .unwrap_or_default(),
        }
    }
}

/// ESP-IDF MQTT client; inbound publishes are queued by the client task.
struct EspBus {
    client: Option<EspMqttClient<'static>>,
    connected: Arc<AtomicBool>,
    inbound_tx: SyncSender<InboundMessage>,
    inbound_rx: Receiver<InboundMessage>,
}

impl EspBus {
    fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::sync_channel(MQTT_INBOUND_DEPTH);
        Self {
            client: None,
            connected: Arc::new(AtomicBool::new(false)),
            inbound_tx,
            inbound_rx,
        }
    }
}

impl BusTransport for EspBus {
    fn connect(&mut self, options: &SessionOptions) -> Result<(), BusError> {
        self.disconnect();

        let url = format!("mqtt://{}:{}", options.host, options.port);
        let conf = MqttClientConfiguration {
            client_id: Some(options.client_id.as_str()),
            keep_alive_interval: Some(MQTT_KEEP_ALIVE),
            lwt: Some(LwtConfiguration {
                topic: options.will_topic.as_str(),
                payload: options.will_payload.as_bytes(),
                qos: QoS::AtMostOnce,
                retain: true,
            }),
            ..Default::default()
        };

        let connected = self.connected.clone();
        let inbound = self.inbound_tx.clone();
        let client = EspMqttClient::new_cb(&url, &conf, move |event| match event.payload() {
            EventPayload::Connected(_) => connected.store(true, Ordering::Relaxed),
            EventPayload::Disconnected => connected.store(false, Ordering::Relaxed),
            EventPayload::Received {
                topic: Some(topic),
                data,
                details: Details::Complete,
                ..
            } => {
                let message = InboundMessage {
                    topic: topic.to_string(),
                    payload: data.to_vec(),
                };
                if let Err(TrySendError::Full(_)) = inbound.try_send(message) {
                    warn!("inbound queue full, dropping message on {topic}");
                }
            }
            EventPayload::Error(err) => warn!("mqtt client error: {err:?}"),
            _ => {}
        })
        .map_err(|err| BusError::Transport(err.to_string()))?;

        let deadline = Instant::now() + MQTT_CONNECT_TIMEOUT;
        while !self.connected.load(Ordering::Relaxed) {
            if Instant::now() >= deadline {
                return Err(BusError::Unreachable(format!(
                    "{}:{} did not answer",
                    options.host, options.port
                )));
            }
            feed_watchdog();
            thread::sleep(Duration::from_millis(50));
        }

        self.client = Some(client);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client.is_some() && self.connected.load(Ordering::Relaxed)
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), BusError> {
        let client = self.client.as_mut().ok_or(BusError::NotConnected)?;
        client
            .subscribe(topic, QoS::AtMostOnce)
            .map(|_| ())
            .map_err(|err| BusError::Transport(err.to_string()))
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retained: bool) -> Result<(), BusError> {
        let client = self.client.as_mut().ok_or(BusError::NotConnected)?;
        client
            .publish(topic, QoS::AtMostOnce, retained, payload)
            .map(|_| ())
            .map_err(|err| BusError::Transport(err.to_string()))
    }

    fn poll(&mut self) -> Option<InboundMessage> {
        self.inbound_rx.try_recv().ok()
    }

    fn disconnect(&mut self) {
        self.client = None;
        self.connected.store(false, Ordering::Relaxed);
        while self.inbound_rx.try_recv().is_ok() {}
    }
}

/// Lets timer callbacks cut the tick loop's idle short.
#[derive(Default)]
struct TickWake {
    raised: Mutex<bool>,
    ready: Condvar,
}

impl TickWake {
    fn notify(&self) {
        if let Ok(mut raised) = self.raised.lock() {
            *raised = true;
            self.ready.notify_one();
        }
    }

    fn wait(&self, timeout: Duration) {
        let Ok(raised) = self.raised.lock() else {
            thread::sleep(timeout);
            return;
        };
        if let Ok((mut raised, _)) = self
            .ready
            .wait_timeout_while(raised, timeout, |raised| !*raised)
        {
            *raised = false;
        }
    }
}

/// esp_timer backed periodic timers; callbacks raise the due flag and wake
/// the tick loop.
struct EspTimers {
    service: EspTaskTimerService,
    wake: Arc<TickWake>,
    armed: Vec<(TimerKind, EspTimer<'static>)>,
}

impl EspTimers {
    fn new(wake: Arc<TickWake>) -> anyhow::Result<Self> {
        Ok(Self {
            service: EspTaskTimerService::new().context("failed to start timer service")?,
            wake,
            armed: Vec::new(),
        })
    }
}

impl TimerDriver for EspTimers {
    fn arm(&mut self, kind: TimerKind, period: Duration, signal: DueSignal) {
        self.disarm(kind);
        let wake = Arc::clone(&self.wake);
        let timer = self
            .service
            .timer(move || {
                signal.raise();
                wake.notify();
            })
            .and_then(|timer| timer.every(period).map(|()| timer));
        match timer {
            Ok(timer) => self.armed.push((kind, timer)),
            Err(err) => warn!("failed to arm {kind:?} timer: {err}"),
        }
    }

    fn disarm(&mut self, kind: TimerKind) {
        self.armed.retain(|(armed, _)| *armed != kind);
    }
}

fn storage_error(err: EspError) -> StoreError {
    StoreError::Backend(err.to_string())
}

impl RecordStorage for NvsStorage {
    fn read(&mut self) -> Result<Option<Vec<u8>>, StoreError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| StoreError::Backend("nvs lock poisoned".to_string()))?;
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true).map_err(storage_error)?;

        let Some(len) = nvs.str_len(NVS_CONFIG_KEY).map_err(storage_error)? else {
            return Ok(None);
        };
        let mut buffer = vec![0_u8; len + 1];
        Ok(nvs
            .get_str(NVS_CONFIG_KEY, &mut buffer)
            .map_err(storage_error)?
            .map(|value| value.as_bytes().to_vec()))
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        let payload = core::str::from_utf8(bytes)
            .map_err(|_| StoreError::Backend("config record is not utf-8".to_string()))?;
        let _guard = self
            .lock
            .lock()
            .map_err(|_| StoreError::Backend("nvs lock poisoned".to_string()))?;
        let mut nvs =
            EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true).map_err(storage_error)?;
        nvs.set_str(NVS_CONFIG_KEY, payload).map_err(storage_error)
    }
}

/// 10-bit LEDC outputs, one channel per colour.
struct EspPwm {
    channels: Vec<(u8, LedcDriver<'static>)>,
}

fn init_pwm(ledc: LEDC, pins: Pins) -> anyhow::Result<EspPwm> {
    let timer = LedcTimerDriver::new(
        ledc.timer0,
        &TimerConfig::default()
            .frequency(PWM_FREQUENCY_KHZ.kHz().into())
            .resolution(Resolution::Bits10),
    )?;
    // Shared by every channel for the program lifetime.
    let timer: &'static _ = Box::leak(Box::new(timer));

    let [(red, _), (green, _), (blue, _), (white, _)] = CHANNEL_LAYOUT;
    Ok(EspPwm {
        channels: vec![
            (red, LedcDriver::new(ledc.channel0, timer, pins.gpio16)?),
            (green, LedcDriver::new(ledc.channel1, timer, pins.gpio12)?),
            (blue, LedcDriver::new(ledc.channel2, timer, pins.gpio13)?),
            (white, LedcDriver::new(ledc.channel3, timer, pins.gpio2)?),
        ],
    })
}

impl PwmOutput for EspPwm {
    fn write(&mut self, pin: u8, level: u16) {
        let Some((_, driver)) = self.channels.iter_mut().find(|(gpio, _)| *gpio == pin) else {
            return;
        };
        if let Err(err) = driver.set_duty(u32::from(level)) {
            warn!("failed to drive GPIO{pin}: {err}");
        }
    }
}

struct EspSystem;

impl SystemInfo for EspSystem {
    fn free_heap(&self) -> u32 {
        unsafe { esp_idf_svc::sys::esp_get_free_heap_size() }
    }
}

/// Confirms the running OTA slot once a broker session is up.
#[derive(Default)]
struct EspUpdates {
    confirmed: bool,
}

impl UpdateAgent for EspUpdates {
    fn service(&mut self) {
        if self.confirmed {
            return;
        }
        self.confirmed = true;
        match EspOta::new() {
            Ok(mut ota) => {
                if let Err(err) = ota.mark_running_slot_valid() {
                    warn!("failed to mark running OTA slot valid: {err:?}");
                }
            }
            Err(err) => warn!("OTA unavailable: {err}"),
        }
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc != esp_idf_svc::sys::ESP_OK {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn init_status_led(pin: i32) -> Option<StatusLed> {
    let driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) };
    match driver {
        Ok(mut pin) => {
            let _ = pin.set_low();
            Some(StatusLed { pin, lit: false })
        }
        Err(err) => {
            warn!("status LED unavailable on GPIO{pin}: {err}");
            None
        }
    }
}

/// Fast blink while provisioning, slow blink without a broker, solid when up.
fn update_status_led(
    status_led: &mut Option<StatusLed>,
    provisioning: bool,
    bus_connected: bool,
    now_ms: u64,
) {
    let desired_on = if provisioning {
        ((now_ms / LED_FAST_BLINK_MS) % 2) == 0
    } else if !bus_connected {
        ((now_ms / LED_SLOW_BLINK_MS) % 2) == 0
    } else {
        true
    };

    let Some(led) = status_led.as_mut() else {
        return;
    };

    if desired_on == led.lit {
        return;
    }

    let result = if desired_on {
        led.pin.set_high()
    } else {
        led.pin.set_low()
    };

    if let Err(err) = result {
        warn!("failed to drive status LED: {err}");
    } else {
        led.lit = desired_on;
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

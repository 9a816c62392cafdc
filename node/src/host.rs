use std::{
    collections::{HashMap, VecDeque},
    net::{SocketAddr, UdpSocket},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Form, Json, Router,
};
use rand::{rngs::StdRng, SeedableRng};
use rumqttc::{
    Client, Connection, ConnectReturnCode, Event, Incoming, LastWill, MqttOptions, QoS,
    RecvTimeoutError,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{debug, info, trace, warn};

use lightnode_common::{
    idle_until,
    local::{LOCAL_QUEUE_DEPTH, LOCAL_REPLY_TIMEOUT},
    local_channel, parse_form, Board, BusError, BusTransport, DeviceIdentity, FileStorage,
    FormRoute, InboundMessage, Link, LinkDetails, LinkError, LocalAuth, LocalError, LocalHandle,
    LocalInbox, LoginOutcome, Node, PolledTimers, PwmOutput, ReachabilityProbe, SessionOptions,
    SystemInfo, TickOutcome, UpdateAgent,
};

const MAX_TICK_IDLE: Duration = Duration::from_millis(10);
const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(30);
const MQTT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MQTT_REQUEST_CAPACITY: usize = 32;
const MQTT_PUMP_SLICE: Duration = Duration::from_millis(2);
const MQTT_PUMP_EVENTS: usize = 64;

/// Locally administered address used when `LIGHTNODE_MAC` is unset.
const DEFAULT_HOST_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x4c, 0x4e, 0x01];

#[derive(Debug, Clone)]
struct Settings {
    data_dir: PathBuf,
    http_port: u16,
    identity: DeviceIdentity,
    probe_addr: SocketAddr,
    admin_user: String,
    admin_pass: String,
}

impl Settings {
    fn from_env() -> anyhow::Result<Self> {
        let data_dir = std::env::var("LIGHTNODE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.lightnode"));

        let http_port = std::env::var("LIGHTNODE_HTTP_PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(8080);

        let identity = match std::env::var("LIGHTNODE_MAC") {
            Ok(value) => DeviceIdentity::parse_mac(&value)
                .ok_or_else(|| anyhow!("LIGHTNODE_MAC `{value}` is not a MAC address"))?,
            Err(_) => DeviceIdentity::from_mac(DEFAULT_HOST_MAC),
        };

        let probe_addr = std::env::var("LIGHTNODE_PROBE_ADDR")
            .unwrap_or_else(|_| "1.1.1.1:53".to_string());
        let probe_addr: SocketAddr = probe_addr
            .parse()
            .with_context(|| format!("LIGHTNODE_PROBE_ADDR `{probe_addr}` is not host:port"))?;

        Ok(Self {
            data_dir,
            http_port,
            identity,
            probe_addr,
            admin_user: std::env::var("LIGHTNODE_ADMIN_USER").unwrap_or_else(|_| "admin".into()),
            admin_pass: std::env::var("LIGHTNODE_ADMIN_PASS").unwrap_or_else(|_| "admin".into()),
        })
    }

    fn board(&self, local: Option<LocalInbox>) -> Board {
        Board {
            link: Box::new(HostLink::new(self.identity, self.probe_addr)),
            bus: Box::new(MqttBus::default()),
            timers: Box::new(PolledTimers::new()),
            storage: Box::new(FileStorage::in_dir(&self.data_dir)),
            pwm: Box::new(HostPwm::default()),
            system: Box::new(HostSystem),
            updates: Box::new(HostUpdates::default()),
            local,
            rng: StdRng::from_entropy(),
        }
    }
}

#[derive(Clone)]
struct AppState {
    local: LocalHandle,
    auth: Arc<LocalAuth>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct LoginForm {
    user: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    accepted: bool,
    restarting: bool,
    message: String,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = Settings::from_env()?;
    info!(
        "node {} using data dir {}",
        settings.identity,
        settings.data_dir.display()
    );

    let (local, inbox) = local_channel(LOCAL_QUEUE_DEPTH);
    let stop = Arc::new(AtomicBool::new(false));
    let tick = spawn_tick_loop(settings.clone(), inbox, stop.clone())?;

    let app_state = AppState {
        local,
        auth: Arc::new(LocalAuth::new(
            settings.admin_user.clone(),
            settings.admin_pass.clone(),
        )),
    };

    let app = Router::new()
        .route("/login", post(handle_login))
        .route("/logout", post(handle_logout))
        .route("/settings/{route}", post(handle_settings))
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind local control server at {addr}"))?;

    info!("local control surface listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    stop.store(true, Ordering::Relaxed);
    tokio::task::spawn_blocking(move || tick.join())
        .await?
        .map_err(|_| anyhow!("tick loop panicked"))?;
    info!("node stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

/// Runs the node on a plain thread; a restart rebuilds it from storage.
fn spawn_tick_loop(
    settings: Settings,
    inbox: LocalInbox,
    stop: Arc<AtomicBool>,
) -> anyhow::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("tick".into())
        .spawn(move || {
            let mut inbox = Some(inbox);
            while !stop.load(Ordering::Relaxed) {
                let mut node = Node::boot(settings.board(inbox.take()), settings.identity);
                let reason = loop {
                    if stop.load(Ordering::Relaxed) {
                        break None;
                    }
                    if let TickOutcome::Restart(reason) = node.tick(monotonic_ms()) {
                        break Some(reason);
                    }
                    // Polled timers need a tick at every deadline.
                    let idle = idle_until(node.next_due_ms(), monotonic_ms(), MAX_TICK_IDLE);
                    if idle.is_zero() {
                        thread::yield_now();
                    } else {
                        thread::sleep(idle);
                    }
                };
                inbox = node.shutdown();
                match reason {
                    Some(reason) => info!("rebooting node in-process ({reason:?})"),
                    None => break,
                }
            }
        })
        .context("failed to spawn tick thread")
}

async fn handle_login(
    State(state): State<AppState>,
    Form(form): Form<LoginForm>,
) -> axum::response::Response {
    let token = state.auth.login(&form.user, &form.password);
    let outcome = if token.is_some() {
        LoginOutcome::Success
    } else {
        LoginOutcome::Failure
    };
    record_login(&state.local, outcome, &form.user);

    match token {
        Some(token) => {
            info!("local login as {}", form.user);
            (
                [(header::SET_COOKIE, LocalAuth::set_cookie(&token))],
                Json(SubmitResponse {
                    accepted: true,
                    restarting: false,
                    message: "logged in".to_string(),
                }),
            )
                .into_response()
        }
        None => {
            warn!("rejected local login as {}", form.user);
            error_response(StatusCode::UNAUTHORIZED, "invalid credentials")
        }
    }
}

async fn handle_logout(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    state.auth.logout(cookie_header(&headers));
    record_login(&state.local, LoginOutcome::Logout, "");
    StatusCode::NO_CONTENT
}

fn record_login(local: &LocalHandle, outcome: LoginOutcome, user: &str) {
    if let Err(err) = local.notify(outcome.record(user)) {
        warn!("login event for `{user}` not queued: {err}");
    }
}

async fn handle_settings(
    State(state): State<AppState>,
    Path(route): Path<String>,
    headers: HeaderMap,
    Form(fields): Form<HashMap<String, String>>,
) -> axum::response::Response {
    if !state.auth.is_authorized(cookie_header(&headers)) {
        return error_response(StatusCode::UNAUTHORIZED, "login required");
    }

    let command = match route
        .parse::<FormRoute>()
        .and_then(|route| parse_form(route, &fields))
    {
        Ok(command) => command,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };
    debug!("local form `{route}` -> {command:?}");

    let local = state.local.clone();
    let submitted =
        tokio::task::spawn_blocking(move || local.submit(command, LOCAL_REPLY_TIMEOUT)).await;

    match submitted {
        Ok(Ok(reply)) if reply.accepted => Json(SubmitResponse {
            accepted: true,
            restarting: reply.restarting,
            message: reply.message,
        })
        .into_response(),
        Ok(Ok(reply)) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &reply.message),
        Ok(Err(err @ LocalError::Timeout(_))) => {
            error_response(StatusCode::GATEWAY_TIMEOUT, &err.to_string())
        }
        Ok(Err(err)) => error_response(StatusCode::SERVICE_UNAVAILABLE, &err.to_string()),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

fn cookie_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::COOKIE)
        .and_then(|value| value.to_str().ok())
}

/// Workstation networking: the link is always up and joins are no-ops.
struct HostLink {
    identity: DeviceIdentity,
    probe: ReachabilityProbe,
    probe_addr: SocketAddr,
    hostname: Option<String>,
}

impl HostLink {
    fn new(identity: DeviceIdentity, probe_addr: SocketAddr) -> Self {
        Self {
            identity,
            probe: ReachabilityProbe::new(probe_addr),
            probe_addr,
            hostname: None,
        }
    }

    fn local_ip(&self) -> Option<String> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).ok()?;
        socket.connect(self.probe_addr).ok()?;
        Some(socket.local_addr().ok()?.ip().to_string())
    }
}

impl Link for HostLink {
    fn is_connected(&mut self) -> bool {
        true
    }

    fn begin_join(&mut self, ssid: &str, _password: &str, hostname: &str) -> Result<(), LinkError> {
        info!("host network in use; ignoring join of `{ssid}` as {hostname}");
        self.hostname = Some(hostname.to_string());
        Ok(())
    }

    fn backoff(&mut self, delay: Duration) {
        thread::sleep(delay);
    }

    fn probe_internet(&mut self) -> bool {
        self.probe.check()
    }

    fn start_time_sync(&mut self) {
        info!("using host clock for wall time");
    }

    fn start_access_point(&mut self, ssid: &str, _password: &str) -> Result<(), LinkError> {
        warn!("provisioning mode as `{ssid}`; post credentials to /settings/network");
        Ok(())
    }

    fn details(&self) -> LinkDetails {
        LinkDetails {
            ssid: self.hostname.clone().unwrap_or_else(|| "host".to_string()),
            mac: self.identity.mac_string(),
            ip: self.local_ip().unwrap_or_else(|| "0.0.0.0".to_string()),
        }
    }
}

struct MqttSession {
    client: Client,
    connection: Connection,
}

/// Broker transport over the blocking `rumqttc` client.
///
/// The connection is only driven from `poll`, which also flushes queued
/// subscribes and publishes.
#[derive(Default)]
struct MqttBus {
    session: Option<MqttSession>,
    inbound: VecDeque<InboundMessage>,
}

impl MqttBus {
    fn pump(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        let mut lost = false;
        for _ in 0..MQTT_PUMP_EVENTS {
            match session.connection.recv_timeout(MQTT_PUMP_SLICE) {
                Ok(Ok(Event::Incoming(Incoming::Publish(message)))) => {
                    self.inbound.push_back(InboundMessage {
                        topic: message.topic,
                        payload: message.payload.to_vec(),
                    });
                }
                Ok(Ok(Event::Incoming(Incoming::Disconnect))) => {
                    lost = true;
                    break;
                }
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    warn!("mqtt connection lost: {err}");
                    lost = true;
                    break;
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    lost = true;
                    break;
                }
            }
        }

        if lost {
            self.session = None;
        }
    }
}

impl BusTransport for MqttBus {
    fn connect(&mut self, options: &SessionOptions) -> Result<(), BusError> {
        self.disconnect();

        let mut mqtt_options =
            MqttOptions::new(options.client_id.as_str(), options.host.as_str(), options.port);
        mqtt_options.set_keep_alive(MQTT_KEEP_ALIVE);
        mqtt_options.set_last_will(LastWill::new(
            options.will_topic.as_str(),
            options.will_payload.as_bytes().to_vec(),
            QoS::AtMostOnce,
            true,
        ));

        let (client, mut connection) = Client::new(mqtt_options, MQTT_REQUEST_CAPACITY);
        let deadline = Instant::now() + MQTT_CONNECT_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(BusError::Unreachable(format!(
                    "{}:{} did not answer",
                    options.host, options.port
                )));
            }
            match connection.recv_timeout(remaining) {
                Ok(Ok(Event::Incoming(Incoming::ConnAck(ack)))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(BusError::Unreachable(format!(
                            "{}:{} refused: {:?}",
                            options.host, options.port, ack.code
                        )));
                    }
                    break;
                }
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    return Err(BusError::Unreachable(format!(
                        "{}:{}: {err}",
                        options.host, options.port
                    )));
                }
                Err(_) => {
                    return Err(BusError::Unreachable(format!(
                        "{}:{} did not answer",
                        options.host, options.port
                    )));
                }
            }
        }

        self.session = Some(MqttSession { client, connection });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), BusError> {
        let session = self.session.as_mut().ok_or(BusError::NotConnected)?;
        session
            .client
            .try_subscribe(topic, QoS::AtMostOnce)
            .map_err(|err| BusError::Transport(err.to_string()))
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retained: bool) -> Result<(), BusError> {
        let session = self.session.as_mut().ok_or(BusError::NotConnected)?;
        session
            .client
            .try_publish(topic, QoS::AtMostOnce, retained, payload.to_vec())
            .map_err(|err| BusError::Transport(err.to_string()))
    }

    fn poll(&mut self) -> Option<InboundMessage> {
        if self.inbound.is_empty() {
            self.pump();
        }
        self.inbound.pop_front()
    }

    fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(err) = session.client.try_disconnect() {
                debug!("mqtt disconnect not queued: {err}");
            }
            // Flush the disconnect packet.
            let _ = session.connection.recv_timeout(MQTT_PUMP_SLICE);
        }
        self.inbound.clear();
    }
}

#[derive(Default)]
struct HostPwm {
    levels: HashMap<u8, u16>,
}

impl PwmOutput for HostPwm {
    fn write(&mut self, pin: u8, level: u16) {
        if self.levels.insert(pin, level) == Some(level) {
            return;
        }
        trace!("pwm GPIO{pin} -> {level}");
    }
}

struct HostSystem;

impl SystemInfo for HostSystem {
    fn free_heap(&self) -> u32 {
        let meminfo = std::fs::read_to_string("/proc/meminfo").unwrap_or_default();
        meminfo
            .lines()
            .find_map(|line| line.strip_prefix("MemAvailable:"))
            .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse::<u64>().ok())
            .map_or(0, |kib| u32::try_from(kib * 1024).unwrap_or(u32::MAX))
    }
}

#[derive(Default)]
struct HostUpdates {
    announced: bool,
}

impl UpdateAgent for HostUpdates {
    fn service(&mut self) {
        if !self.announced {
            self.announced = true;
            info!("firmware updates are not serviced on the host backend");
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
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

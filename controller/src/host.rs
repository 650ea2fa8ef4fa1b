use std::{
    collections::HashMap,
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, Incoming, LastWill, MqttOptions, QoS,
};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    sync::{mpsc, Mutex},
};
use tracing::{debug, info, warn};

use desk_common::{
    config::{ClimateConfig, NetworkConfig},
    topics::{height_payload, MAX_COMMAND_PAYLOAD_BYTES},
    ControlConfig, DeskCommand, DeskControlLoop, DeskTopics, DistanceSampler, HardwareConfig,
    HeightController, HomieEvent, LifecycleEventSink, MotionConfig, MotionDriver,
    MqttDisconnectReason, RuntimeConfig, SamplerConfig, SessionReport,
};

use crate::sim::{PlantParams, SimulatedDesk, SimulatedEcho, SimulatedOutput};

type HostDesk = DeskControlLoop<SimulatedEcho, SimulatedOutput, SimulatedOutput, ReportChannel>;

#[derive(Clone)]
struct AppState {
    desk: Arc<Mutex<HostDesk>>,
    plant: SimulatedDesk,
    runtime: Arc<RuntimeConfig>,
    topics: Arc<DeskTopics>,
    mqtt: AsyncClient,
}

#[derive(Clone)]
struct DeskStore {
    runtime_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

/// Forwards finished sessions from the control loop to the MQTT publisher.
struct ReportChannel(mpsc::UnboundedSender<SessionReport>);

impl LifecycleEventSink for ReportChannel {
    fn session_finished(&mut self, report: &SessionReport) {
        if self.0.send(report.clone()).is_err() {
            warn!("session report dropped; publisher task is gone");
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct NetworkConfigView {
    #[serde(rename = "mqttHost")]
    mqtt_host: String,
    #[serde(rename = "mqttPort")]
    mqtt_port: u16,
    #[serde(rename = "mqttUser")]
    mqtt_user: String,
    #[serde(rename = "mqttPassSet")]
    mqtt_pass_set: bool,
}

#[derive(Debug, Serialize)]
struct ConfigView {
    #[serde(rename = "deviceId")]
    device_id: String,
    hardware: HardwareConfig,
    sampler: SamplerConfig,
    motion: MotionConfig,
    control: ControlConfig,
    climate: ClimateConfig,
    network: NetworkConfigView,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = DeskStore::new();
    let mut runtime = match store.load_runtime_config().await {
        Ok(Some(runtime)) => runtime,
        Ok(None) => {
            let runtime = RuntimeConfig::default();
            if let Err(err) = store.save_runtime_config(&runtime).await {
                warn!("failed to write default runtime config: {err:#}");
            }
            runtime
        }
        Err(err) => {
            warn!("failed to load runtime config from store: {err:#}");
            RuntimeConfig::default()
        }
    };
    runtime.sanitize();
    apply_env_overrides(&mut runtime.network);
    runtime
        .validate()
        .context("runtime config is inconsistent")?;

    let topics = DeskTopics::new(&runtime.device_id);
    let plant = SimulatedDesk::new(
        PlantParams {
            mount_offset_cm: runtime.sampler.mount_offset_cm,
            ..PlantParams::default()
        },
        Arc::new(monotonic_ms),
    );

    let (report_tx, report_rx) = mpsc::unbounded_channel();
    let (up, down) = plant.motor_outputs();
    let driver = MotionDriver::new(up, down, runtime.motion.clone())
        .context("failed to initialize motor outputs")?;
    let desk = DeskControlLoop::new(
        DistanceSampler::new(plant.echo(), runtime.sampler.clone()),
        driver,
        HeightController::new(runtime.control.clone()),
        ReportChannel(report_tx),
    );

    let mut mqtt_options = MqttOptions::new(
        format!("{}-host", runtime.device_id),
        runtime.network.mqtt_host.clone(),
        runtime.network.mqtt_port,
    );
    mqtt_options.set_keep_alive(Duration::from_secs(15));
    mqtt_options.set_last_will(LastWill::new(
        topics.device_state.clone(),
        "lost",
        QoS::AtLeastOnce,
        true,
    ));
    if !runtime.network.mqtt_user.is_empty() {
        mqtt_options.set_credentials(
            runtime.network.mqtt_user.clone(),
            runtime.network.mqtt_pass.clone(),
        );
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let app_state = AppState {
        desk: Arc::new(Mutex::new(desk)),
        plant,
        runtime: Arc::new(runtime),
        topics: Arc::new(topics),
        mqtt,
    };

    publish_homie_event(&app_state, HomieEvent::NormalMode);
    spawn_mqtt_loop(app_state.clone(), eventloop);
    spawn_control_loop(app_state.clone());
    spawn_report_publisher(app_state.clone(), report_rx);
    spawn_state_publish_loop(app_state.clone());
    if app_state.runtime.climate.enabled {
        spawn_climate_loop(app_state.clone());
    }

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/height", post(handle_set_height))
        .route("/api/abort", post(handle_abort))
        .route("/api/config", get(handle_get_config))
        .with_state(app_state);

    let port = std::env::var("DESK_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind desk server at {addr}"))?;

    info!("desk controller listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn apply_env_overrides(network: &mut NetworkConfig) {
    if let Ok(host) = std::env::var("MQTT_HOST") {
        network.mqtt_host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        network.mqtt_port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        network.mqtt_user = user;
    }
    if let Ok(pass) = std::env::var("MQTT_PASS") {
        network.mqtt_pass = pass;
    }
}

/// Broker link state, so an outage is announced once rather than per retry.
#[derive(Debug, Default)]
struct MqttLink {
    connected: bool,
}

impl MqttLink {
    fn on_connack(&mut self, code: ConnectReturnCode) -> HomieEvent {
        let event = connack_event(code);
        self.connected = event == HomieEvent::MqttConnected;
        event
    }

    fn on_poll_error(&mut self) -> Option<HomieEvent> {
        std::mem::take(&mut self.connected).then_some(HomieEvent::MqttDisconnected {
            reason: MqttDisconnectReason::TcpDisconnected,
        })
    }
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        let mut link = MqttLink::default();
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    handle_mqtt_message(&app_state, &message.topic, &message.payload).await;
                }
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    let event = link.on_connack(ack.code);
                    publish_homie_event(&app_state, event);
                    if event == HomieEvent::MqttConnected {
                        subscribe_topics(&app_state);
                    }
                }
                Ok(Event::Incoming(Incoming::PubAck(ack))) => {
                    let event = HomieEvent::MqttPacketAcknowledged { packet_id: ack.pkid };
                    debug!("homie event: {event}");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    if let Some(event) = link.on_poll_error() {
                        publish_homie_event(&app_state, event);
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

fn connack_event(code: ConnectReturnCode) -> HomieEvent {
    let reason = match code {
        ConnectReturnCode::Success => return HomieEvent::MqttConnected,
        ConnectReturnCode::RefusedProtocolVersion => {
            MqttDisconnectReason::UnacceptableProtocolVersion
        }
        ConnectReturnCode::BadClientId => MqttDisconnectReason::IdentifierRejected,
        ConnectReturnCode::ServiceUnavailable => MqttDisconnectReason::ServerUnavailable,
        ConnectReturnCode::BadUserNamePassword => MqttDisconnectReason::MalformedCredentials,
        ConnectReturnCode::NotAuthorized => MqttDisconnectReason::NotAuthorized,
    };
    HomieEvent::MqttDisconnected { reason }
}

/// Runs inside the event loop task, so requests are queued without awaiting.
fn subscribe_topics(app_state: &AppState) {
    for topic in app_state.topics.subscriptions() {
        if let Err(err) = app_state.mqtt.try_subscribe(topic, QoS::AtLeastOnce) {
            warn!("mqtt subscribe to {topic} failed: {err}");
        }
    }
}

fn publish_homie_event(app_state: &AppState, event: HomieEvent) {
    info!("homie event: {event}");
    let Some(device_state) = event.device_state() else {
        return;
    };
    if let Err(err) = app_state.mqtt.try_publish(
        app_state.topics.device_state.as_str(),
        QoS::AtLeastOnce,
        true,
        device_state,
    ) {
        warn!("homie $state publish failed: {err}");
    }
}

fn spawn_control_loop(app_state: AppState) {
    tokio::spawn(async move {
        let tick_ms = app_state.runtime.control.tick_interval_ms;
        let mut interval = tokio::time::interval(Duration::from_millis(tick_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            let now_ms = monotonic_ms();
            app_state.desk.lock().await.tick(now_ms);
        }
    });
}

fn spawn_report_publisher(
    app_state: AppState,
    mut reports: mpsc::UnboundedReceiver<SessionReport>,
) {
    tokio::spawn(async move {
        while let Some(report) = reports.recv().await {
            info!(
                "session finished: {} toward {:.1}cm in {}ms",
                report.outcome.as_str(),
                report.target_cm,
                report.duration_ms()
            );
            let topic = app_state.topics.outcome.clone();
            publish_json(&app_state.mqtt, &topic, false, &report.payload()).await;
            publish_desk_state(&app_state).await;
        }
    });
}

fn spawn_state_publish_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(2));
        let mut last_height: Option<String> = None;
        let mut interlock_faults = 0;

        loop {
            interval.tick().await;
            publish_desk_state(&app_state).await;

            let faults = app_state.plant.interlock_faults();
            if faults > interlock_faults {
                warn!("simulated desk saw {faults} interlock faults");
                interlock_faults = faults;
            }
            debug!("simulated frame at {:.1}cm", app_state.plant.height_cm());

            let height = {
                let desk = app_state.desk.lock().await;
                desk.controller().last_height_cm()
            };
            let Some(height) = height.map(height_payload) else {
                continue;
            };
            if last_height.as_ref() == Some(&height) {
                continue;
            }
            match app_state
                .mqtt
                .publish(
                    app_state.topics.height.as_str(),
                    QoS::AtLeastOnce,
                    true,
                    height.clone(),
                )
                .await
            {
                Ok(()) => last_height = Some(height),
                Err(err) => warn!("height publish failed: {err}"),
            }
        }
    });
}

fn spawn_climate_loop(app_state: AppState) {
    tokio::spawn(async move {
        let model = app_state.runtime.hardware.dht_model;
        let period_ms = app_state
            .runtime
            .climate
            .publish_interval_ms
            .max(model.min_read_interval_ms());
        let mut interval = tokio::time::interval(Duration::from_millis(period_ms));

        loop {
            interval.tick().await;
            let Some(reading) = app_state.plant.climate(model) else {
                warn!("{} reading outside sensor range; skipped", model.as_str());
                continue;
            };

            let publishes = [
                (&app_state.topics.temperature, reading.temperature_payload()),
                (&app_state.topics.humidity, reading.humidity_payload()),
            ];
            for (topic, payload) in publishes {
                if let Err(err) = app_state
                    .mqtt
                    .publish(topic.as_str(), QoS::AtMostOnce, true, payload)
                    .await
                {
                    warn!("climate publish to {topic} failed: {err}");
                }
            }
        }
    });
}

async fn publish_desk_state(app_state: &AppState) {
    let payload = {
        let desk = app_state.desk.lock().await;
        desk.state_payload(monotonic_ms())
    };
    publish_json(&app_state.mqtt, &app_state.topics.state, true, &payload).await;
}

async fn publish_json<T: Serialize>(mqtt: &AsyncClient, topic: &str, retain: bool, value: &T) {
    match serde_json::to_vec(value) {
        Ok(body) => {
            if let Err(err) = mqtt.publish(topic, QoS::AtLeastOnce, retain, body).await {
                warn!("publish to {topic} failed: {err}");
            }
        }
        Err(err) => warn!("serialization for {topic} failed: {err}"),
    }
}

async fn handle_mqtt_message(app_state: &AppState, topic: &str, payload: &[u8]) {
    if payload.len() > MAX_COMMAND_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return;
    }

    let command = match app_state.topics.parse_command(topic, payload) {
        Some(Ok(command)) => command,
        Some(Err(err)) => {
            warn!("rejected command on {topic}: {err}");
            return;
        }
        None => return,
    };

    let now_ms = monotonic_ms();
    let mut desk = app_state.desk.lock().await;
    match command {
        DeskCommand::SetHeight(target_cm) => {
            if let Err(err) = desk.request_height(target_cm, now_ms) {
                warn!("rejected height request: {err}");
            }
        }
        DeskCommand::Abort => {
            if !desk.abort(now_ms) {
                debug!("abort ignored; desk is idle");
            }
        }
    }
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let payload = state.desk.lock().await.state_payload(monotonic_ms());
    Json(payload)
}

async fn handle_set_height(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Ok(target_cm) = value.trim().parse::<f32>() else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid height value");
    };

    let result = state
        .desk
        .lock()
        .await
        .request_height(target_cm, monotonic_ms());
    if let Err(err) = result {
        return error_response(StatusCode::BAD_REQUEST, &err.to_string());
    }

    handle_get_status(State(state)).await.into_response()
}

async fn handle_abort(State(state): State<AppState>) -> impl IntoResponse {
    state.desk.lock().await.abort(monotonic_ms());
    handle_get_status(State(state)).await
}

async fn handle_get_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(build_config_view(&state.runtime))
}

impl DeskStore {
    fn new() -> Self {
        let data_dir = std::env::var("DESK_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.desk"));

        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<Option<RuntimeConfig>> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(Some(serde_json::from_slice::<RuntimeConfig>(&raw)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.runtime_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}

fn build_config_view(runtime: &RuntimeConfig) -> ConfigView {
    ConfigView {
        device_id: runtime.device_id.clone(),
        hardware: runtime.hardware.clone(),
        sampler: runtime.sampler.clone(),
        motion: runtime.motion.clone(),
        control: runtime.control.clone(),
        climate: runtime.climate.clone(),
        network: NetworkConfigView {
            mqtt_host: runtime.network.mqtt_host.clone(),
            mqtt_port: runtime.network.mqtt_port,
            mqtt_user: runtime.network.mqtt_user.clone(),
            mqtt_pass_set: !runtime.network.mqtt_pass.is_empty(),
        },
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

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn rejected_connack_maps_to_disconnect_reason() {
        assert_eq!(
            connack_event(ConnectReturnCode::Success),
            HomieEvent::MqttConnected
        );
        assert_eq!(
            connack_event(ConnectReturnCode::BadUserNamePassword),
            HomieEvent::MqttDisconnected {
                reason: MqttDisconnectReason::MalformedCredentials
            }
        );
    }

    #[test]
    fn lost_link_publishes_disconnected_once_per_outage() {
        let mut link = MqttLink::default();
        assert_eq!(link.on_poll_error(), None);

        link.on_connack(ConnectReturnCode::Success);
        let event = link.on_poll_error();

        assert_eq!(
            event,
            Some(HomieEvent::MqttDisconnected {
                reason: MqttDisconnectReason::TcpDisconnected
            })
        );
        assert_eq!(
            event.and_then(|e| e.device_state()),
            Some("disconnected")
        );
        assert_eq!(link.on_poll_error(), None);
    }

    #[test]
    fn config_view_hides_mqtt_password() {
        let mut runtime = RuntimeConfig::default();
        runtime.network.mqtt_pass = "hunter2".to_string();

        let value = serde_json::to_value(build_config_view(&runtime)).unwrap();

        assert_eq!(value["network"]["mqttPassSet"], true);
        assert!(value["network"].get("mqttPass").is_none());
        assert_eq!(value["control"]["max_reverse_toggles"], 3);
    }

    #[test]
    fn report_channel_forwards_each_report() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sink = ReportChannel(tx);
        let report = SessionReport {
            target_cm: 90.0,
            outcome: desk_common::SessionOutcome::Settled,
            final_height_cm: Some(90.2),
            reverse_toggles: 0,
            started_at_ms: 0,
            finished_at_ms: 4_000,
        };

        sink.session_finished(&report);

        assert_eq!(rx.try_recv().unwrap(), report);
        assert!(rx.try_recv().is_err());
    }
}

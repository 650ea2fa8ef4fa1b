use core::convert::TryInto;
use std::{
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        mpsc, Arc, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use dht_sensor::{dht11, dht22};
use embedded_svc::{
    http::Method,
    io::Write,
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, AnyInputPin, AnyOutputPin, Input, InputOutput, Output, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, LwtConfiguration, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};
use serde::Serialize;

use desk_common::{
    config::NetworkConfig,
    topics::{height_payload, MAX_COMMAND_PAYLOAD_BYTES},
    ClimateReading, DeskCommand, DeskControlLoop, DeskTopics, DhtModel, DistanceSampler,
    HeightController, HomieEvent, LifecycleEventSink, MotionDriver, MqttDisconnectReason, Now,
    PulseEchoTimer, ReportBacklog, RuntimeConfig, SessionReport, WifiDisconnectReason,
};

const NVS_NAMESPACE: &str = "desk";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const WIFI_RESTART_GRACE_MS: u64 = 300_000;
const STATE_PUBLISH_INTERVAL_MS: u64 = 2_000;
const OUTCOME_BACKLOG: usize = 8;

type OutputLine = PinDriver<'static, AnyOutputPin, Output>;
type EchoLine = PinDriver<'static, AnyInputPin, Input>;
type EspEchoTimer = PulseEchoTimer<OutputLine, EchoLine, Ets, EspTimerClock>;
type EspDesk = DeskControlLoop<EspEchoTimer, OutputLine, OutputLine, ReportQueue>;
type SharedMqtt = Arc<Mutex<EspMqttClient<'static>>>;

/// `esp_timer` microseconds since boot.
struct EspTimerClock;

impl Now for EspTimerClock {
    fn now_micros(&self) -> u64 {
        let micros = unsafe { esp_idf_svc::sys::esp_timer_get_time() };
        micros.max(0) as u64
    }
}

struct ReportQueue(mpsc::Sender<SessionReport>);

impl LifecycleEventSink for ReportQueue {
    fn session_finished(&mut self, report: &SessionReport) {
        if self.0.send(report.clone()).is_err() {
            warn!("session report dropped; control thread receiver is gone");
        }
    }
}

struct ClimateSensor {
    model: DhtModel,
    pin: PinDriver<'static, AnyIOPin, InputOutput>,
    delay: Ets,
}

impl ClimateSensor {
    fn new(model: DhtModel, pin: AnyIOPin) -> anyhow::Result<Self> {
        let mut pin = PinDriver::input_output_od(pin)?;
        pin.set_pull(Pull::Up)?;
        pin.set_high()?;
        Ok(Self {
            model,
            pin,
            delay: Ets,
        })
    }

    fn read(&mut self) -> Option<ClimateReading> {
        if let Err(err) = self.pin.set_high() {
            warn!("failed to release {} line before read: {err:?}", self.model.as_str());
            return None;
        }

        let raw = match self.model {
            DhtModel::Dht11 => dht11::blocking::read(&mut self.delay, &mut self.pin)
                .map(|r| (f32::from(r.temperature), f32::from(r.relative_humidity))),
            DhtModel::Dht21 | DhtModel::Dht22 => {
                dht22::blocking::read(&mut self.delay, &mut self.pin)
                    .map(|r| (r.temperature, r.relative_humidity))
            }
        };

        match raw {
            Ok((temperature_c, humidity)) => {
                let reading = ClimateReading::checked(self.model, temperature_c, humidity);
                if reading.is_none() {
                    warn!(
                        "[{}] discarded out-of-range reading {temperature_c:.1}°C / {humidity:.1}%",
                        self.model.as_str()
                    );
                }
                reading
            }
            Err(err) => {
                warn!("failed to read {}: {err:?}", self.model.as_str());
                None
            }
        }
    }
}

#[derive(Clone)]
struct SharedState {
    desk: Arc<Mutex<EspDesk>>,
    runtime: Arc<RuntimeConfig>,
    topics: Arc<DeskTopics>,
    mqtt_connected: Arc<AtomicBool>,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct ConfigView<'a> {
    #[serde(rename = "deviceId")]
    device_id: &'a str,
    hardware: &'a desk_common::HardwareConfig,
    sampler: &'a desk_common::SamplerConfig,
    motion: &'a desk_common::MotionConfig,
    control: &'a desk_common::ControlConfig,
    #[serde(rename = "mqttHost")]
    mqtt_host: &'a str,
    #[serde(rename = "mqttPort")]
    mqtt_port: u16,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    if let Err(err) = watch_wifi_disconnects() {
        warn!("wifi disconnect reasons unavailable: {err:#}");
    }
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();
    ensure_wifi_defaults(&mut runtime);
    if let Err(err) = runtime.validate() {
        warn!("stored runtime config rejected ({err}); falling back to defaults");
        let network = runtime.network.clone();
        runtime = RuntimeConfig {
            network,
            ..RuntimeConfig::default()
        };
    }

    let hw = &runtime.hardware;
    info!(
        "desk `{}`: trigger GPIO{} echo GPIO{} up GPIO{} down GPIO{} dht {} on GPIO{}",
        runtime.device_id,
        hw.trigger_pin,
        hw.echo_pin,
        hw.up_pin,
        hw.down_pin,
        hw.dht_model.as_str(),
        hw.dht_pin,
    );

    let Peripherals { modem, .. } = Peripherals::take()?;
    let (report_tx, report_rx) = mpsc::channel();
    let desk = init_desk(&runtime, ReportQueue(report_tx))?;
    let climate = if runtime.climate.enabled {
        let dht_pin = unsafe { AnyIOPin::new(runtime.hardware.dht_pin) };
        ClimateSensor::new(runtime.hardware.dht_model, dht_pin)
            .map_err(|err| warn!("climate sensor unavailable: {err:#}"))
            .ok()
    } else {
        None
    };

    let shared_state = SharedState {
        desk: Arc::new(Mutex::new(desk)),
        topics: Arc::new(DeskTopics::new(&runtime.device_id)),
        runtime: Arc::new(runtime.clone()),
        mqtt_connected: Arc::new(AtomicBool::new(false)),
    };

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    let (wifi, wifi_event) = connect_wifi(modem, sys_loop, nvs_partition, &runtime.network)
        .context("wifi startup failed")?;
    info!("homie event: {wifi_event}");

    let (mqtt_client, mqtt_conn) = create_mqtt_client(&runtime, &shared_state.topics)?;
    let mqtt_client = Arc::new(Mutex::new(mqtt_client));

    spawn_mqtt_receiver(shared_state.clone(), mqtt_conn, mqtt_client.clone());
    spawn_control_loop(shared_state.clone(), mqtt_client, report_rx, climate);

    let server = create_http_server(shared_state)?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn init_desk(runtime: &RuntimeConfig, sink: ReportQueue) -> anyhow::Result<EspDesk> {
    let hw = &runtime.hardware;

    let mut trigger = PinDriver::output(unsafe { AnyOutputPin::new(hw.trigger_pin) })?;
    trigger.set_low()?;
    let echo = PinDriver::input(unsafe { AnyInputPin::new(hw.echo_pin) })?;
    let timer = PulseEchoTimer::new(trigger, echo, Ets, EspTimerClock);

    let up = PinDriver::output(unsafe { AnyOutputPin::new(hw.up_pin) })?;
    let down = PinDriver::output(unsafe { AnyOutputPin::new(hw.down_pin) })?;
    let driver = MotionDriver::new(up, down, runtime.motion.clone())
        .map_err(|err| anyhow!("failed to release motor outputs: {err}"))?;

    Ok(DeskControlLoop::new(
        DistanceSampler::new(timer, runtime.sampler.clone()),
        driver,
        HeightController::new(runtime.control.clone()),
        sink,
    ))
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            runtime.network.wifi_ssid = ssid.to_string();
        }
    }

    if runtime.network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            runtime.network.wifi_pass = pass.to_string();
        }
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<(EspWifi<'static>, HomieEvent)> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    if network.wifi_ssid.trim().is_empty() {
        return Err(anyhow!("wifi ssid is not configured"));
    }

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        feed_watchdog();
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} failed: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    if let Some(err) = last_err {
        return Err(anyhow!(
            "all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed: {err:#}"
        ));
    }

    let ip_info = wifi.wifi().sta_netif().get_ip_info()?;
    let event = HomieEvent::WifiConnected {
        ip: ip_info.ip,
        mask: mask_from_prefix(ip_info.subnet.mask.0),
        gateway: ip_info.subnet.gateway,
    };
    Ok((esp_wifi, event))
}

fn mask_from_prefix(prefix: u8) -> Ipv4Addr {
    let bits = u32::MAX
        .checked_shl(32 - u32::from(prefix.min(32)))
        .unwrap_or(0);
    Ipv4Addr::from(bits)
}

fn create_mqtt_client(
    runtime: &RuntimeConfig,
    topics: &DeskTopics,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let network = &runtime.network;
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some(runtime.device_id.as_str()),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if network.mqtt_pass.is_empty() {
            None
        } else {
            Some(network.mqtt_pass.as_str())
        },
        lwt: Some(LwtConfiguration {
            topic: topics.device_state.as_str(),
            payload: b"lost",
            qos: QoS::AtLeastOnce,
            retain: true,
        }),
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn subscribe_topics(mqtt: &SharedMqtt, topics: &DeskTopics) -> anyhow::Result<()> {
    let mut mqtt = mqtt.lock().unwrap();
    for topic in topics.subscriptions() {
        mqtt.subscribe(topic, QoS::AtLeastOnce)?;
    }
    Ok(())
}

fn spawn_mqtt_receiver(state: SharedState, mut conn: EspMqttConnection, mqtt: SharedMqtt) {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(12 * 1024)
        .spawn(move || loop {
            let event = match conn.next() {
                Ok(event) => event,
                Err(err) => {
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                    continue;
                }
            };

            match event.payload() {
                EventPayload::Connected(_) => {
                    state.mqtt_connected.store(true, Ordering::Relaxed);
                    publish_homie_event(&state, &mqtt, HomieEvent::MqttConnected);
                    if let Err(err) = subscribe_topics(&mqtt, &state.topics) {
                        warn!("mqtt subscribe failed: {err:#}");
                    }
                }
                EventPayload::Disconnected => {
                    state.mqtt_connected.store(false, Ordering::Relaxed);
                    info!(
                        "homie event: {}",
                        HomieEvent::MqttDisconnected {
                            reason: MqttDisconnectReason::TcpDisconnected
                        }
                    );
                }
                EventPayload::Published(id) => {
                    let event = HomieEvent::MqttPacketAcknowledged {
                        packet_id: id as u16,
                    };
                    debug!("homie event: {event}");
                }
                EventPayload::Received {
                    topic: Some(topic),
                    data,
                    details,
                    ..
                } => {
                    // We only process full MQTT payloads.
                    if !matches!(details, Details::Complete) {
                        continue;
                    }
                    if data.len() > MAX_COMMAND_PAYLOAD_BYTES {
                        warn!(
                            "dropping oversized MQTT payload on topic {} ({} bytes)",
                            topic,
                            data.len()
                        );
                        continue;
                    }
                    handle_mqtt_message(&state, topic, data);
                }
                EventPayload::Error(err) => warn!("mqtt error event: {err:?}"),
                _ => {}
            }
        })
        .expect("failed to spawn mqtt receiver thread");
}

fn handle_mqtt_message(state: &SharedState, topic: &str, payload: &[u8]) {
    let command = match state.topics.parse_command(topic, payload) {
        Some(Ok(command)) => command,
        Some(Err(err)) => {
            warn!("rejected command on {topic}: {err}");
            return;
        }
        None => return,
    };

    let now_ms = monotonic_ms();
    let mut desk = state.desk.lock().unwrap();
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

fn publish_homie_event(state: &SharedState, mqtt: &SharedMqtt, event: HomieEvent) {
    info!("homie event: {event}");
    let Some(device_state) = event.device_state() else {
        return;
    };
    let mut client = mqtt.lock().unwrap();
    if let Err(err) = client.enqueue(
        &state.topics.device_state,
        QoS::AtLeastOnce,
        true,
        device_state.as_bytes(),
    ) {
        warn!("homie $state publish failed: {err:?}");
    }
}

fn spawn_control_loop(
    state: SharedState,
    mqtt: SharedMqtt,
    reports: mpsc::Receiver<SessionReport>,
    mut climate: Option<ClimateSensor>,
) {
    thread::Builder::new()
        .name("desk-control".into())
        .stack_size(12 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register control loop with watchdog: {err:#}");
            }

            let tick = Duration::from_millis(state.runtime.control.tick_interval_ms);
            let climate_interval_ms = state
                .runtime
                .climate
                .publish_interval_ms
                .max(state.runtime.hardware.dht_model.min_read_interval_ms());
            let mut last_state_publish_ms = 0_u64;
            let mut last_climate_ms: Option<u64> = None;
            let mut last_height: Option<String> = None;
            let mut wifi_down_since_ms: Option<u64> = None;
            let mut backlog = ReportBacklog::new(OUTCOME_BACKLOG);

            loop {
                feed_watchdog();
                let now_ms = monotonic_ms();
                state.desk.lock().unwrap().tick(now_ms);

                let mqtt_ready = state.mqtt_connected.load(Ordering::Relaxed);
                while let Ok(report) = reports.try_recv() {
                    if let Some(evicted) = backlog.push(report) {
                        warn!(
                            "outcome backlog full; dropped {} report for {:.1}cm",
                            evicted.outcome.as_str(),
                            evicted.target_cm
                        );
                    }
                    last_state_publish_ms = 0;
                }
                if mqtt_ready && !backlog.is_empty() {
                    let flushed = backlog.flush(|report| {
                        publish_json(&mqtt, &state.topics.outcome, false, &report.payload())
                    });
                    if let Err(err) = flushed {
                        warn!("outcome publish failed, {} queued: {err:#}", backlog.len());
                    }
                }

                let publish_due =
                    now_ms.saturating_sub(last_state_publish_ms) >= STATE_PUBLISH_INTERVAL_MS;
                if mqtt_ready && publish_due {
                    last_state_publish_ms = now_ms;
                    if let Err(err) = publish_desk_state(&state, &mqtt, &mut last_height) {
                        warn!("desk state publish failed: {err:#}");
                    }
                }

                if let Some(sensor) = climate.as_mut() {
                    let due = last_climate_ms
                        .map_or(true, |at| now_ms.saturating_sub(at) >= climate_interval_ms);
                    if due && mqtt_ready {
                        last_climate_ms = Some(now_ms);
                        if let Some(reading) = sensor.read() {
                            publish_climate(&state, &mqtt, &reading);
                        }
                    }
                }

                check_wifi(&mut wifi_down_since_ms, now_ms);
                thread::sleep(tick);
            }
        })
        .expect("failed to spawn desk control thread");
}

/// Reason code of the latest station disconnect, 0 until one is seen.
static LAST_WIFI_DISCONNECT: AtomicU8 = AtomicU8::new(0);

unsafe extern "C" fn on_sta_disconnected(
    _arg: *mut core::ffi::c_void,
    _base: esp_idf_svc::sys::esp_event_base_t,
    _id: i32,
    data: *mut core::ffi::c_void,
) {
    if data.is_null() {
        return;
    }
    let event = &*(data as *const esp_idf_svc::sys::wifi_event_sta_disconnected_t);
    LAST_WIFI_DISCONNECT.store(event.reason as u8, Ordering::Relaxed);
}

fn watch_wifi_disconnects() -> anyhow::Result<()> {
    let rc = unsafe {
        esp_idf_svc::sys::esp_event_handler_register(
            esp_idf_svc::sys::WIFI_EVENT,
            esp_idf_svc::sys::wifi_event_t_WIFI_EVENT_STA_DISCONNECTED as i32,
            Some(on_sta_disconnected),
            core::ptr::null_mut(),
        )
    };
    if rc == esp_idf_svc::sys::ESP_OK {
        return Ok(());
    }
    Err(anyhow!("esp_event_handler_register failed with code {}", rc))
}

fn check_wifi(down_since_ms: &mut Option<u64>, now_ms: u64) {
    if is_wifi_station_connected() {
        *down_since_ms = None;
        return;
    }

    match *down_since_ms {
        None => {
            *down_since_ms = Some(now_ms);
            let reason =
                WifiDisconnectReason::from_code(LAST_WIFI_DISCONNECT.load(Ordering::Relaxed));
            info!("homie event: {}", HomieEvent::WifiDisconnected { reason });
        }
        Some(since_ms) if now_ms.saturating_sub(since_ms) >= WIFI_RESTART_GRACE_MS => {
            warn!(
                "wifi disconnected for {}s; restarting device for recovery",
                WIFI_RESTART_GRACE_MS / 1000
            );
            info!("homie event: {}", HomieEvent::AboutToReset);
            thread::sleep(Duration::from_millis(100));
            unsafe { esp_idf_svc::sys::esp_restart() };
        }
        Some(_) => {}
    }
}

fn publish_desk_state(
    state: &SharedState,
    mqtt: &SharedMqtt,
    last_height: &mut Option<String>,
) -> anyhow::Result<()> {
    let now_ms = monotonic_ms();
    let (payload, height) = {
        let desk = state.desk.lock().unwrap();
        (
            desk.state_payload(now_ms),
            desk.controller().last_height_cm(),
        )
    };

    publish_json(mqtt, &state.topics.state, true, &payload)?;

    if let Some(height) = height.map(height_payload) {
        if last_height.as_ref() != Some(&height) {
            mqtt.lock().unwrap().enqueue(
                &state.topics.height,
                QoS::AtLeastOnce,
                true,
                height.as_bytes(),
            )?;
            *last_height = Some(height);
        }
    }
    Ok(())
}

fn publish_climate(state: &SharedState, mqtt: &SharedMqtt, reading: &ClimateReading) {
    let publishes = [
        (&state.topics.temperature, reading.temperature_payload()),
        (&state.topics.humidity, reading.humidity_payload()),
    ];
    let mut client = mqtt.lock().unwrap();
    for (topic, payload) in publishes {
        if let Err(err) = client.enqueue(topic, QoS::AtMostOnce, true, payload.as_bytes()) {
            warn!("climate publish to {topic} failed: {err:?}");
        }
    }
}

fn publish_json<T: Serialize>(
    mqtt: &SharedMqtt,
    topic: &str,
    retain: bool,
    value: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(value)?;
    mqtt.lock()
        .unwrap()
        .enqueue(topic, QoS::AtLeastOnce, retain, &body)?;
    Ok(())
}

fn create_http_server(state: SharedState) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    {
        let state = state.clone();
        server.fn_handler("/api/status", Method::Get, move |req| {
            let payload = state.desk.lock().unwrap().state_payload(monotonic_ms());
            write_json(req, &payload)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/height", Method::Post, move |req| {
            let Some(value) = query_param(req.uri(), "value") else {
                return write_error(req, 400, "Missing 'value' parameter");
            };
            let Ok(target_cm) = value.trim().parse::<f32>() else {
                return write_error(req, 400, "Invalid height value");
            };

            let now_ms = monotonic_ms();
            let mut desk = state.desk.lock().unwrap();
            if let Err(err) = desk.request_height(target_cm, now_ms) {
                drop(desk);
                return write_error(req, 400, &err.to_string());
            }
            let payload = desk.state_payload(now_ms);
            drop(desk);
            write_json(req, &payload)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/abort", Method::Post, move |req| {
            let now_ms = monotonic_ms();
            let payload = {
                let mut desk = state.desk.lock().unwrap();
                desk.abort(now_ms);
                desk.state_payload(now_ms)
            };
            write_json(req, &payload)
        })?;
    }

    server.fn_handler("/api/config", Method::Get, move |req| {
        let runtime = &state.runtime;
        let view = ConfigView {
            device_id: &runtime.device_id,
            hardware: &runtime.hardware,
            sampler: &runtime.sampler,
            motion: &runtime.motion,
            control: &runtime.control,
            mqtt_host: &runtime.network.mqtt_host,
            mqtt_port: runtime.network.mqtt_port,
        };
        write_json(req, &view)
    })?;

    Ok(server)
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

fn query_param(uri: &str, key: &str) -> Option<String> {
    let query = uri.split_once('?')?.1;
    query.split('&').find_map(|pair| {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        (name == key).then(|| value.replace('+', " "))
    })
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().unwrap();
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
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

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
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

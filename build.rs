use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    network: Network,
    instrument: Instrument,
    decision: Decision,
    client: Client,
    telemetry: Telemetry,
    frames: Frames,
    recording: Recording,
    enhancer: Enhancer,
    gui: Gui,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Network {
    bind_ip: String,
    sender_ip: String,
    multicast_addr: String,
    video_port: u16,
    audio_port: u16,
    timestamp_port: u16,
    decision_port: u16,
}

#[derive(Deserialize)]
struct Instrument {
    backend: String,
    command: String,
    start_freq_hz: f64,
    end_freq_hz: f64,
    points: usize,
    average: u16,
    sweep_timeout_ms: u64,
    simulated_s11_db: f64,
}

#[derive(Deserialize)]
struct Decision {
    tick_secs: u64,
    client_idle_timeout_secs: u64,
    max_frame_len: usize,
}

#[derive(Deserialize)]
struct Client {
    poll_secs: u64,
    backoff_secs: u64,
    backoff_cap_secs: u64,
    backoff_jitter: f64,
    connect_timeout_ms: u64,
}

#[derive(Deserialize)]
struct Telemetry {
    tick_ms: u64,
    latency_interval_ms: u64,
    echo_timeout_ms: u64,
    ping_timeout_secs: u64,
    history_len: usize,
    event_queue_len: usize,
}

#[derive(Deserialize)]
struct Frames {
    fps: u32,
    table_capacity: usize,
}

#[derive(Deserialize)]
struct Recording {
    dir: String,
    duration_secs: u64,
    stop_grace_ms: u64,
}

#[derive(Deserialize)]
struct Enhancer {
    command: String,
    output_dir: String,
    timeout_secs: u64,
}

#[derive(Deserialize)]
struct Gui {
    local_port: u16,
    remote_port: u16,
    buffer_size: usize,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // 网络端口
    println!("cargo:rustc-env=NET_BIND_IP={}", config.network.bind_ip);
    println!("cargo:rustc-env=NET_SENDER_IP={}", config.network.sender_ip);
    println!("cargo:rustc-env=NET_MULTICAST_ADDR={}", config.network.multicast_addr);
    println!("cargo:rustc-env=NET_VIDEO_PORT={}", config.network.video_port);
    println!("cargo:rustc-env=NET_AUDIO_PORT={}", config.network.audio_port);
    println!("cargo:rustc-env=NET_TIMESTAMP_PORT={}", config.network.timestamp_port);
    println!("cargo:rustc-env=NET_DECISION_PORT={}", config.network.decision_port);

    // 测量仪器
    println!("cargo:rustc-env=INSTRUMENT_BACKEND={}", config.instrument.backend);
    println!("cargo:rustc-env=INSTRUMENT_COMMAND={}", config.instrument.command);
    println!("cargo:rustc-env=INSTRUMENT_START_FREQ_HZ={}", config.instrument.start_freq_hz);
    println!("cargo:rustc-env=INSTRUMENT_END_FREQ_HZ={}", config.instrument.end_freq_hz);
    println!("cargo:rustc-env=INSTRUMENT_POINTS={}", config.instrument.points);
    println!("cargo:rustc-env=INSTRUMENT_AVERAGE={}", config.instrument.average);
    println!("cargo:rustc-env=INSTRUMENT_SWEEP_TIMEOUT_MS={}", config.instrument.sweep_timeout_ms);
    println!("cargo:rustc-env=INSTRUMENT_SIMULATED_S11_DB={}", config.instrument.simulated_s11_db);

    // 决策服务
    println!("cargo:rustc-env=DECISION_TICK_SECS={}", config.decision.tick_secs);
    println!("cargo:rustc-env=DECISION_CLIENT_IDLE_TIMEOUT_SECS={}", config.decision.client_idle_timeout_secs);
    println!("cargo:rustc-env=DECISION_MAX_FRAME_LEN={}", config.decision.max_frame_len);

    // 决策客户端
    println!("cargo:rustc-env=CLIENT_POLL_SECS={}", config.client.poll_secs);
    println!("cargo:rustc-env=CLIENT_BACKOFF_SECS={}", config.client.backoff_secs);
    println!("cargo:rustc-env=CLIENT_BACKOFF_CAP_SECS={}", config.client.backoff_cap_secs);
    println!("cargo:rustc-env=CLIENT_BACKOFF_JITTER={}", config.client.backoff_jitter);
    println!("cargo:rustc-env=CLIENT_CONNECT_TIMEOUT_MS={}", config.client.connect_timeout_ms);

    // 遥测
    println!("cargo:rustc-env=TELEMETRY_TICK_MS={}", config.telemetry.tick_ms);
    println!("cargo:rustc-env=TELEMETRY_LATENCY_INTERVAL_MS={}", config.telemetry.latency_interval_ms);
    println!("cargo:rustc-env=TELEMETRY_ECHO_TIMEOUT_MS={}", config.telemetry.echo_timeout_ms);
    println!("cargo:rustc-env=TELEMETRY_PING_TIMEOUT_SECS={}", config.telemetry.ping_timeout_secs);
    println!("cargo:rustc-env=TELEMETRY_HISTORY_LEN={}", config.telemetry.history_len);
    println!("cargo:rustc-env=TELEMETRY_EVENT_QUEUE_LEN={}", config.telemetry.event_queue_len);

    println!("cargo:rustc-env=FRAMES_FPS={}", config.frames.fps);
    println!("cargo:rustc-env=FRAMES_TABLE_CAPACITY={}", config.frames.table_capacity);

    // 录制与增强
    println!("cargo:rustc-env=RECORDING_DIR={}", config.recording.dir);
    println!("cargo:rustc-env=RECORDING_DURATION_SECS={}", config.recording.duration_secs);
    println!("cargo:rustc-env=RECORDING_STOP_GRACE_MS={}", config.recording.stop_grace_ms);
    println!("cargo:rustc-env=ENHANCER_COMMAND={}", config.enhancer.command);
    println!("cargo:rustc-env=ENHANCER_OUTPUT_DIR={}", config.enhancer.output_dir);
    println!("cargo:rustc-env=ENHANCER_TIMEOUT_SECS={}", config.enhancer.timeout_secs);

    // GUI 进程
    println!("cargo:rustc-env=GUI_LOCAL_PORT={}", config.gui.local_port);
    println!("cargo:rustc-env=GUI_REMOTE_PORT={}", config.gui.remote_port);
    println!("cargo:rustc-env=GUI_BUFFER_SIZE={}", config.gui.buffer_size);
}

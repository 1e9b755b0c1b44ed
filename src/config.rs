use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Serialize, Clone)]
pub struct Config {
    // 网络配置（IP 可在运行时由命令行覆盖）
    pub bind_ip: String,
    pub sender_ip: String,
    pub multicast_addr: &'static str,
    pub video_port: u16,
    pub audio_port: u16,
    pub timestamp_port: u16,
    pub decision_port: u16,

    // 测量仪器
    pub instrument_backend: &'static str,
    pub instrument_command: &'static str,
    pub start_freq_hz: f64,
    pub end_freq_hz: f64,
    pub sweep_points: usize,
    pub sweep_average: u16,
    pub sweep_timeout_ms: u64,
    pub simulated_s11_db: f64,

    // 决策服务
    pub decision_tick_secs: u64,
    pub client_idle_timeout_secs: u64,
    pub max_frame_len: usize,

    // 决策客户端
    pub poll_secs: u64,
    pub backoff_secs: u64,
    pub backoff_cap_secs: u64,
    pub backoff_jitter: f64,
    pub connect_timeout_ms: u64,

    // 遥测
    pub telemetry_tick_ms: u64,
    pub latency_interval_ms: u64,
    pub echo_timeout_ms: u64,
    pub ping_timeout_secs: u64,
    pub history_len: usize,
    pub event_queue_len: usize,

    // 帧时间戳
    pub frames_fps: u32,
    pub frame_table_capacity: usize,

    // 录制与增强
    pub recording_dir: String,
    pub recording_duration_secs: u64,
    pub stop_grace_ms: u64,
    pub enhancer_command: &'static str,
    pub enhancer_output_dir: &'static str,
    pub enhancer_timeout_secs: u64,

    // GUI进程配置
    pub gui_local_port: u16,
    pub gui_remote_port: u16,
    pub gui_buffer_size: usize,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            bind_ip: env!("NET_BIND_IP").to_string(),
            sender_ip: env!("NET_SENDER_IP").to_string(),
            multicast_addr: env!("NET_MULTICAST_ADDR"),
            video_port: env!("NET_VIDEO_PORT").parse()
                .map_err(|_| "Failed to parse NET_VIDEO_PORT")?,
            audio_port: env!("NET_AUDIO_PORT").parse()
                .map_err(|_| "Failed to parse NET_AUDIO_PORT")?,
            timestamp_port: env!("NET_TIMESTAMP_PORT").parse()
                .map_err(|_| "Failed to parse NET_TIMESTAMP_PORT")?,
            decision_port: env!("NET_DECISION_PORT").parse()
                .map_err(|_| "Failed to parse NET_DECISION_PORT")?,

            instrument_backend: env!("INSTRUMENT_BACKEND"),
            instrument_command: env!("INSTRUMENT_COMMAND"),
            start_freq_hz: env!("INSTRUMENT_START_FREQ_HZ").parse()
                .map_err(|_| "Failed to parse INSTRUMENT_START_FREQ_HZ")?,
            end_freq_hz: env!("INSTRUMENT_END_FREQ_HZ").parse()
                .map_err(|_| "Failed to parse INSTRUMENT_END_FREQ_HZ")?,
            sweep_points: env!("INSTRUMENT_POINTS").parse()
                .map_err(|_| "Failed to parse INSTRUMENT_POINTS")?,
            sweep_average: env!("INSTRUMENT_AVERAGE").parse()
                .map_err(|_| "Failed to parse INSTRUMENT_AVERAGE")?,
            sweep_timeout_ms: env!("INSTRUMENT_SWEEP_TIMEOUT_MS").parse()
                .map_err(|_| "Failed to parse INSTRUMENT_SWEEP_TIMEOUT_MS")?,
            simulated_s11_db: env!("INSTRUMENT_SIMULATED_S11_DB").parse()
                .map_err(|_| "Failed to parse INSTRUMENT_SIMULATED_S11_DB")?,

            decision_tick_secs: env!("DECISION_TICK_SECS").parse()
                .map_err(|_| "Failed to parse DECISION_TICK_SECS")?,
            client_idle_timeout_secs: env!("DECISION_CLIENT_IDLE_TIMEOUT_SECS").parse()
                .map_err(|_| "Failed to parse DECISION_CLIENT_IDLE_TIMEOUT_SECS")?,
            max_frame_len: env!("DECISION_MAX_FRAME_LEN").parse()
                .map_err(|_| "Failed to parse DECISION_MAX_FRAME_LEN")?,

            poll_secs: env!("CLIENT_POLL_SECS").parse()
                .map_err(|_| "Failed to parse CLIENT_POLL_SECS")?,
            backoff_secs: env!("CLIENT_BACKOFF_SECS").parse()
                .map_err(|_| "Failed to parse CLIENT_BACKOFF_SECS")?,
            backoff_cap_secs: env!("CLIENT_BACKOFF_CAP_SECS").parse()
                .map_err(|_| "Failed to parse CLIENT_BACKOFF_CAP_SECS")?,
            backoff_jitter: env!("CLIENT_BACKOFF_JITTER").parse()
                .map_err(|_| "Failed to parse CLIENT_BACKOFF_JITTER")?,
            connect_timeout_ms: env!("CLIENT_CONNECT_TIMEOUT_MS").parse()
                .map_err(|_| "Failed to parse CLIENT_CONNECT_TIMEOUT_MS")?,

            telemetry_tick_ms: env!("TELEMETRY_TICK_MS").parse()
                .map_err(|_| "Failed to parse TELEMETRY_TICK_MS")?,
            latency_interval_ms: env!("TELEMETRY_LATENCY_INTERVAL_MS").parse()
                .map_err(|_| "Failed to parse TELEMETRY_LATENCY_INTERVAL_MS")?,
            echo_timeout_ms: env!("TELEMETRY_ECHO_TIMEOUT_MS").parse()
                .map_err(|_| "Failed to parse TELEMETRY_ECHO_TIMEOUT_MS")?,
            ping_timeout_secs: env!("TELEMETRY_PING_TIMEOUT_SECS").parse()
                .map_err(|_| "Failed to parse TELEMETRY_PING_TIMEOUT_SECS")?,
            history_len: env!("TELEMETRY_HISTORY_LEN").parse()
                .map_err(|_| "Failed to parse TELEMETRY_HISTORY_LEN")?,
            event_queue_len: env!("TELEMETRY_EVENT_QUEUE_LEN").parse()
                .map_err(|_| "Failed to parse TELEMETRY_EVENT_QUEUE_LEN")?,

            frames_fps: env!("FRAMES_FPS").parse()
                .map_err(|_| "Failed to parse FRAMES_FPS")?,
            frame_table_capacity: env!("FRAMES_TABLE_CAPACITY").parse()
                .map_err(|_| "Failed to parse FRAMES_TABLE_CAPACITY")?,

            recording_dir: env!("RECORDING_DIR").to_string(),
            recording_duration_secs: env!("RECORDING_DURATION_SECS").parse()
                .map_err(|_| "Failed to parse RECORDING_DURATION_SECS")?,
            stop_grace_ms: env!("RECORDING_STOP_GRACE_MS").parse()
                .map_err(|_| "Failed to parse RECORDING_STOP_GRACE_MS")?,
            enhancer_command: env!("ENHANCER_COMMAND"),
            enhancer_output_dir: env!("ENHANCER_OUTPUT_DIR"),
            enhancer_timeout_secs: env!("ENHANCER_TIMEOUT_SECS").parse()
                .map_err(|_| "Failed to parse ENHANCER_TIMEOUT_SECS")?,

            gui_local_port: env!("GUI_LOCAL_PORT").parse()
                .map_err(|_| "Failed to parse GUI_LOCAL_PORT")?,
            gui_remote_port: env!("GUI_REMOTE_PORT").parse()
                .map_err(|_| "Failed to parse GUI_REMOTE_PORT")?,
            gui_buffer_size: env!("GUI_BUFFER_SIZE").parse()
                .map_err(|_| "Failed to parse GUI_BUFFER_SIZE")?,
        })
    }

    pub fn decision_bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.bind_ip, self.decision_port).parse()
    }

    pub fn timestamp_bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.bind_ip, self.timestamp_port).parse()
    }

    pub fn decision_server_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.sender_ip, self.decision_port).parse()
    }

    pub fn timestamp_server_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.sender_ip, self.timestamp_port).parse()
    }

    pub fn decision_tick(&self) -> Duration {
        Duration::from_secs(self.decision_tick_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_secs)
    }

    pub fn telemetry_tick(&self) -> Duration {
        Duration::from_millis(self.telemetry_tick_ms)
    }

    pub fn recording_duration(&self) -> Duration {
        Duration::from_secs(self.recording_duration_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn recording_path(&self) -> PathBuf {
        PathBuf::from(&self.recording_dir)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new().expect("Failed to create default Config from build-time environment variables")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_time_defaults_parse() {
        let config = Config::new().unwrap();
        assert_eq!(config.decision_tick_secs, 5);
        assert_eq!(config.poll_secs, 2);
        assert_eq!(config.backoff_secs, 5);
        assert_eq!(config.history_len, 30);
        assert_eq!(config.frame_table_capacity, 100);
        assert_eq!(config.sweep_points, 100);
        assert!(config.start_freq_hz < config.end_freq_hz);
    }

    #[test]
    fn socket_addresses_follow_runtime_ip_override() {
        let mut config = Config::default();
        config.sender_ip = "127.0.0.1".to_string();
        let addr = config.decision_server_addr().unwrap();
        assert_eq!(addr.port(), config.decision_port);
        assert!(addr.ip().is_loopback());
    }
}

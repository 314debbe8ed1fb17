//! Generator configuration.
//!
//! Every field has a default matching the cadence of a live 25 fps H.264 /
//! 8 kHz A-law source. A TOML file may override any subset:
//!
//! ```toml
//! local_ip = "127.0.0.1"
//! port_start = 20000
//! port_end = 30000
//!
//! [audio]
//! frame_size = 160
//!
//! [video]
//! mtu = 1200
//! packetization = "non-interleaved"
//! ```

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{LoadgenError, Result};
use crate::media::annexb::DEFAULT_TIMESTAMP_STEP;
use crate::media::h264::{DEFAULT_MTU, PacketizationMode};

/// Session and pacing parameters shared by every session of a generator.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoadgenConfig {
    /// Address RTP is sent from, also advertised as the peer address.
    pub local_ip: IpAddr,
    /// First port of the RTP port pool (rounded up to even).
    pub port_start: u16,
    /// End of the RTP port pool, exclusive (rounded down to even).
    pub port_end: u16,
    /// Interval between KEEPALIVE events on the signaling channel.
    pub keepalive_interval_ms: u64,
    /// Interval between SESSION_INFO reports.
    pub report_interval_ms: u64,
    /// Whether SESSION_INFO reports are sent at all.
    pub report_session_info: bool,
    /// Wait between StartSession and opening the transport.
    pub settle_delay_ms: u64,
    /// Time given to in-flight packets after reading stops.
    pub drain_grace_ms: u64,
    /// Wait after StopSession before the session is torn down.
    pub stop_linger_ms: u64,
    /// Pause before a looping source rewinds to the beginning.
    pub loop_pause_ms: u64,
    /// Capacity of the framer → pump queue.
    pub queue_capacity: usize,
    /// Consecutive write failures tolerated before the session is closed.
    pub max_write_failures: u32,
    pub audio: AudioSettings,
    pub video: VideoSettings,
}

/// Fixed-size audio framing (PCMA at 8 kHz: 160 bytes every 20 ms).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AudioSettings {
    pub frame_size: usize,
    pub interval_ms: u64,
    pub payload_type: u8,
    /// RTP timestamp advance per packet.
    pub timestamp_step: u32,
}

/// Annex B reading and H.264 packetization.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VideoSettings {
    /// Bytes read from the cache per tick.
    pub window_size: usize,
    pub interval_ms: u64,
    pub payload_type: u8,
    /// Synthetic 90 kHz timestamp advance per NAL unit (25 fps).
    pub timestamp_step: u32,
    /// Largest RTP payload before a NAL unit is fragmented.
    pub mtu: usize,
    pub packetization: PacketizationMode,
}

impl Default for LoadgenConfig {
    fn default() -> Self {
        Self {
            local_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port_start: 20000,
            port_end: 30000,
            keepalive_interval_ms: 2000,
            report_interval_ms: 5000,
            report_session_info: true,
            settle_delay_ms: 1000,
            drain_grace_ms: 1000,
            stop_linger_ms: 1000,
            loop_pause_ms: 1000,
            queue_capacity: 32,
            max_write_failures: 16,
            audio: AudioSettings::default(),
            video: VideoSettings::default(),
        }
    }
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            frame_size: 160,
            interval_ms: 20,
            payload_type: 8,
            timestamp_step: 160,
        }
    }
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            window_size: 4096,
            interval_ms: 40,
            payload_type: 123,
            timestamp_step: DEFAULT_TIMESTAMP_STEP,
            mtu: DEFAULT_MTU,
            packetization: PacketizationMode::NonInterleaved,
        }
    }
}

impl LoadgenConfig {
    /// Read a TOML configuration file; missing keys keep their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            LoadgenError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| LoadgenError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the settings for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.audio.frame_size == 0 || self.video.window_size == 0 {
            return Err(LoadgenError::Config("frame and window sizes must be non-zero".into()));
        }
        if self.audio.interval_ms == 0 || self.video.interval_ms == 0 {
            return Err(LoadgenError::Config("pacing intervals must be non-zero".into()));
        }
        if self.video.mtu < 3 {
            return Err(LoadgenError::Config("video mtu must be at least 3 bytes".into()));
        }
        if self.port_start == 0 {
            return Err(LoadgenError::Config("port_start must be non-zero".into()));
        }
        if self.port_start >= self.port_end {
            return Err(LoadgenError::Config("port_start must be below port_end".into()));
        }
        Ok(())
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    pub fn stop_linger(&self) -> Duration {
        Duration::from_millis(self.stop_linger_ms)
    }

    pub fn loop_pause(&self) -> Duration {
        Duration::from_millis(self.loop_pause_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_live_cadence() {
        let config = LoadgenConfig::default();
        assert_eq!(config.audio.frame_size, 160);
        assert_eq!(config.audio.interval_ms, 20);
        assert_eq!(config.video.window_size, 4096);
        assert_eq!(config.video.interval_ms, 40);
        assert_eq!(config.video.timestamp_step, 3600);
        assert_eq!(config.queue_capacity, 32);
        assert_eq!(config.keepalive_interval(), Duration::from_secs(2));
        assert_eq!(config.report_interval(), Duration::from_secs(5));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = LoadgenConfig::from_toml(
            r#"
            port_start = 40000
            port_end = 40100

            [video]
            mtu = 1000
            packetization = "single-nal"
            "#,
        )
        .unwrap();
        assert_eq!(config.port_start, 40000);
        assert_eq!(config.video.mtu, 1000);
        assert_eq!(config.video.packetization, PacketizationMode::SingleNal);
        assert_eq!(config.video.window_size, 4096);
        assert_eq!(config.audio.payload_type, 8);
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(matches!(
            LoadgenConfig::from_toml("no_such_key = 1"),
            Err(LoadgenError::Config(_))
        ));
    }

    #[test]
    fn rejects_zero_port_start() {
        assert!(matches!(
            LoadgenConfig::from_toml("port_start = 0"),
            Err(LoadgenError::Config(_))
        ));
        let config = LoadgenConfig {
            port_start: 0,
            ..LoadgenConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_interval() {
        assert!(LoadgenConfig::from_toml("[audio]\ninterval_ms = 0").is_err());
    }
}

//! Constants and configuration values for Omenfan
//!
//! Centralizes all magic numbers, paths, and protocol constants.
//! Register addresses that the hardware maps differently per model live in
//! `data::register_map` as configuration data, not here.

use std::time::Duration;

/// Configuration paths
pub mod paths {
    use std::path::PathBuf;

    /// System-wide configuration directory (daemon running as root)
    pub const SYSTEM_CONFIG_DIR: &str = "/etc/omenfan";

    /// Environment override for the configuration directory
    pub const CONFIG_DIR_ENV: &str = "OMENFAN_CONFIG_DIR";

    /// Settings file name
    pub const SETTINGS_FILE: &str = "settings.json";

    /// Calibration store file name
    pub const CALIBRATION_FILE: &str = "calibration.json";

    /// Base path for hwmon devices
    pub const HWMON_BASE: &str = "/sys/class/hwmon";

    /// DMI product name, used as the default model key
    pub const DMI_PRODUCT_NAME: &str = "/sys/devices/virtual/dmi/id/product_name";

    /// DMI board name (HP encodes the platform id here)
    pub const DMI_BOARD_NAME: &str = "/sys/devices/virtual/dmi/id/board_name";

    /// Resolve the configuration directory
    ///
    /// Order: `$OMENFAN_CONFIG_DIR`, the user config dir, then `/etc/omenfan`.
    pub fn config_dir() -> PathBuf {
        if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
            if !dir.trim().is_empty() {
                return PathBuf::from(dir);
            }
        }
        dirs::config_dir()
            .map(|d| d.join("omenfan"))
            .unwrap_or_else(|| PathBuf::from(SYSTEM_CONFIG_DIR))
    }
}

/// Fan control constants
pub mod fan {
    /// Duty returned when a curve has no points
    pub const EMPTY_CURVE_DUTY_PERCENT: u8 = 50;

    /// Knots closer than this are treated as one point during interpolation
    pub const MIN_KNOT_SPACING_CELSIUS: f32 = 0.1;

    /// Default maximum native fan level (units of 100 RPM)
    pub const DEFAULT_MAX_LEVEL: u8 = 55;

    /// Default rated maximum RPM when no calibration exists
    pub const DEFAULT_RATED_MAX_RPM: u32 = 5500;

    /// RPM below which a fan counts as stopped
    pub const STOPPED_RPM_THRESHOLD: u32 = 300;

    /// Fraction of rated maximum expected after a max-speed command
    pub const MAX_SPEED_EXPECTED_FRACTION: f32 = 0.9;

    /// Maximum duty percent
    pub const MAX_PERCENT: u8 = 100;

    /// Maximum value of an 8-bit duty register
    pub const DUTY_REGISTER_MAX: u8 = 255;

    /// Estimation heuristic: `clamp((max_temp - OFFSET) * SLOPE, MIN, MAX)`
    pub const ESTIMATE_TEMP_OFFSET: f32 = 30.0;
    pub const ESTIMATE_SLOPE: f32 = 2.0;
    pub const ESTIMATE_MIN_PERCENT: f32 = 20.0;
    pub const ESTIMATE_MAX_PERCENT: f32 = 80.0;

    /// Convert a percentage to an 8-bit duty value
    #[inline]
    pub fn percent_to_duty_byte(percent: u8) -> u8 {
        ((percent.min(MAX_PERCENT) as f32 / 100.0) * DUTY_REGISTER_MAX as f32).round() as u8
    }

    /// Scale a percentage onto `0..=max_level`, rounded
    #[inline]
    pub fn percent_to_level(percent: u8, max_level: u8) -> u8 {
        ((percent.min(MAX_PERCENT) as f32 * max_level as f32) / 100.0).round() as u8
    }
}

/// Closed-loop verification defaults
pub mod verification {
    use super::*;

    /// Mechanical settle time before the first sample
    pub const SETTLE_TIME: Duration = Duration::from_millis(2500);

    /// Delay between RPM samples
    pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(300);

    /// Samples averaged per verification round
    pub const SAMPLE_COUNT: u32 = 3;

    /// Accepted deviation from expected RPM (fraction)
    pub const TOLERANCE: f32 = 0.20;

    /// Resample rounds after the first failed comparison
    pub const MAX_RETRIES: u32 = 2;

    /// Back-off before a resample round
    pub const RETRY_BACKOFF: Duration = Duration::from_millis(1000);
}

/// Timing constants for control and hand-back
pub mod timing {
    use super::*;

    /// Default telemetry poll interval
    pub const POLL_INTERVAL: Duration = Duration::from_millis(1000);

    /// Minimum accepted poll interval
    pub const MIN_POLL_INTERVAL_MS: u64 = 100;

    /// Pause between the two firmware hand-back passes in a reset
    pub const RESET_REASSERT_DELAY: Duration = Duration::from_millis(200);

    /// Bounded wait for the backend I/O lock
    pub const BACKEND_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

    /// Consecutive open failures before a backend kind stops being tried
    pub const BACKEND_DISABLE_AFTER: u32 = 3;
}

/// Embedded controller port protocol (ACPI EC interface)
pub mod ec {
    /// EC data port
    pub const DATA_PORT: u16 = 0x62;

    /// EC command/status port
    pub const COMMAND_PORT: u16 = 0x66;

    /// Status: output buffer full
    pub const STATUS_OBF: u8 = 0x01;

    /// Status: input buffer full
    pub const STATUS_IBF: u8 = 0x02;

    /// Read EC command
    pub const CMD_READ: u8 = 0x80;

    /// Write EC command
    pub const CMD_WRITE: u8 = 0x81;

    /// Status polls before a port wait gives up
    pub const WAIT_BUDGET: u32 = 5000;

    /// Highest address reachable through the port protocol
    pub const MAX_PORT_ADDRESS: u16 = 0xFF;
}

/// SMU mailbox protocol
pub mod smu {
    use super::*;

    /// Host bridge PCI location used for SMN indirect access
    pub const HOST_BRIDGE: (u8, u8, u8) = (0, 0, 0);

    /// SMN index register offset in host-bridge config space
    pub const SMN_INDEX_OFFSET: u16 = 0xB8;

    /// SMN data register offset in host-bridge config space
    pub const SMN_DATA_OFFSET: u16 = 0xBC;

    /// Number of 32-bit argument registers
    pub const ARG_COUNT: usize = 6;

    /// Poll iterations for response clear and completion
    pub const POLL_BUDGET: u32 = 8192;

    /// Bounded wait for the process-wide mailbox lock
    pub const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

    /// Response register values
    pub const RESPONSE_OK: u32 = 0x01;
    pub const RESPONSE_FAILED: u32 = 0xFF;
    pub const RESPONSE_UNKNOWN_CMD: u32 = 0xFE;
    pub const RESPONSE_REJECTED_PREREQ: u32 = 0xFD;
    pub const RESPONSE_REJECTED_BUSY: u32 = 0xFC;

    /// MP1 power-limit messages (Renoir and later)
    pub const MSG_SET_STAPM_LIMIT: u32 = 0x14;
    pub const MSG_SET_FAST_LIMIT: u32 = 0x15;
    pub const MSG_SET_SLOW_LIMIT: u32 = 0x16;
}

/// Firmware WMI BIOS command interface
pub mod firmware {
    use super::*;

    /// Vendor signature "SECU"
    pub const SIGNATURE: [u8; 4] = *b"SECU";

    /// Gaming/thermal command class
    pub const COMMAND_CLASS_GAMING: u32 = 0x20008;

    /// Fixed size of the legacy request/response buffer
    pub const LEGACY_BUFFER_SIZE: usize = 128;

    /// Legacy header: signature + command id
    pub const LEGACY_HEADER_SIZE: usize = 8;

    /// Largest payload any command may carry
    pub const MAX_PAYLOAD: usize = 124;

    /// Largest payload the legacy frame can carry
    pub const LEGACY_MAX_PAYLOAD: usize = LEGACY_BUFFER_SIZE - LEGACY_HEADER_SIZE;

    /// Consecutive failures before the adapter disables itself
    pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

    /// Window for coalescing identical log lines
    pub const LOG_THROTTLE_WINDOW: Duration = Duration::from_secs(30);

    /// Wall-clock timeout at the transport layer
    pub const TRANSPORT_TIMEOUT: Duration = Duration::from_secs(2);

    /// Return codes
    pub const RET_SUCCESS: u32 = 0x00;
    pub const RET_WRONG_SIGNATURE: u32 = 0x02;
    pub const RET_UNKNOWN_COMMAND: u32 = 0x03;
    pub const RET_UNKNOWN_COMMAND_TYPE: u32 = 0x04;
    pub const RET_INVALID_PARAMETERS: u32 = 0x05;

    /// Command types in the gaming class
    pub mod command {
        pub const GET_FAN_COUNT: u32 = 0x10;
        pub const SET_PERFORMANCE_MODE: u32 = 0x1A;
        pub const GET_TEMPERATURE: u32 = 0x23;
        pub const GET_MAX_FAN: u32 = 0x26;
        pub const SET_MAX_FAN: u32 = 0x27;
        pub const GET_SYSTEM_DESIGN_DATA: u32 = 0x28;
        pub const GET_FAN_LEVEL: u32 = 0x2D;
        pub const SET_FAN_LEVEL: u32 = 0x2E;
    }

    /// Thermal profile bytes
    pub mod profile {
        pub const V0_DEFAULT: u8 = 0x00;
        pub const V0_PERFORMANCE: u8 = 0x01;
        pub const V0_COOL: u8 = 0x02;
        pub const V0_QUIET: u8 = 0x03;
        pub const V1_DEFAULT: u8 = 0x30;
        pub const V1_PERFORMANCE: u8 = 0x31;
        pub const V1_COOL: u8 = 0x50;
    }
}

/// Vendor background-service proxy
pub mod service {
    use super::*;

    /// Process names of the vendor services
    pub const VENDOR_PROCESSES: &[&str] = &[
        "HPOmenCap",
        "OmenCommandCenterBackground",
        "HP.OMEN.OMENCommandCenter",
    ];

    /// Known-safe read used to validate the channel at startup
    pub const PROBE_COMMAND: &str = "Fan:GetData";

    /// Command keys
    pub const SET_MODE_PREFIX: &str = "FanControl:SetMode:";
    pub const SET_MAX_PREFIX: &str = "FanControl:SetMax:";
    pub const SET_LEVEL_PREFIX: &str = "FanControl:SetLevel:";

    /// Wall-clock timeout for a proxied call
    pub const CALL_TIMEOUT: Duration = Duration::from_secs(3);

    /// Largest response accepted from the bridge
    pub const MAX_RESPONSE_SIZE: usize = 64 * 1024;
}

/// Intel MSR layout used by the power controller
pub mod msr {
    /// RAPL unit register (read-only)
    pub const RAPL_POWER_UNIT: u32 = 0x606;

    /// Package power limit register (PL1/PL2)
    pub const PKG_POWER_LIMIT: u32 = 0x610;

    /// Temperature target register (TCC offset in bits 29:24)
    pub const TEMPERATURE_TARGET: u32 = 0x1A2;

    /// Overclocking mailbox (voltage offset)
    pub const OC_MAILBOX: u32 = 0x150;

    /// TCC offset field
    pub const TCC_OFFSET_SHIFT: u32 = 24;
    pub const TCC_OFFSET_MASK: u64 = 0x3F;

    /// PL field width and enable bits
    pub const PL_VALUE_MASK: u64 = 0x7FFF;
    pub const PL1_ENABLE_BIT: u64 = 1 << 15;
    pub const PL2_SHIFT: u32 = 32;
    pub const PL2_ENABLE_BIT: u64 = 1 << 47;
    pub const PL_LOCK_BIT: u64 = 1 << 63;

    /// OC mailbox command layout
    pub const OC_MAILBOX_BUSY: u64 = 1 << 63;
    pub const OC_MAILBOX_WRITE: u64 = 0x11 << 32;
    pub const OC_MAILBOX_READ: u64 = 0x10 << 32;
    pub const OC_PLANE_SHIFT: u32 = 40;
    pub const OC_MAX_OFFSET_MV: i32 = 250;
}

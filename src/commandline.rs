use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::path::PathBuf;
use std::time::Duration;

pub fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Show one telemetry snapshot: pack voltage, current, cell voltages, temperatures, SOC/SOH and status
    Reading,
    /// Show the module ID of the pack
    ModuleId,
    /// Show the selected CAN protocol and all protocols the pack offers
    Can,
    /// Show the selected RS485 protocol and all protocols the pack offers
    Rs485,
    /// Set the module ID
    SetModuleId {
        /// The new module ID (1 to 16)
        #[arg(value_parser = clap::value_parser!(u8).range(1..=16))]
        module_id: u8,
    },
    /// Select a CAN protocol by its position in the table shown by `can`
    SetCan {
        /// Zero-based protocol index
        index: u8,
    },
    /// Select an RS485 protocol by its position in the table shown by `rs485`
    SetRs485 {
        /// Zero-based protocol index
        index: u8,
    },
    /// Run in monitor mode, polling telemetry until Ctrl-C
    Monitor {
        /// Interval between telemetry requests (e.g., "5s", "1m"), defaults to the configured poll interval
        #[clap(long, short, value_parser = humantime::parse_duration)]
        interval: Option<Duration>,
        /// Output format for readings
        #[arg(long, value_enum, default_value_t = MonitorFormat::Console)]
        format: MonitorFormat,
    },
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq)]
pub enum MonitorFormat {
    Console,
    Json,
}

const fn about_text() -> &'static str {
    "zetara bms command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Serial port device path (e.g., /dev/ttyUSB0 on Linux, COM1 on Windows)
    #[arg(short, long, conflicts_with = "ble")]
    pub device: Option<String>,

    /// Connect over Bluetooth LE to the device advertising this name
    #[arg(long)]
    pub ble: Option<String>,

    /// YAML configuration file with transport and timing settings
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Deadline for each request (e.g., "2s", "10s")
    #[arg(value_parser = humantime::parse_duration, long)]
    pub timeout: Option<Duration>,

    /// Pause between two queued requests (e.g., "100ms", "500ms")
    #[arg(value_parser = humantime::parse_duration, long)]
    pub delay: Option<Duration>,

    /// Number of retries for failed read commands
    #[arg(long)]
    pub retries: Option<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_monitor_with_interval() {
        let args = CliArgs::parse_from([
            "zetarabms",
            "--timeout",
            "2s",
            "monitor",
            "--interval",
            "1m",
            "--format",
            "json",
        ]);
        assert_eq!(args.timeout, Some(Duration::from_secs(2)));
        assert_eq!(
            args.command,
            CliCommands::Monitor {
                interval: Some(Duration::from_secs(60)),
                format: MonitorFormat::Json
            }
        );
    }

    #[test]
    fn rejects_module_id_out_of_range() {
        assert!(CliArgs::try_parse_from(["zetarabms", "set-module-id", "17"]).is_err());
        assert!(CliArgs::try_parse_from(["zetarabms", "set-module-id", "0"]).is_err());
    }

    #[test]
    fn device_and_ble_are_exclusive() {
        let args = CliArgs::try_parse_from([
            "zetarabms", "--device", "/dev/ttyUSB1", "--ble", "BMS", "reading",
        ]);
        assert!(args.is_err());
    }
}

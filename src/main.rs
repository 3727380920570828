mod commandline;
mod config_file;
mod daemon;

use anyhow::{bail, Context, Result};
use clap::Parser;
use commandline::{CliArgs, CliCommands};
use config_file::{AppConfig, Endpoint};
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::{ops::Deref, panic};
use zetarabms_lib::{BmsManager, Link, ManagerConfig, ProtocolBus, ProtocolSelection};

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

#[cfg(feature = "ble")]
async fn open_ble(name: &str, config: &AppConfig) -> Result<Link> {
    let settings = config.ble_settings()?;
    zetarabms_lib::ble::BleTransport::connect(name, &settings)
        .await
        .with_context(|| format!("Cannot connect to BLE device '{name}'"))
}

#[cfg(not(feature = "ble"))]
async fn open_ble(name: &str, _config: &AppConfig) -> Result<Link> {
    bail!("Cannot connect to BLE device '{name}': built without the 'ble' feature")
}

async fn open_link(endpoint: &Endpoint, config: &AppConfig, manager: &ManagerConfig) -> Result<Link> {
    match endpoint {
        Endpoint::Serial(device) => {
            zetarabms_lib::tokio_serial_async::SerialTransport::open(device, manager.request_timeout)
                .with_context(|| format!("Cannot open serial port '{device}'"))
        }
        Endpoint::Ble(name) => open_ble(name, config).await,
    }
}

fn print_protocols(selection: &ProtocolSelection) {
    println!(
        "{} protocol: {} (index {})",
        selection.bus,
        selection.readable_protocol(),
        selection.selected_index
    );
    for (index, name) in selection.readable_protocols().iter().enumerate() {
        println!("  {index}: {name}");
    }
}

fn report_set(what: &str, accepted: bool) -> Result<()> {
    if !accepted {
        bail!("BMS rejected the new {what}");
    }
    println!("{what} updated");
    Ok(())
}

async fn set_protocol(bms: &BmsManager, bus: ProtocolBus, index: u8) -> Result<()> {
    let module = bms
        .get_module_id()
        .await
        .with_context(|| "Cannot get module ID")?;
    if !module.other_protocols_enabled() {
        bail!(
            "Only the pack with module ID 1 may change the {bus} protocol, this is {}",
            module.readable_id()
        );
    }
    let accepted = match bus {
        ProtocolBus::Can => bms.set_can(index).await,
        ProtocolBus::Rs485 => bms.set_rs485(index).await,
    }
    .with_context(|| format!("Cannot set {bus} protocol"))?;
    report_set(&format!("{bus} protocol"), accepted)
}

async fn run_command(bms: &BmsManager, command: &CliCommands) -> Result<()> {
    match command {
        CliCommands::Reading => daemon::print_reading(
            &bms.get_bms_reading()
                .await
                .with_context(|| "Cannot get BMS reading")?,
        ),
        CliCommands::ModuleId => {
            let module = bms
                .get_module_id()
                .await
                .with_context(|| "Cannot get module ID")?;
            println!("Module: {}", module.readable_id());
        }
        CliCommands::Can => print_protocols(
            &bms.get_can()
                .await
                .with_context(|| "Cannot get CAN protocol")?,
        ),
        CliCommands::Rs485 => print_protocols(
            &bms.get_rs485()
                .await
                .with_context(|| "Cannot get RS485 protocol")?,
        ),
        CliCommands::SetModuleId { module_id } => {
            let accepted = bms
                .set_module_id(*module_id)
                .await
                .with_context(|| "Cannot set module ID")?;
            report_set("module ID", accepted)?;
        }
        CliCommands::SetCan { index } => set_protocol(bms, ProtocolBus::Can, *index).await?,
        CliCommands::SetRs485 { index } => set_protocol(bms, ProtocolBus::Rs485, *index).await?,
        CliCommands::Monitor { interval, format } => {
            let interval = interval.unwrap_or(bms.config().poll_interval);
            daemon::run(bms, interval, *format).await?
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    let app_config = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    let manager_config = app_config.manager_config(&args);
    let endpoint = app_config.endpoint(&args);
    let link = open_link(&endpoint, &app_config, &manager_config).await?;
    let bms = BmsManager::new(link, manager_config);

    let result = run_command(&bms, &args.command).await;
    if let Err(err) = bms.disconnect().await {
        warn!("Cannot close BMS link: {err}");
    }
    result
}

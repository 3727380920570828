use anyhow::{anyhow, Context, Result};
use log::info;
use serde_json::json;
use std::time::Duration;
use zetarabms_lib::{BmsManager, BmsReading, ConnectionState};

use crate::commandline::MonitorFormat;

pub fn print_reading(reading: &BmsReading) {
    println!("Voltage: {:.2} V", reading.voltage);
    println!("Current: {:.1} A", reading.current);
    println!("Power: {:.1} W", reading.power());
    println!("SOC: {} %", reading.soc);
    println!("SOH: {} %", reading.soh);
    println!("Status: {}", reading.status);
    println!(
        "Cell voltages ({} cells): {:?}",
        reading.cell_count, reading.cell_voltages
    );
    if let (Some(min), Some(max)) = (reading.min_cell_voltage(), reading.max_cell_voltage()) {
        println!("Cell range: {min:.3} V - {max:.3} V (delta {:.3} V)", max - min);
    }
    println!("Cell temperatures: {:?} °C", reading.cell_temperatures);
    println!("PCB temperature: {} °C", reading.pcb_temperature);
    println!("Environment temperature: {} °C", reading.env_temperature);
}

fn output(reading: &BmsReading, format: MonitorFormat) -> Result<()> {
    match format {
        MonitorFormat::Console => {
            println!("--- Reading at {} ---", chrono::Local::now().to_rfc3339());
            print_reading(reading);
            println!("--------------------------");
        }
        MonitorFormat::Json => {
            let line = json!({
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "reading": reading,
            });
            println!(
                "{}",
                serde_json::to_string(&line).with_context(|| "Cannot serialize reading")?
            );
        }
    }
    Ok(())
}

pub async fn run(bms: &BmsManager, interval: Duration, format: MonitorFormat) -> Result<()> {
    let mut readings = bms.subscribe_readings();
    let mut connection = bms.subscribe_connection();
    bms.start_polling(interval);
    info!("Monitoring every {interval:?}, press Ctrl-C to stop");

    let result = loop {
        tokio::select! {
            changed = readings.changed() => {
                if let Err(err) = changed.with_context(|| "Reading channel closed") {
                    break Err(err);
                }
                let reading = readings.borrow_and_update().clone();
                if let Some(reading) = reading {
                    if let Err(err) = output(&reading, format) {
                        break Err(err);
                    }
                }
            }
            changed = connection.changed() => {
                if let Err(err) = changed.with_context(|| "Connection channel closed") {
                    break Err(err);
                }
                let state = *connection.borrow_and_update();
                if state != ConnectionState::Connected {
                    break Err(anyhow!("BMS link lost ({state:?})"));
                }
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal.with_context(|| "Cannot listen for Ctrl-C") {
                    break Err(err);
                }
                info!("Stopping monitor");
                break Ok(());
            }
        }
    };
    bms.stop_polling();
    result
}

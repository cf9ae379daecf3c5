//! Modbus station demo.
//!
//! Starts a Modbus/TCP slave on a local port with seeded test data, prints
//! the packet trace, and reports request statistics until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use log::info;
use tokio::signal;
use tokio::time::interval;

use modbus_station::{
    CallbackLogger, ChangeEvent, ModbusServer, ModbusStation, ModbusValue,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    println!("🚀 Modbus Station Demo");
    println!("======================");

    let mut station = ModbusStation::new();
    station.set_trace_logger(CallbackLogger::console());
    station.initialize_data();

    // Seed a few recognizable values
    let store = station.data_store();
    for i in 0..10u16 {
        store.initialize_holding_registers(i, 1, 0x1000 + i);
        store.initialize_input_registers(i, 1, 0x2000 + i);
        store.initialize_coils(i, 1, i % 2 == 0);
    }
    for (i, word) in ModbusValue::F32(21.5).to_registers().into_iter().enumerate() {
        store.initialize_holding_registers(40 + i as u16, 1, word);
    }

    station.subscribe_changes(Arc::new(|event: &ChangeEvent| match event {
        ChangeEvent::Point { region, address, value } => {
            info!("changed: {} @ {} = 0x{:04X}", region.as_str(), address, value)
        }
        ChangeEvent::Batch { region, start, values } => {
            info!("changed: {} @ {} x{}", region.as_str(), start, values.len())
        }
    }));

    station.start_tcp(5020).await?;
    info!("📍 listening on port 5020, press Ctrl-C to stop");

    let mut ticker = interval(Duration::from_secs(10));
    ticker.tick().await; // first tick completes immediately
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let stats = station.stats();
                info!(
                    "requests={}, last fc=0x{:02X}, hr cells={}",
                    stats.request_count,
                    stats.last_function_code,
                    stats.data_store.holding_registers
                );
            }
        }
    }

    station.stop().await?;
    info!("bye");
    Ok(())
}

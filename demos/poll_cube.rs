use cubelink::{DeviceStatusListener, GatewayClient, GatewayConfig, HubInfo, ListenerResult};
use std::sync::Arc;
use std::time::Duration;

struct Printer;

impl DeviceStatusListener for Printer {
    fn on_device_changed(&self, hub_id: &str, device: &cubelink::Device) -> ListenerResult {
        let changed: Vec<String> = device
            .attributes()
            .iter()
            .filter(|(_, a)| a.updated)
            .map(|(name, a)| format!("{}={}", name, a.value))
            .collect();
        if !changed.is_empty() {
            println!("[{}] {} ({}): {}", hub_id, device.serial(), device.name(), changed.join(", "));
        }
        Ok(())
    }

    fn on_device_discovered(&self, hub: &HubInfo, device: &cubelink::Device) -> ListenerResult {
        println!(
            "[{}] discovered {} {} in {:?}",
            hub.hub_id,
            device.device_type(),
            device.serial(),
            device.room_name()
        );
        Ok(())
    }

    fn on_connection_lost(&self, hub: &HubInfo) {
        println!("[{}] connection to {} lost", hub.hub_id, hub.address);
    }

    fn on_connection(&self, hub: &HubInfo) {
        println!("[{}] connected to {}", hub.hub_id, hub.address);
    }
}

#[tokio::main]
async fn main() -> cubelink::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match std::env::args().nth(1) {
        Some(arg) if arg.ends_with(".json") => GatewayConfig::from_json_file(arg).await?,
        Some(host) => GatewayConfig::builder()
            .host(host)
            .refresh_interval_secs(10)
            .build()?,
        None => {
            eprintln!("usage: poll_cube <host | config.json>");
            return Ok(());
        }
    };

    let client = GatewayClient::new(config)?;
    client.register_listener(Arc::new(Printer));
    client.start().await;

    tokio::time::sleep(Duration::from_secs(120)).await;

    let cube = client.cube_info();
    println!(
        "cube {} firmware {} duty cycle {}% free slots {}",
        cube.serial, cube.firmware, cube.duty_cycle, cube.free_memory_slots
    );
    client.stop().await;
    Ok(())
}

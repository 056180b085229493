// Drives a simulated heart rate monitor through the scheduler: scan,
// connect, discover, subscribe and then decode measurement notifications.

use std::str::FromStr;
use std::time::Duration;

use bluequeue::fake::{FakeController, FakeTransport};
use bluequeue::operation::ValueHandle;
use bluequeue::transport::{Capability, CapabilityProperties};
use bluequeue::{Event, PeerId, PeerState, SessionConfig};
use futures::StreamExt;
use uuid::Uuid;

const HEART_RATE_MEASUREMENT: ValueHandle = ValueHandle(0x2A37);

fn print_measurement(data: &[u8]) {
    if data.len() < 2 {
        println!("HR: short notification {:?}", data);
        return;
    }
    let u16_format = data[0] & 0x1 == 0x1;
    let hr = if u16_format && data.len() >= 3 {
        u16::from_le_bytes([data[1], data[2]])
    } else {
        data[1] as u16
    };
    let rr_start = if u16_format { 3 } else { 2 } + if data[0] & 0x8 == 0x8 { 2 } else { 0 };
    println!("> Heart Rate: {}", hr);
    if data[0] & 0x10 == 0x10 && data.len() > rr_start {
        for (i, rr) in data[rr_start..].chunks_exact(2).enumerate() {
            let rr_seconds = u16::from_le_bytes([rr[0], rr[1]]) as f32 / 1024.0f32;
            println!("> RR[{}] = {}", i, rr_seconds);
        }
    }
}

fn simulate(controller: FakeController, hrm: PeerId) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        controller.discover(&hrm);

        let mut beat = 60u8;
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            controller.notify(&hrm, HEART_RATE_MEASUREMENT, vec![0x10, beat, 0x00, 0x04]);
            beat = if beat >= 90 { 60 } else { beat + 3 };
        }
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();

    let hrm = PeerId::from_str("C0:FF:EE:00:18:0D")?;
    let mut controller = None;
    let session = SessionConfig::new().start(|bus| {
                                          let (transport, fake) =
                                              FakeTransport::with_event_bus(bus);
                                          controller = Some(fake);
                                          Ok(transport)
                                      })
                                      .await?;
    let controller = controller.ok_or("Fake transport wasn't created")?;
    controller.set_capabilities(&hrm, vec![Capability::new(Uuid::new_v4(),
                                                           HEART_RATE_MEASUREMENT,
                                                           CapabilityProperties::NOTIFY)]);

    let mut events = Box::pin(session.events()?);
    session.start_scanning().await?;
    simulate(controller, hrm.clone());

    while let Some(event) = events.next().await {
        if let Event::PeerDiscovered { peer, .. } = event {
            println!("Discovered peer: {}", peer);
            if peer == hrm {
                break;
            }
        }
    }
    session.stop_scanning().await?;

    let monitor = session.peer(hrm);
    let mut events = Box::pin(monitor.events()?);
    println!("Connecting to heart rate monitor {} ...", monitor.id());
    monitor.connect().await?;
    while !monitor.state().contains(PeerState::INITIALIZED) {
        events.next().await;
    }
    println!("Capabilities: {:?}", monitor.capabilities());
    monitor.set_notify_state(HEART_RATE_MEASUREMENT, true).await?;

    let mut received = 0;
    while let Some(event) = events.next().await {
        match event {
            Event::ValueChanged { handle, value, .. } if handle == HEART_RATE_MEASUREMENT => {
                print_measurement(&value);
                received += 1;
                if received == 5 {
                    break;
                }
            }
            Event::PeerGaveUp { reason, .. } => {
                println!("Gave up on heart rate monitor: {:?}", reason);
                break;
            }
            _ => {}
        }
    }

    monitor.disconnect().await?;
    Ok(())
}

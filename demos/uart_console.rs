//! Interactive UART console
//!
//! Connects to a peripheral exposing the Nordic UART service and relays
//! lines typed on stdin to it. Typing `Connect` or `Disconnect` on a line of
//! its own drives the link instead of being sent.
//!
//! Run with: cargo run --example uart_console -- --name "BBC micro:bit [zogav]"

use ble_uart_bridge::{BtleplugStack, LinkConfig, LinkEvent, Result, UartLink};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ble_uart_bridge=info".parse().unwrap()),
        )
        .init();

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();
    let device_name = args
        .iter()
        .position(|arg| arg == "--name")
        .and_then(|i| args.get(i + 1))
        .cloned()
        .unwrap_or_default();

    println!("UART Console");
    println!("============\n");
    println!("Target device: {:?}", device_name);
    println!("Type Connect, Disconnect, or any text to send. Ctrl-D quits.\n");

    let stack = Arc::new(BtleplugStack::new().await?);
    let link = UartLink::new(stack, LinkConfig::new(device_name)).await?;

    let mut events = link.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                LinkEvent::Data(data) => {
                    println!("<< {}", String::from_utf8_lossy(&data).trim_end());
                }
                LinkEvent::Status(status) => println!("-- {}", status),
                LinkEvent::Error { kind, message } => println!("!! {:?}: {}", kind, message),
                LinkEvent::Warning(message) => println!("?? {}", message),
            }
        }
    });

    link.connect()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.is_empty() {
            continue;
        }
        link.submit(line)?;
    }

    link.shutdown().await?;
    printer.abort();
    println!("\nDone!");

    Ok(())
}

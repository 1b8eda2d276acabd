//! Simple iperf3 server example.
//!
//! This example demonstrates how to run a basic iperf3 server that accepts
//! connections from iperf3 clients.
//!
//! Run with:
//! ```bash
//! cargo run --example simple_server
//! ```
//!
//! Then test with:
//! ```bash
//! iperf3 -c 127.0.0.1 -t 5
//! ```

use iperf3_server::{Iperf3Config, Iperf3Server};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Iperf3Config {
        enabled: true,
        host: "0.0.0.0".to_string(),
        port: 5201,
        max_duration_secs: 3600,
        max_bandwidth: 0,
        ..Iperf3Config::default()
    };

    let server = Arc::new(Iperf3Server::new(config));

    println!("iperf3 server starting on 0.0.0.0:5201");
    println!("Press Ctrl+C to stop");
    println!();
    println!("Test with: iperf3 -c <server-ip> -t 5");
    println!();

    let server_for_signal = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        println!("\nShutting down...");
        server_for_signal.shutdown();
    });

    if let Err(e) = server.run().await {
        eprintln!("Server error: {}", e);
        return Err(e.into());
    }

    Ok(())
}

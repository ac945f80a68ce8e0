/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
This crate provides an MQTT 3.1.1 stack: a wire codec, a client with automatic keep alive
and reconnection support, and a broker-side per-connection engine with a pluggable
routing/storage backend.

MQTT is a publish/subscribe protocol commonly used in IoT use cases.  This crate speaks
MQTT 3.1.1 only; MQTT5 features (properties, shared subscriptions, reason codes) are out
of scope.

# Usage

To use this crate, you'll first need to add it to your project's Cargo.toml:

```toml
[dependencies]
basalt-mqtt = "0.1"
```

The crate is built on [`tokio`](https://crates.io/crates/tokio); if your project does not
include it yet, you will need to add it too.

# Example: a reconnecting client

The [`service::Service`] supervisor keeps a client connected in the background and queues
commands across outages:

```no_run
use basalt_mqtt::client::ConnectOptions;
use basalt_mqtt::mqtt::QualityOfService;
use basalt_mqtt::service::Service;

#[tokio::main]
async fn main() {
    let service = Service::new();
    service.set_message_callback(std::sync::Arc::new(|topic, payload| {
        println!("{}: {} bytes", topic, payload.len());
    }));

    service.start("tcp://127.0.0.1:1883", ConnectOptions::builder()
        .with_client_id("example")
        .build());

    let suback = service.subscribe("sensors/#", QualityOfService::AtLeastOnce).await;
    let _granted = suback.wait().await;

    // <do stuff>

    service.stop().await;
}
```

# Example: a broker

A broker is a [`broker::Backend`] implementation behind a TCP listener.  The bundled
[`backend::MemoryBackend`] provides routing, retained messages and offline queues in
process:

```no_run
use basalt_mqtt::backend::MemoryBackend;
use basalt_mqtt::broker::Broker;
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind("127.0.0.1:1883").await?;
    let broker = Broker::new(Arc::new(MemoryBackend::new()));
    broker.serve(listener).await?;
    Ok(())
}
```
*/

#![warn(missing_docs)]

pub mod backend;
pub mod broker;
pub mod client;
mod decode;
mod encode;
pub mod error;
pub mod future;
pub mod mqtt;
pub mod service;
pub mod session;
pub mod topic;
pub mod transport;

/* Re-export the types most users touch at the root level */
pub use error::{MqttError, MqttResult};
pub use mqtt::{ConnectReturnCode, Message, MqttPacket, PacketType, QualityOfService, Subscription};
pub use session::{Direction, MemorySession, Session};

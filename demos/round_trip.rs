//! Publish a JSON order and consume it on the in-process broker.
//!
//! Run with `RUST_LOG=info cargo run --example round_trip` to see the
//! lifecycle events. Enable `transport_lapin` and replace the builder's
//! transport type with `"lapin"` to run the same flow against RabbitMQ.

use futures::StreamExt;
use serde::{Deserialize, Serialize};

use mom_session::{
    //
    ExchangeSpec,
    OutboundMessage,
    QueueSpec,
    SessionBuilder,
    SubscribeRequest,
};

#[derive(Debug, Serialize, Deserialize)]
struct OrderCreated {
    id: u64,
    total_cents: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let session = SessionBuilder::new()
        .name("orders-demo")
        .transport_type("memory")
        .build()?;
    session.connect_with_default_retry().await?;

    let channel = session.open_channel().await?;
    channel
        .setup(
            &ExchangeSpec::topic("orders"),
            &QueueSpec::new("orders.created"),
            "order.created",
        )
        .await?;

    let mut subscription = channel
        .subscribe(&SubscribeRequest::new("orders.created", "orders", "order.created").qos(10))
        .await?;

    let order = OrderCreated {
        id: 42,
        total_cents: 1999,
    };
    channel
        .publish(
            &OutboundMessage::new("orders", "order.created", serde_json::to_vec(&order)?)
                .with_content_type("application/json")
                .with_new_correlation_id(),
        )
        .await?;

    if let Some(delivery) = subscription.next().await {
        let received: OrderCreated = serde_json::from_slice(&delivery.payload)?;
        println!(
            "received {received:?} (correlation id {:?})",
            delivery.correlation_id
        );
        delivery.ack().await?;
    }

    subscription.cancel().await?;
    session.close().await;
    Ok(())
}

//! Park rejected jobs in a dead-letter queue.
//!
//! The `jobs` queue is declared with a dead-letter exchange. A worker
//! rejects one job without requeue; the broker re-routes it to the parked
//! queue, where a second subscription picks it up.

use mom_session::{
    //
    ExchangeSpec,
    MemoryBroker,
    OutboundMessage,
    QueueSpec,
    SessionBuilder,
    SubscribeRequest,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let broker = MemoryBroker::new();
    let session = SessionBuilder::new()
        .name("jobs-demo")
        .dialer(mom_session::create_memory_dialer_with_broker(broker.clone()))
        .build()?;
    session.connect().await?;

    let channel = session.open_channel().await?;
    channel
        .declare_exchange(&ExchangeSpec::fanout("jobs.dlx"))
        .await?;
    channel
        .setup(
            &ExchangeSpec::direct("jobs"),
            &QueueSpec::new("jobs").dead_letter_to("jobs.dlx"),
            "job",
        )
        .await?;
    channel.declare_queue(&QueueSpec::new("jobs.parked")).await?;

    let mut parked = channel
        .subscribe(&SubscribeRequest::new("jobs.parked", "jobs.dlx", ""))
        .await?;
    let mut work = channel
        .subscribe(&SubscribeRequest::new("jobs", "jobs", "job"))
        .await?;

    for body in ["resize image 1", "corrupt payload", "resize image 2"] {
        channel
            .publish(&OutboundMessage::text("jobs", "job", body))
            .await?;
    }

    for _ in 0..3 {
        let Some(job) = work.next_delivery().await else {
            break;
        };
        let body = String::from_utf8_lossy(&job.payload).into_owned();
        if body.starts_with("corrupt") {
            println!("rejecting {body:?}");
            job.reject(false).await?;
        } else {
            println!("processed {body:?}");
            job.ack().await?;
        }
    }

    if let Some(dead) = parked.next_delivery().await {
        println!(
            "parked {:?} via exchange {:?}",
            String::from_utf8_lossy(&dead.payload),
            dead.exchange
        );
        dead.ack().await?;
    }
    println!("jobs left in queue: {}", broker.queue_depth("jobs"));

    session.close().await;
    Ok(())
}

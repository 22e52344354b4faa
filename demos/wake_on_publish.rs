use std::{sync::Arc, time::Duration};

use postmaster::{
    Envelope, Message, MqService, ProcessingError, ResponseStatus, ServiceSettings,
    queue_names::QueueNames,
    service::{WakeWorker, wake_channel},
    transport::{InMemoryTransport, MessageQueueClientExt},
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Order {
    id: u32,
    quantity: u32,
}

impl Message for Order {
    const TYPE_NAME: &'static str = "Order";
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct OrderAccepted {
    id: u32,
    status: Option<ResponseStatus>,
}

impl Message for OrderAccepted {
    const TYPE_NAME: &'static str = "OrderAccepted";

    fn response_status(&self) -> Option<&ResponseStatus> {
        self.status.as_ref()
    }
}

async fn handle_order(envelope: Envelope<Order>) -> Result<Option<OrderAccepted>, ProcessingError> {
    let order = &envelope.body;
    match order.quantity {
        0 => Err(ProcessingError::non_retryable("empty order")),
        q if q > 100 => Ok(Some(OrderAccepted {
            id: order.id,
            status: Some(ResponseStatus::new("OutOfStock", "not enough items")),
        })),
        // every third order hits a flaky dependency
        _ if order.id % 3 == 0 && envelope.retry_attempts() == 0 => {
            Err(ProcessingError::retryable("inventory service timed out"))
        }
        _ => Ok(Some(OrderAccepted {
            id: order.id,
            status: None,
        })),
    }
}

#[tokio::main]
async fn main() {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    let (signal, receiver) = wake_channel(1);
    let transport = InMemoryTransport::new().with_wake_signal(signal);
    let settings = ServiceSettings::default().with_retry_count(1);
    let service = Arc::new(MqService::new(transport.clone()).with_settings(settings));
    service
        .register_handler(tower::service_fn(handle_order))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let worker = WakeWorker::spawn(Arc::clone(&service), receiver, cancel.clone());

    let cancel_signal = cancel.clone();
    let cancel_handle = tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        cancel_signal.cancel();
    });

    let mut publisher = transport.clone();
    for id in 0..20 {
        let quantity = match id {
            7 => 0,
            11 => 500,
            _ => id + 1,
        };
        publisher
            .publish_message(Envelope::new(Order { id, quantity }))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        if cancel.is_cancelled() {
            break;
        }
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();
    worker.join().await;
    cancel_handle.abort();

    let accepted = QueueNames::of::<OrderAccepted>();
    tracing::info!(
        accepted = transport.queue_len(&accepted.normal).await,
        rejected = transport.queue_len(&accepted.dlq).await,
        dead_lettered = transport.queue_len(&QueueNames::of::<Order>().dlq).await,
        "Demo finished"
    );
    println!("{}", service.stats_description().await);
}

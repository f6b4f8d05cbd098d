// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker and handler fakes shared by the unit tests.

use crate::{
    channel::{AmqpChannel, AmqpConnection, Connector, DeliveryStream, InboundDelivery},
    errors::{AmqpError, HandlerError},
    handler::{FailureCause, MessageConsumer},
    message::ConsumerMessage,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::BasicProperties;
use opentelemetry::Context;
use parking_lot::Mutex;
use std::{
    collections::{HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering},
        Arc,
    },
};
use tokio::sync::mpsc;

#[derive(Default)]
pub(crate) struct FakeBroker {
    /// Whether new connections are accepted.
    unavailable: AtomicBool,
    link_up: AtomicBool,
    pub connects: AtomicU32,
    pub fail_publish: AtomicBool,
    missing_queues: Mutex<HashSet<String>>,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
    next_id: AtomicU16,
}

impl FakeBroker {
    pub fn new() -> Arc<FakeBroker> {
        Arc::new(FakeBroker::default())
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn Connector> {
        Arc::new(FakeConnector(self.clone()))
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn set_queue_missing(&self, queue: &str, missing: bool) {
        let mut queues = self.missing_queues.lock();
        if missing {
            queues.insert(queue.to_owned());
        } else {
            queues.remove(queue);
        }
    }

    /// Simulates a network failure: the link goes down and every channel dies.
    pub fn drop_connection(&self) {
        self.link_up.store(false, Ordering::SeqCst);
        for channel in self.channels.lock().iter() {
            channel.kill();
        }
    }

    pub fn channels(&self) -> Vec<Arc<FakeChannel>> {
        self.channels.lock().clone()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    /// The most recent open channel consuming `queue`.
    pub fn consumer_channel(&self, queue: &str) -> Option<Arc<FakeChannel>> {
        self.channels
            .lock()
            .iter()
            .rev()
            .find(|c| c.is_open() && c.consumed_queue().as_deref() == Some(queue))
            .cloned()
    }
}

struct FakeConnector(Arc<FakeBroker>);

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        if self.0.unavailable.load(Ordering::SeqCst) {
            return Err(AmqpError::ConnectionError);
        }

        self.0.link_up.store(true, Ordering::SeqCst);
        Ok(Arc::new(FakeConnection(self.0.clone())))
    }
}

struct FakeConnection(Arc<FakeBroker>);

#[async_trait]
impl AmqpConnection for FakeConnection {
    fn is_connected(&self) -> bool {
        self.0.link_up.load(Ordering::SeqCst)
    }

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        if !self.is_connected() {
            return Err(AmqpError::ChannelError);
        }

        let channel = Arc::new(FakeChannel {
            id: self.0.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            open: AtomicBool::new(true),
            broker: self.0.clone(),
            qos: Mutex::new(None),
            consumed: Mutex::new(None),
            acks: Mutex::new(vec![]),
            nacks: Mutex::new(vec![]),
            published: Mutex::new(vec![]),
            closes: AtomicU32::new(0),
            cancels: AtomicU32::new(0),
            sender: Mutex::new(None),
        });
        self.0.channels.lock().push(channel.clone());
        Ok(channel)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        Ok(())
    }
}

pub(crate) struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub properties: BasicProperties,
}

pub(crate) struct FakeChannel {
    id: u16,
    open: AtomicBool,
    broker: Arc<FakeBroker>,
    pub qos: Mutex<Option<u16>>,
    /// (queue, consumer tag, no_ack)
    pub consumed: Mutex<Option<(String, String, bool)>>,
    pub acks: Mutex<Vec<u64>>,
    pub nacks: Mutex<Vec<(u64, bool)>>,
    pub published: Mutex<Vec<Published>>,
    pub closes: AtomicU32,
    pub cancels: AtomicU32,
    sender: Mutex<Option<mpsc::UnboundedSender<InboundDelivery>>>,
}

impl FakeChannel {
    pub fn kill(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.sender.lock().take();
    }

    pub fn consumed_queue(&self) -> Option<String> {
        self.consumed.lock().as_ref().map(|(queue, _, _)| queue.clone())
    }

    /// Pushes a delivery to the subscription. Returns `false` when there is
    /// no live subscription.
    pub fn deliver(&self, delivery: InboundDelivery) -> bool {
        self.sender
            .lock()
            .as_ref()
            .map(|tx| tx.send(delivery).is_ok())
            .unwrap_or(false)
    }
}

#[async_trait]
impl AmqpChannel for FakeChannel {
    fn id(&self) -> u16 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        *self.qos.lock() = Some(prefetch_count);
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, AmqpError> {
        if self.broker.missing_queues.lock().contains(queue) {
            // the broker closes the channel on NOT_FOUND
            self.kill();
            return Err(AmqpError::ConsumerSetupError(queue.to_owned()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.sender.lock() = Some(tx);
        *self.consumed.lock() = Some((queue.to_owned(), consumer_tag.to_owned(), no_ack));

        Ok(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (Ok(delivery), rx))
        })
        .boxed())
    }

    async fn basic_cancel(&self, _consumer_tag: &str) -> Result<(), AmqpError> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        self.sender.lock().take();
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        if self.broker.fail_publish.load(Ordering::SeqCst) || !self.is_open() {
            return Err(AmqpError::PublishingError);
        }

        self.published.lock().push(Published {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            payload: payload.to_vec(),
            properties,
        });
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        if self.is_open() {
            self.acks.lock().push(delivery_tag);
        }
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        if self.is_open() {
            self.nacks.lock().push((delivery_tag, requeue));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.kill();
        Ok(())
    }
}

/// A handler replaying a script of results, then succeeding.
#[derive(Default)]
pub(crate) struct ScriptedHandler {
    name: String,
    script: Mutex<VecDeque<Result<bool, HandlerError>>>,
    pub seen_retry_counts: Mutex<Vec<u32>>,
    pub starts: AtomicU32,
    pub stops: AtomicU32,
    pub failures: AtomicU32,
    pub fail_on_start: AtomicBool,
    pub fail_on_failure_callback: AtomicBool,
}

impl ScriptedHandler {
    pub fn new(name: &str, script: Vec<Result<bool, HandlerError>>) -> Arc<ScriptedHandler> {
        Arc::new(ScriptedHandler {
            name: name.to_owned(),
            script: Mutex::new(script.into()),
            ..Default::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.seen_retry_counts.lock().len()
    }
}

#[async_trait]
impl MessageConsumer for ScriptedHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<bool, HandlerError> {
        self.seen_retry_counts.lock().push(msg.retry_count);
        self.script.lock().pop_front().unwrap_or(Ok(true))
    }

    async fn on_start(&self) -> Result<(), HandlerError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_on_start.load(Ordering::SeqCst) {
            return Err(HandlerError::LifecycleError("start refused".to_owned()));
        }
        Ok(())
    }

    async fn on_stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_failure(
        &self,
        _msg: &ConsumerMessage,
        _cause: &FailureCause,
    ) -> Result<(), HandlerError> {
        self.failures.fetch_add(1, Ordering::SeqCst);
        if self.fail_on_failure_callback.load(Ordering::SeqCst) {
            return Err(HandlerError::ProcessingError("callback broke".to_owned()));
        }
        Ok(())
    }
}

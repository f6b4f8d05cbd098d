// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! This module applies the acknowledgment policy to every delivery received
//! by a consumer. It:
//! 1. Resolves the message retry count from headers and local tracking
//! 2. Creates a trace span for distributed tracing
//! 3. Invokes the consumer's handler
//! 4. Acknowledges successful messages
//! 5. Requeues failures after the retry delay, or rejects them without
//!    requeue once the retry budget is spent
//!
//! In automatic-ack mode the broker already considers the delivery settled,
//! so failures are retried in place by re-invoking the handler.

use crate::{
    channel::{AmqpChannel, InboundDelivery},
    configs::ConsumerDefinition,
    errors::AmqpError,
    handler::{FailureCause, MessageConsumer},
    message::{extract_retry_count, message_key, ConsumerMessage},
    otel,
    stats::StatsCollector,
};
use opentelemetry::{
    global::{self, BoxedSpan},
    trace::{Span, Status},
    Context,
};
use parking_lot::Mutex;
use std::{borrow::Cow, collections::HashMap, sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Upper bound on messages whose failure count is tracked in memory.
const MAX_TRACKED_MESSAGES: usize = 10_000;

/// Terminal outcome of dispatching one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handler succeeded and the delivery was acknowledged.
    Acked,
    /// Handler failed; the delivery was nacked with requeue after the retry delay.
    Requeued { retry_count: u32 },
    /// Retries exhausted; the delivery was nacked without requeue.
    Rejected { total_failures: u32 },
    /// Auto-ack mode: the handler eventually succeeded.
    AutoAcked { attempts: u32 },
    /// Auto-ack mode: retries exhausted, the message is gone.
    Dropped { total_failures: u32 },
}

pub struct MessageDispatcher {
    def: ConsumerDefinition,
    handler: Arc<dyn MessageConsumer>,
    channel: Arc<dyn AmqpChannel>,
    stats: Arc<StatsCollector>,
    /// Failed attempts per message key, for requeued redeliveries whose
    /// headers the broker does not rewrite. Only read for redelivered messages.
    failures: Arc<Mutex<HashMap<String, u32>>>,
}

impl MessageDispatcher {
    pub fn new(
        def: ConsumerDefinition,
        handler: Arc<dyn MessageConsumer>,
        channel: Arc<dyn AmqpChannel>,
        stats: Arc<StatsCollector>,
    ) -> Arc<MessageDispatcher> {
        Self::with_tracker(def, handler, channel, stats, Arc::default())
    }

    /// Builds a dispatcher sharing failure tracking with a previous one, so
    /// retry counts survive a channel rebuild.
    pub(crate) fn with_tracker(
        def: ConsumerDefinition,
        handler: Arc<dyn MessageConsumer>,
        channel: Arc<dyn AmqpChannel>,
        stats: Arc<StatsCollector>,
        failures: Arc<Mutex<HashMap<String, u32>>>,
    ) -> Arc<MessageDispatcher> {
        Arc::new(MessageDispatcher {
            def,
            handler,
            channel,
            stats,
            failures,
        })
    }

    pub fn definition(&self) -> &ConsumerDefinition {
        &self.def
    }

    /// Processes one delivery to completion, including any retry delay.
    pub async fn dispatch(&self, delivery: InboundDelivery) -> Disposition {
        let started = Instant::now();
        let key = message_key(&delivery);
        let tracked = if delivery.redelivered {
            self.tracked(&key)
        } else {
            // A first delivery starts clean, even if an earlier message shared its key.
            self.forget(&key);
            0
        };
        let retry_count = extract_retry_count(&delivery.properties).max(tracked);

        let mut msg =
            ConsumerMessage::from_delivery(&self.def.name, &self.def.queue_name, &delivery, retry_count);

        let tracer = global::tracer("amqp consumer");
        let span_name = if msg.msg_type.is_empty() {
            self.def.queue_name.clone()
        } else {
            msg.msg_type.clone()
        };
        let (ctx, mut span) = otel::new_span(&delivery.properties, &tracer, &span_name);

        debug!(
            consumer = %self.def.name,
            delivery_tag = delivery.delivery_tag,
            retry_count,
            "received: {} - exchange: {}",
            msg.msg_type,
            delivery.exchange,
        );

        let disposition = if self.def.auto_ack {
            self.dispatch_auto_ack(&ctx, &mut span, &mut msg).await
        } else {
            self.dispatch_manual_ack(&ctx, &mut span, &msg, &key).await
        };

        debug!(
            consumer = %self.def.name,
            delivery_tag = delivery.delivery_tag,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ?disposition,
            "message dispatched"
        );
        span.end();

        disposition
    }

    async fn dispatch_manual_ack(
        &self,
        ctx: &Context,
        span: &mut BoxedSpan,
        msg: &ConsumerMessage,
        key: &str,
    ) -> Disposition {
        let cause = match self.invoke(ctx, msg).await {
            Ok(()) => {
                self.forget(key);
                self.stats.record_success(&self.def.name);
                debug!("message successfully processed");

                if let Err(err) = self.channel.basic_ack(msg.delivery_tag).await {
                    record_span_error(span, &err, "error to ack msg");
                } else {
                    span.set_status(Status::Ok);
                }
                return Disposition::Acked;
            }
            Err(cause) => cause,
        };

        self.stats.record_failure(&self.def.name);
        self.notify_failure(msg, &cause).await;

        if msg.retry_count < self.def.max_retries {
            let next = msg.retry_count + 1;
            self.track(key, next);
            self.stats.record_retry(&self.def.name);

            warn!(
                consumer = %self.def.name,
                retry_count = next,
                max_retries = self.def.max_retries,
                reason = %cause,
                "error whiling handling msg, requeuing for latter"
            );

            tokio::time::sleep(self.def.retry_delay()).await;
            if let Err(err) = self.channel.basic_nack(msg.delivery_tag, true).await {
                record_span_error(span, &err, "error to requeuing msg");
            } else {
                span.set_status(Status::Error {
                    description: Cow::from("msg requeued"),
                });
            }
            return Disposition::Requeued { retry_count: next };
        }

        let total_failures = msg.retry_count + 1;
        self.forget(key);
        self.stats.record_retry_exhausted(&self.def.name);

        error!(
            consumer = %self.def.name,
            delivery_tag = msg.delivery_tag,
            reason = %cause,
            total_failures,
            "too many attempts, rejecting msg without requeue"
        );

        if let Err(err) = self.channel.basic_nack(msg.delivery_tag, false).await {
            record_span_error(span, &err, "error to nack msg");
        } else {
            span.set_status(Status::Error {
                description: Cow::from("retries exhausted"),
            });
        }
        Disposition::Rejected { total_failures }
    }

    async fn dispatch_auto_ack(
        &self,
        ctx: &Context,
        span: &mut BoxedSpan,
        msg: &mut ConsumerMessage,
    ) -> Disposition {
        let mut attempt: u32 = 1;

        loop {
            let cause = match self.invoke(ctx, msg).await {
                Ok(()) => {
                    self.stats.record_success(&self.def.name);
                    span.set_status(Status::Ok);
                    return Disposition::AutoAcked { attempts: attempt };
                }
                Err(cause) => cause,
            };

            self.stats.record_failure(&self.def.name);
            self.notify_failure(msg, &cause).await;

            if msg.retry_count >= self.def.max_retries {
                let total_failures = msg.retry_count + 1;
                self.stats.record_retry_exhausted(&self.def.name);
                error!(
                    consumer = %self.def.name,
                    delivery_tag = msg.delivery_tag,
                    reason = %cause,
                    total_failures,
                    "too many attempts, message dropped (already acknowledged)"
                );
                span.set_status(Status::Error {
                    description: Cow::from("retries exhausted"),
                });
                return Disposition::Dropped { total_failures };
            }

            self.stats.record_retry(&self.def.name);
            let delay = auto_ack_retry_delay(&self.def, attempt);
            warn!(
                consumer = %self.def.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                reason = %cause,
                "error whiling handling msg, retrying in place"
            );

            tokio::time::sleep(delay).await;
            msg.next_attempt();
            attempt += 1;
        }
    }

    async fn invoke(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), FailureCause> {
        match self.handler.handle(ctx, msg).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(FailureCause::Rejected),
            Err(err) => Err(FailureCause::Error(err)),
        }
    }

    /// Runs the handler's failure callback; its own errors are only logged.
    async fn notify_failure(&self, msg: &ConsumerMessage, cause: &FailureCause) {
        if let Err(err) = self.handler.on_failure(msg, cause).await {
            error!(
                consumer = %self.def.name,
                error = err.to_string(),
                "failure callback errored"
            );
        }
    }

    fn tracked(&self, key: &str) -> u32 {
        self.failures.lock().get(key).copied().unwrap_or_default()
    }

    fn track(&self, key: &str, count: u32) {
        let mut failures = self.failures.lock();
        if failures.len() >= MAX_TRACKED_MESSAGES && !failures.contains_key(key) {
            warn!(
                consumer = %self.def.name,
                tracked = failures.len(),
                "failure tracking is full, clearing"
            );
            failures.clear();
        }
        failures.insert(key.to_owned(), count);
    }

    fn forget(&self, key: &str) {
        self.failures.lock().remove(key);
    }
}

fn record_span_error(span: &mut BoxedSpan, err: &AmqpError, msg: &'static str) {
    error!(error = err.to_string(), "{}", msg);
    span.record_error(err);
    span.set_status(Status::Error {
        description: Cow::from(msg),
    });
}

/// Retry delay used in auto-ack mode before the given (1-based) attempt is retried.
pub fn auto_ack_retry_delay(def: &ConsumerDefinition, attempt: u32) -> Duration {
    def.retry_delay().saturating_mul(attempt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::MockAmqpChannel,
        errors::HandlerError,
        message::AMQP_HEADERS_RETRY_COUNT,
        test_support::ScriptedHandler,
    };
    use lapin::{
        types::{AMQPValue, FieldTable, ShortString},
        BasicProperties,
    };
    use mockall::{predicate::eq, Sequence};
    use std::sync::atomic::Ordering;

    fn delivery(tag: u64, message_id: &str) -> InboundDelivery {
        InboundDelivery {
            delivery_tag: tag,
            exchange: "orders".to_owned(),
            routing_key: "created".to_owned(),
            data: b"{}".to_vec(),
            properties: BasicProperties::default()
                .with_message_id(ShortString::from(message_id)),
            ..Default::default()
        }
    }

    fn redelivery(tag: u64, message_id: &str) -> InboundDelivery {
        InboundDelivery {
            redelivered: true,
            ..delivery(tag, message_id)
        }
    }

    fn stats_for(name: &str) -> Arc<StatsCollector> {
        let stats = StatsCollector::new();
        stats.register(name);
        stats
    }

    #[tokio::test(start_paused = true)]
    async fn success_is_acked() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_basic_ack().with(eq(1)).times(1).returning(|_| Ok(()));
        channel.expect_basic_nack().never();

        let handler = ScriptedHandler::new("orders", vec![Ok(true)]);
        let stats = stats_for("orders");
        let dispatcher = MessageDispatcher::new(
            ConsumerDefinition::new("orders", "orders-q"),
            handler.clone(),
            Arc::new(channel),
            stats.clone(),
        );

        assert_eq!(dispatcher.dispatch(delivery(1, "m-1")).await, Disposition::Acked);
        assert_eq!(stats.get("orders").unwrap().success, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retries_rejects_immediately() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_basic_ack().never();
        channel
            .expect_basic_nack()
            .with(eq(1), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));

        let handler = ScriptedHandler::new("orders", vec![Ok(false)]);
        let stats = stats_for("orders");
        let dispatcher = MessageDispatcher::new(
            ConsumerDefinition::new("orders", "orders-q").max_retries(0),
            handler.clone(),
            Arc::new(channel),
            stats.clone(),
        );

        let started = Instant::now();
        assert_eq!(
            dispatcher.dispatch(delivery(1, "m-1")).await,
            Disposition::Rejected { total_failures: 1 }
        );
        assert_eq!(started.elapsed(), Duration::ZERO);

        let snapshot = stats.get("orders").unwrap();
        assert_eq!(snapshot.retry, 0);
        assert_eq!(snapshot.failure, 1);
        assert_eq!(snapshot.retry_exhausted, 1);
        assert_eq!(handler.failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_requeue_after_delay_then_ack() {
        let mut seq = Sequence::new();
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_basic_nack()
            .with(eq(1), eq(true))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        channel
            .expect_basic_nack()
            .with(eq(2), eq(true))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        channel
            .expect_basic_ack()
            .with(eq(3))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let handler = ScriptedHandler::new(
            "orders",
            vec![
                Ok(false),
                Err(HandlerError::ProcessingError("db down".to_owned())),
                Ok(true),
            ],
        );
        let stats = stats_for("orders");
        let dispatcher = MessageDispatcher::new(
            ConsumerDefinition::new("orders", "orders-q")
                .max_retries(2)
                .retry_delay_ms(1_000),
            handler.clone(),
            Arc::new(channel),
            stats.clone(),
        );

        let started = Instant::now();
        assert_eq!(
            dispatcher.dispatch(delivery(1, "m-1")).await,
            Disposition::Requeued { retry_count: 1 }
        );
        assert!(started.elapsed() >= Duration::from_secs(1));

        assert_eq!(
            dispatcher.dispatch(redelivery(2, "m-1")).await,
            Disposition::Requeued { retry_count: 2 }
        );
        assert_eq!(dispatcher.dispatch(redelivery(3, "m-1")).await, Disposition::Acked);

        assert_eq!(*handler.seen_retry_counts.lock(), vec![0, 1, 2]);
        let snapshot = stats.get("orders").unwrap();
        assert_eq!(snapshot.retry, 2);
        assert_eq!(snapshot.success, 1);
        assert_eq!(snapshot.retry_exhausted, 0);
        assert_eq!(dispatcher.tracked("m-1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_message_is_rejected_exactly_once() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_basic_nack()
            .with(mockall::predicate::always(), eq(true))
            .times(3)
            .returning(|_, _| Ok(()));
        channel
            .expect_basic_nack()
            .with(eq(4), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));
        channel.expect_basic_ack().never();

        let handler = ScriptedHandler::new("orders", vec![Ok(false); 4]);
        let stats = stats_for("orders");
        let dispatcher = MessageDispatcher::new(
            ConsumerDefinition::new("orders", "orders-q").max_retries(3),
            handler.clone(),
            Arc::new(channel),
            stats.clone(),
        );

        assert!(matches!(
            dispatcher.dispatch(delivery(1, "m-1")).await,
            Disposition::Requeued { .. }
        ));
        for tag in 2..=3 {
            assert!(matches!(
                dispatcher.dispatch(redelivery(tag, "m-1")).await,
                Disposition::Requeued { .. }
            ));
        }
        assert_eq!(
            dispatcher.dispatch(redelivery(4, "m-1")).await,
            Disposition::Rejected { total_failures: 4 }
        );
        assert_eq!(*handler.seen_retry_counts.lock(), vec![0, 1, 2, 3]);
        assert_eq!(stats.get("orders").unwrap().retry_exhausted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_deliveries_with_same_body_start_at_zero() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_basic_nack()
            .with(mockall::predicate::always(), eq(true))
            .times(2)
            .returning(|_, _| Ok(()));
        channel.expect_basic_ack().never();

        let handler = ScriptedHandler::new("orders", vec![Ok(false); 2]);
        let dispatcher = MessageDispatcher::new(
            ConsumerDefinition::new("orders", "orders-q").max_retries(1),
            handler.clone(),
            Arc::new(channel),
            stats_for("orders"),
        );

        let anonymous = |tag| InboundDelivery {
            delivery_tag: tag,
            exchange: "orders".to_owned(),
            routing_key: "created".to_owned(),
            data: b"{\"id\":1}".to_vec(),
            ..Default::default()
        };
        assert_eq!(
            dispatcher.dispatch(anonymous(1)).await,
            Disposition::Requeued { retry_count: 1 }
        );
        assert_eq!(
            dispatcher.dispatch(anonymous(2)).await,
            Disposition::Requeued { retry_count: 1 }
        );
        assert_eq!(*handler.seen_retry_counts.lock(), vec![0, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_count_header_is_honoured() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_basic_nack()
            .with(eq(7), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));

        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from(AMQP_HEADERS_RETRY_COUNT),
            AMQPValue::LongInt(3),
        );
        let mut incoming = delivery(7, "m-9");
        incoming.properties = incoming.properties.with_headers(headers);

        let handler = ScriptedHandler::new("orders", vec![Ok(false)]);
        let dispatcher = MessageDispatcher::new(
            ConsumerDefinition::new("orders", "orders-q").max_retries(3),
            handler.clone(),
            Arc::new(channel),
            stats_for("orders"),
        );

        assert_eq!(
            dispatcher.dispatch(incoming).await,
            Disposition::Rejected { total_failures: 4 }
        );
        assert_eq!(*handler.seen_retry_counts.lock(), vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_failure_callback_does_not_block_decision() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_basic_nack()
            .with(eq(1), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));

        let handler = ScriptedHandler::new("orders", vec![Ok(false)]);
        handler.fail_on_failure_callback.store(true, Ordering::SeqCst);
        let dispatcher = MessageDispatcher::new(
            ConsumerDefinition::new("orders", "orders-q").max_retries(0),
            handler.clone(),
            Arc::new(channel),
            stats_for("orders"),
        );

        assert_eq!(
            dispatcher.dispatch(delivery(1, "m-1")).await,
            Disposition::Rejected { total_failures: 1 }
        );
        assert_eq!(handler.failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ack_errors_are_absorbed() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_basic_ack()
            .times(1)
            .returning(|_| Err(AmqpError::AckMessageError));

        let dispatcher = MessageDispatcher::new(
            ConsumerDefinition::new("orders", "orders-q"),
            ScriptedHandler::new("orders", vec![]),
            Arc::new(channel),
            stats_for("orders"),
        );

        assert_eq!(dispatcher.dispatch(delivery(1, "m-1")).await, Disposition::Acked);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_ack_retries_in_place_with_linear_delay() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_basic_ack().never();
        channel.expect_basic_nack().never();

        let handler = ScriptedHandler::new("orders", vec![Ok(false), Ok(false), Ok(true)]);
        let stats = stats_for("orders");
        let def = ConsumerDefinition::new("orders", "orders-q")
            .auto_ack()
            .max_retries(3)
            .retry_delay_ms(100);
        let dispatcher =
            MessageDispatcher::new(def.clone(), handler.clone(), Arc::new(channel), stats.clone());

        let started = Instant::now();
        assert_eq!(
            dispatcher.dispatch(delivery(1, "m-1")).await,
            Disposition::AutoAcked { attempts: 3 }
        );
        // 100ms before the 2nd attempt, 200ms before the 3rd
        let expected = auto_ack_retry_delay(&def, 1) + auto_ack_retry_delay(&def, 2);
        assert!(started.elapsed() >= expected);
        assert!(started.elapsed() < expected + Duration::from_millis(50));
        assert_eq!(*handler.seen_retry_counts.lock(), vec![0, 1, 2]);
        assert_eq!(stats.get("orders").unwrap().retry, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_ack_drops_after_budget() {
        let channel = MockAmqpChannel::new();
        let handler = ScriptedHandler::new("orders", vec![Ok(false); 3]);
        let stats = stats_for("orders");
        let dispatcher = MessageDispatcher::new(
            ConsumerDefinition::new("orders", "orders-q")
                .auto_ack()
                .max_retries(2)
                .retry_delay_ms(10),
            handler.clone(),
            Arc::new(channel),
            stats.clone(),
        );

        assert_eq!(
            dispatcher.dispatch(delivery(1, "m-1")).await,
            Disposition::Dropped { total_failures: 3 }
        );
        assert_eq!(handler.calls(), 3);
        assert_eq!(stats.get("orders").unwrap().retry_exhausted, 1);
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! Conversions between wire headers and the logical message handed to
//! business handlers, including the `x-retry-count` bookkeeping.

use crate::channel::InboundDelivery;
use lapin::{
    protocol::basic::AMQPProperties,
    types::{
        AMQPValue, FieldTable, LongInt, LongLongInt, LongString, LongUInt, ShortInt, ShortString,
    },
};
use std::{
    collections::{BTreeMap, HashMap},
    hash::{DefaultHasher, Hash, Hasher},
};

/// Header carrying the number of failed attempts for a message
pub const AMQP_HEADERS_RETRY_COUNT: &str = "x-retry-count";
/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";

/// Header values accepted by the publisher.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValues {
    ShortString(String),
    LongString(String),
    Int(i16),
    LongInt(i32),
    LongLongInt(i64),
    Uint(u16),
    LongUint(u32),
    LongLongUint(u64),
}

impl From<HeaderValues> for AMQPValue {
    fn from(value: HeaderValues) -> Self {
        match value {
            HeaderValues::ShortString(v) => AMQPValue::ShortString(ShortString::from(v)),
            HeaderValues::LongString(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValues::Int(v) => AMQPValue::ShortInt(ShortInt::from(v)),
            HeaderValues::LongInt(v) => AMQPValue::LongInt(LongInt::from(v)),
            HeaderValues::LongLongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(v)),
            HeaderValues::Uint(v) => AMQPValue::LongUInt(LongUInt::from(v)),
            HeaderValues::LongUint(v) => AMQPValue::LongUInt(LongUInt::from(v)),
            HeaderValues::LongLongUint(v) => {
                AMQPValue::LongLongInt(LongLongInt::try_from(v).unwrap_or(LongLongInt::MAX))
            }
        }
    }
}

/// Converts caller headers into an AMQP header map.
pub(crate) fn btree_map(
    headers: &HashMap<String, HeaderValues>,
    btree: &mut BTreeMap<ShortString, AMQPValue>,
) {
    for (key, value) in headers {
        btree.insert(ShortString::from(key.clone()), value.clone().into());
    }
}

/// Reads an integer out of any integral AMQP value, or a numeric string.
pub fn amqp_value_as_i64(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongLongInt(v) => Some(*v),
        AMQPValue::ShortString(v) => v.as_str().trim().parse().ok(),
        AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes())
            .ok()
            .and_then(|s| s.trim().parse().ok()),
        _ => None,
    }
}

/// Extracts the retry count of a message.
///
/// `x-retry-count` wins when present; otherwise the broker's `x-death`
/// counter is used. Negative values read as zero.
pub fn extract_retry_count(props: &AMQPProperties) -> u32 {
    let Some(headers) = props.headers() else {
        return 0;
    };

    if let Some(count) = headers
        .inner()
        .get(AMQP_HEADERS_RETRY_COUNT)
        .and_then(amqp_value_as_i64)
    {
        return clamp_count(count);
    }

    let death_count = headers
        .inner()
        .get(AMQP_HEADERS_X_DEATH)
        .and_then(|value| value.as_array())
        .and_then(|arr| arr.as_slice().first().cloned())
        .and_then(|value| value.as_field_table().cloned())
        .and_then(|table| table.inner().get(AMQP_HEADERS_COUNT).and_then(amqp_value_as_i64))
        .unwrap_or_default();

    clamp_count(death_count)
}

fn clamp_count(count: i64) -> u32 {
    u32::try_from(count.max(0)).unwrap_or(u32::MAX)
}

/// Stable identity of a message across redeliveries.
///
/// Uses the `message_id` property when the publisher set one, otherwise a
/// hash over the routing data and payload.
pub fn message_key(delivery: &InboundDelivery) -> String {
    if let Some(id) = delivery.properties.message_id() {
        if !id.as_str().is_empty() {
            return id.as_str().to_owned();
        }
    }

    let mut hasher = DefaultHasher::new();
    delivery.exchange.hash(&mut hasher);
    delivery.routing_key.hash(&mut hasher);
    delivery.data.hash(&mut hasher);
    format!("hash:{:016x}", hasher.finish())
}

/// Returns a copy of `headers` with `x-retry-count` set to `count`.
pub fn with_retry_count(headers: Option<&FieldTable>, count: u32) -> FieldTable {
    let mut table = headers.cloned().unwrap_or_default();
    table.insert(
        ShortString::from(AMQP_HEADERS_RETRY_COUNT),
        AMQPValue::LongLongInt(LongLongInt::from(count)),
    );
    table
}

/// The logical message handed to a business handler.
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub consumer: String,
    pub queue: String,
    pub msg_type: String,
    pub message_id: Option<String>,
    pub data: Vec<u8>,
    pub headers: FieldTable,
    /// Number of prior failed attempts for this logical message.
    pub retry_count: u32,
    pub delivery_tag: u64,
    pub redelivered: bool,
}

impl ConsumerMessage {
    pub(crate) fn from_delivery(
        consumer: &str,
        queue: &str,
        delivery: &InboundDelivery,
        retry_count: u32,
    ) -> Self {
        ConsumerMessage {
            consumer: consumer.to_owned(),
            queue: queue.to_owned(),
            msg_type: delivery
                .properties
                .kind()
                .as_ref()
                .map(|k| k.as_str().to_owned())
                .unwrap_or_default(),
            message_id: delivery.properties.message_id().as_ref().map(|id| id.as_str().to_owned()),
            data: delivery.data.clone(),
            headers: with_retry_count(delivery.properties.headers().as_ref(), retry_count),
            retry_count,
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
        }
    }

    /// Moves the message to the next attempt, keeping the header in sync.
    pub(crate) fn next_attempt(&mut self) {
        self.retry_count = self.retry_count.saturating_add(1);
        self.headers = with_retry_count(Some(&self.headers), self.retry_count);
    }

    pub fn header(&self, key: &str) -> Option<&AMQPValue> {
        self.headers.inner().get(key)
    }

    pub fn header_i64(&self, key: &str) -> Option<i64> {
        self.header(key).and_then(amqp_value_as_i64)
    }
}

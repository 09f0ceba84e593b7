use std::fmt;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Watermark is a monotonically non-decreasing event time (epoch millis). It asserts that no
/// record with an earlier event time will arrive after it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Watermark(i64);

impl Watermark {
    /// The final watermark of a stream, nothing (not even another watermark) follows it.
    pub const MAX: Watermark = Watermark(i64::MAX);

    pub const fn from_millis(millis: i64) -> Self {
        Watermark(millis)
    }

    pub const fn timestamp_millis(&self) -> i64 {
        self.0
    }

    pub fn is_terminal(&self) -> bool {
        *self == Watermark::MAX
    }
}

impl From<DateTime<Utc>> for Watermark {
    fn from(time: DateTime<Utc>) -> Self {
        Watermark(time.timestamp_millis())
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_terminal() {
            return write!(f, "MAX");
        }
        match DateTime::<Utc>::from_timestamp_millis(self.0) {
            Some(time) => write!(f, "{}", time.to_rfc3339()),
            None => write!(f, "{}", self.0),
        }
    }
}

/// Element emitted to the downstream operator.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamElement<T> {
    Record(T),
    Watermark(Watermark),
}

/// Downstream is the output side of the operator. Emission waits for channel capacity, so a slow
/// consumer backpressures the flush.
pub(crate) struct Downstream<T> {
    tx: mpsc::Sender<StreamElement<T>>,
}

impl<T> Downstream<T> {
    pub(crate) fn new(tx: mpsc::Sender<StreamElement<T>>) -> Self {
        Self { tx }
    }

    pub(crate) async fn emit_record(&self, record: T) -> Result<()> {
        self.tx
            .send(StreamElement::Record(record))
            .await
            .map_err(|_| Error::Downstream("downstream receiver dropped".to_string()))
    }

    pub(crate) async fn emit_watermark(&self, watermark: Watermark) -> Result<()> {
        self.tx
            .send(StreamElement::Watermark(watermark))
            .await
            .map_err(|_| Error::Downstream("downstream receiver dropped".to_string()))
    }
}

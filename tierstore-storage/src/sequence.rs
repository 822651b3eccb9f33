//! Monotonic sequences.
//!
//! A [`Sequence`] hands out `i64` values atomically, one per transaction.
//! The current value lives in the durable store under kind `sequences`,
//! keyed by the sequence name, and never passes through the cache.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tierstore_core::{
    decode, encode, IndexedFields, StorageKey, TierError, TierResult, ValidationError,
};
use tracing::debug;

use crate::durable::{DurableStore, Record, Transaction, TransactionBody};

/// Kind under which sequence values are stored.
pub const SEQUENCE_KIND: &str = "sequences";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SequenceValue {
    name: String,
    value: i64,
}

/// A named sequence of `i64` values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequence {
    /// Unique name of this sequence.
    pub name: String,
    /// Smallest value the sequence may hold.
    pub minimum: i64,
    /// Largest value the sequence may hold.
    pub maximum: i64,
    /// First value handed out.
    pub start: i64,
    /// Added to the current value to get the next one. May be negative.
    pub increment: i64,
}

impl Sequence {
    /// An ascending sequence `1, 2, 3, ...` up to `i64::MAX`.
    pub fn ascending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            minimum: 1,
            maximum: i64::MAX,
            start: 1,
            increment: 1,
        }
    }

    fn key(&self) -> TierResult<StorageKey> {
        StorageKey::new(SEQUENCE_KIND, self.name.clone())
    }

    fn exhausted(&self, value: i64) -> TierError {
        ValidationError::SequenceExhausted {
            name: self.name.clone(),
            value,
            minimum: self.minimum,
            maximum: self.maximum,
        }
        .into()
    }

    fn parse(record: &Record) -> TierResult<i64> {
        Ok(decode::<SequenceValue>(SEQUENCE_KIND, &record.payload)?
            .into_value()
            .value)
    }

    /// Advance the sequence inside `txn` and return the new value.
    ///
    /// The first call on an unset sequence returns `start`. Nothing is
    /// persisted unless the caller commits `txn`.
    ///
    /// # Errors
    ///
    /// `SequenceExhausted` if the next value would leave
    /// `[minimum, maximum]` or overflow.
    pub async fn next(&self, txn: &mut dyn Transaction) -> TierResult<i64> {
        let key = self.key()?;
        let next = match txn.get(&key).await? {
            Some(record) => {
                let current = Self::parse(&record)?;
                current
                    .checked_add(self.increment)
                    .ok_or_else(|| self.exhausted(current))?
            }
            None => self.start,
        };
        if next < self.minimum || next > self.maximum {
            return Err(self.exhausted(next));
        }

        let value = SequenceValue {
            name: self.name.clone(),
            value: next,
        };
        txn.put(
            key,
            Record::new(encode(SEQUENCE_KIND, &value)?, IndexedFields::new()),
        );
        Ok(next)
    }

    /// Advance the sequence in its own transaction.
    pub async fn next_value<D>(&self, store: &D) -> TierResult<i64>
    where
        D: DurableStore + ?Sized,
    {
        let mut body = NextValue {
            sequence: self,
            value: None,
        };
        let attempts = store.run_transaction(&mut body).await?;
        let value = body.value.ok_or_else(|| self.exhausted(self.start))?;
        debug!(sequence = %self.name, value, attempts, "Advanced sequence");
        Ok(value)
    }

    /// The current value, or `None` if the sequence has never advanced.
    pub async fn maybe_current<D>(&self, store: &D) -> TierResult<Option<i64>>
    where
        D: DurableStore + ?Sized,
    {
        match store.get(&self.key()?).await? {
            Some(record) => Ok(Some(Self::parse(&record)?)),
            None => Ok(None),
        }
    }

    /// The current value.
    ///
    /// # Errors
    ///
    /// `NotFound` if the sequence has never advanced.
    pub async fn current<D>(&self, store: &D) -> TierResult<i64>
    where
        D: DurableStore + ?Sized,
    {
        self.maybe_current(store)
            .await?
            .ok_or_else(|| TierError::not_found(SEQUENCE_KIND, self.name.clone()))
    }
}

struct NextValue<'a> {
    sequence: &'a Sequence,
    value: Option<i64>,
}

#[async_trait]
impl<'a> TransactionBody for NextValue<'a> {
    async fn run(&mut self, txn: &mut dyn Transaction) -> TierResult<()> {
        self.value = Some(self.sequence.next(txn).await?);
        Ok(())
    }
}

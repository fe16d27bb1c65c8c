//! Deterministic queue state machine.
//!
//! One instance holds one queue's contents, consumer checkouts, and credit
//! state. It is mutated only through [`QueueMachine::apply`], called by the
//! command log in log order, which makes every replica's state a pure
//! function of the log prefix it has applied. Correctness derives from the
//! log's total order; the machine itself needs no synchronization.

use std::collections::{BTreeMap, HashMap};

use crate::machine::command::{
    ApplyCtx, ApplyResult, CheckedOutEntry, CheckoutSpec, Command, CommandError, ConsumerInfo,
    ConsumerMeta, Delivered, Effect, Message, MsgId, Query, QueryResult,
};

/// A message that has been admitted to the queue.
#[derive(Debug, Clone)]
struct QueuedMessage {
    msg_id: MsgId,
    message: Message,
    /// Times the message went back to ready after a checkout.
    redeliveries: u32,
}

impl QueuedMessage {
    fn delivered(&self) -> Delivered {
        Delivered {
            msg_id: self.msg_id,
            redelivered: self.redeliveries > 0,
            message: self.message.clone(),
        }
    }
}

/// Per-sender enqueue bookkeeping: next expected sequence plus messages that
/// arrived ahead of a gap and wait for it to fill.
#[derive(Debug, Default)]
struct Enqueuer {
    next_seq: u64,
    buffered: BTreeMap<u64, Message>,
}

/// One unsettled message together with the delivery batch that carried it.
#[derive(Debug, Clone)]
struct Unsettled {
    counter: u64,
    msg: QueuedMessage,
}

/// A registered consumer subscription.
#[derive(Debug)]
struct Checkout {
    spec: CheckoutSpec,
    meta: ConsumerMeta,
    credit: u32,
    delivery_count: u64,
    unsettled: BTreeMap<MsgId, Unsettled>,
}

/// Wall-clock accounting of time spent with pending work. Telemetry only.
#[derive(Debug, Default)]
struct UsageTracker {
    started_ms: Option<u64>,
    last_ms: u64,
    busy_ms: u64,
    busy_since: Option<u64>,
}

impl UsageTracker {
    fn observe(&mut self, now_ms: u64, busy: bool) {
        if self.started_ms.is_none() {
            self.started_ms = Some(now_ms);
        }
        self.last_ms = self.last_ms.max(now_ms);
        match (self.busy_since, busy) {
            (None, true) => self.busy_since = Some(now_ms),
            (Some(since), false) => {
                self.busy_ms += now_ms.saturating_sub(since);
                self.busy_since = None;
            }
            _ => {}
        }
    }

    fn ratio(&self, now_ms: u64) -> f64 {
        let Some(started) = self.started_ms else {
            return 0.0;
        };
        let now = now_ms.max(self.last_ms);
        let total = now.saturating_sub(started);
        if total == 0 {
            return 0.0;
        }
        let busy = self.busy_ms
            + self
                .busy_since
                .map_or(0, |since| now.saturating_sub(since));
        busy as f64 / total as f64
    }
}

/// Replicated FIFO queue state.
pub struct QueueMachine {
    name: String,
    next_msg_id: MsgId,
    ready: BTreeMap<MsgId, QueuedMessage>,
    enqueuers: HashMap<String, Enqueuer>,
    consumers: HashMap<String, Checkout>,
    /// Registration order; the delivery scan walks consumers in this order.
    consumer_order: Vec<String>,
    usage: UsageTracker,
}

impl QueueMachine {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            next_msg_id: 1,
            ready: BTreeMap::new(),
            enqueuers: HashMap::new(),
            consumers: HashMap::new(),
            consumer_order: Vec::new(),
            usage: UsageTracker::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Apply one replicated command. Total over the command set: malformed
    /// commands come back as a typed rejection, never a panic, and a rejected
    /// command leaves the state untouched.
    pub fn apply(&mut self, ctx: &ApplyCtx, command: Command) -> ApplyResult {
        let mut effects = Vec::new();
        let outcome = match command {
            Command::Enqueue {
                sender,
                sequence,
                message,
            } => self.enqueue(&sender, sequence, message, &mut effects),
            Command::Checkout { tag, spec, meta } => self.checkout(tag, spec, meta, &mut effects),
            Command::Credit { tag, amount, drain } => {
                self.credit(&tag, amount, drain, &mut effects)
            }
            Command::Settle { tag, msg_ids } => self.settle(&tag, &msg_ids, &mut effects),
            Command::Return { tag, msg_ids } => self.return_unsettled(&tag, &msg_ids, &mut effects),
            Command::Discard {
                tag,
                msg_ids,
                reason,
            } => self.discard(&tag, &msg_ids, reason, &mut effects),
            Command::CancelCheckout { tag } => self.cancel_checkout(&tag, &mut effects),
        };
        self.usage.observe(ctx.now_ms, self.has_pending_work());
        ApplyResult { outcome, effects }
    }

    // -----------------------------------------------------------------------
    // Command handlers
    // -----------------------------------------------------------------------

    fn enqueue(
        &mut self,
        sender: &str,
        sequence: Option<u64>,
        message: Message,
        effects: &mut Vec<Effect>,
    ) -> Result<(), CommandError> {
        match sequence {
            None => self.admit(message),
            Some(seq) => {
                let enq = self
                    .enqueuers
                    .entry(sender.to_string())
                    .or_insert_with(|| Enqueuer {
                        next_seq: 1,
                        buffered: BTreeMap::new(),
                    });
                if seq < enq.next_seq {
                    // Exact resend of an already-applied sequence: dedupe.
                    return Ok(());
                }
                if seq > enq.next_seq {
                    // Ahead of a gap; hold until the gap fills. Never reorder.
                    enq.buffered.insert(seq, message);
                    return Ok(());
                }
                enq.next_seq += 1;
                let mut admit = vec![message];
                while let Some(next) = enq.buffered.remove(&enq.next_seq) {
                    enq.next_seq += 1;
                    admit.push(next);
                }
                for message in admit {
                    self.admit(message);
                }
            }
        }
        self.deliver(effects);
        Ok(())
    }

    fn admit(&mut self, message: Message) {
        let msg_id = self.next_msg_id;
        self.next_msg_id += 1;
        self.ready.insert(
            msg_id,
            QueuedMessage {
                msg_id,
                message,
                redeliveries: 0,
            },
        );
    }

    fn checkout(
        &mut self,
        tag: String,
        spec: CheckoutSpec,
        meta: ConsumerMeta,
        effects: &mut Vec<Effect>,
    ) -> Result<(), CommandError> {
        if let Some(existing) = self.consumers.get(&tag) {
            if existing.spec == spec && existing.meta == meta {
                // Retry of the same registration, e.g. after a resend.
                return Ok(());
            }
            return Err(CommandError::DuplicateConsumer(tag));
        }
        let credit = match spec {
            CheckoutSpec::Prefetch { count } => count,
            CheckoutSpec::Credited => 0,
        };
        self.consumers.insert(
            tag.clone(),
            Checkout {
                spec,
                meta,
                credit,
                delivery_count: 0,
                unsettled: BTreeMap::new(),
            },
        );
        self.consumer_order.push(tag);
        self.deliver(effects);
        Ok(())
    }

    fn credit(
        &mut self,
        tag: &str,
        amount: u32,
        drain: bool,
        effects: &mut Vec<Effect>,
    ) -> Result<(), CommandError> {
        let checkout = self
            .consumers
            .get_mut(tag)
            .ok_or_else(|| CommandError::UnknownConsumer(tag.to_string()))?;
        if matches!(checkout.spec, CheckoutSpec::Prefetch { .. }) {
            return Err(CommandError::NotCredited(tag.to_string()));
        }
        checkout.credit = checkout.credit.saturating_add(amount);
        self.deliver(effects);

        let available = self.ready.len() as u64;
        let checkout = self
            .consumers
            .get_mut(tag)
            .ok_or_else(|| CommandError::UnknownConsumer(tag.to_string()))?;
        if drain && checkout.credit > 0 {
            // Ready messages ran out before the credit did; the leftover is
            // unusable and must be reported as dropped.
            let credit_dropped = checkout.credit;
            checkout.credit = 0;
            effects.push(Effect::Drained {
                tag: tag.to_string(),
                credit_dropped,
            });
        } else {
            effects.push(Effect::CreditReply {
                tag: tag.to_string(),
                credit: checkout.credit,
                available,
            });
        }
        Ok(())
    }

    fn settle(
        &mut self,
        tag: &str,
        msg_ids: &[MsgId],
        effects: &mut Vec<Effect>,
    ) -> Result<(), CommandError> {
        let checkout = Self::checked_out(&mut self.consumers, tag, msg_ids)?;
        let mut settled = 0u32;
        for msg_id in msg_ids {
            if checkout.unsettled.remove(msg_id).is_some() {
                settled += 1;
            }
        }
        if let CheckoutSpec::Prefetch { count } = checkout.spec {
            // Settlement replenishes the prefetch window.
            checkout.credit = count.min(checkout.credit.saturating_add(settled));
        }
        self.deliver(effects);
        Ok(())
    }

    fn return_unsettled(
        &mut self,
        tag: &str,
        msg_ids: &[MsgId],
        effects: &mut Vec<Effect>,
    ) -> Result<(), CommandError> {
        let checkout = Self::checked_out(&mut self.consumers, tag, msg_ids)?;
        let mut back = Vec::with_capacity(msg_ids.len());
        for msg_id in msg_ids {
            if let Some(entry) = checkout.unsettled.remove(msg_id) {
                back.push(entry.msg);
            }
        }
        if let CheckoutSpec::Prefetch { count } = checkout.spec {
            checkout.credit = count.min(checkout.credit.saturating_add(back.len() as u32));
        }
        for mut msg in back {
            msg.redeliveries += 1;
            // Keyed by msg_id, so a returned message resumes its FIFO slot.
            self.ready.insert(msg.msg_id, msg);
        }
        self.deliver(effects);
        Ok(())
    }

    fn discard(
        &mut self,
        tag: &str,
        msg_ids: &[MsgId],
        reason: String,
        effects: &mut Vec<Effect>,
    ) -> Result<(), CommandError> {
        let checkout = Self::checked_out(&mut self.consumers, tag, msg_ids)?;
        let mut messages = Vec::with_capacity(msg_ids.len());
        for msg_id in msg_ids {
            if let Some(entry) = checkout.unsettled.remove(msg_id) {
                messages.push(entry.msg.message);
            }
        }
        if let CheckoutSpec::Prefetch { count } = checkout.spec {
            checkout.credit = count.min(checkout.credit.saturating_add(messages.len() as u32));
        }
        if !messages.is_empty() {
            effects.push(Effect::DeadLetter { reason, messages });
        }
        self.deliver(effects);
        Ok(())
    }

    fn cancel_checkout(
        &mut self,
        tag: &str,
        effects: &mut Vec<Effect>,
    ) -> Result<(), CommandError> {
        let checkout = self
            .consumers
            .remove(tag)
            .ok_or_else(|| CommandError::UnknownConsumer(tag.to_string()))?;
        self.consumer_order.retain(|t| t != tag);
        for (_, entry) in checkout.unsettled {
            let mut msg = entry.msg;
            msg.redeliveries += 1;
            self.ready.insert(msg.msg_id, msg);
        }
        self.deliver(effects);
        Ok(())
    }

    /// Validate a settlement-family command up front so a rejection leaves
    /// the machine untouched.
    fn checked_out<'a>(
        consumers: &'a mut HashMap<String, Checkout>,
        tag: &str,
        msg_ids: &[MsgId],
    ) -> Result<&'a mut Checkout, CommandError> {
        let checkout = consumers
            .get_mut(tag)
            .ok_or_else(|| CommandError::UnknownConsumer(tag.to_string()))?;
        for msg_id in msg_ids {
            if !checkout.unsettled.contains_key(msg_id) {
                return Err(CommandError::NotCheckedOut {
                    tag: tag.to_string(),
                    msg_id: *msg_id,
                });
            }
        }
        Ok(checkout)
    }

    // -----------------------------------------------------------------------
    // Delivery scan
    // -----------------------------------------------------------------------

    /// Hand ready messages to consumers with available credit, in consumer
    /// registration order. Everything one consumer can take right now goes
    /// into a single batched effect, bounding the number of asynchronous
    /// events per state transition.
    fn deliver(&mut self, effects: &mut Vec<Effect>) {
        if self.ready.is_empty() {
            return;
        }
        for tag in self.consumer_order.clone() {
            let Some(checkout) = self.consumers.get_mut(&tag) else {
                continue;
            };
            if checkout.credit == 0 {
                continue;
            }
            let mut batch = Vec::new();
            let counter = checkout.delivery_count + 1;
            while checkout.credit > 0 {
                let Some((_, msg)) = self.ready.pop_first() else {
                    break;
                };
                checkout.credit -= 1;
                batch.push(msg.delivered());
                checkout.unsettled.insert(msg.msg_id, Unsettled { counter, msg });
            }
            if batch.is_empty() {
                break;
            }
            checkout.delivery_count = counter;
            effects.push(Effect::Delivery {
                tag,
                counter,
                batch,
            });
            if self.ready.is_empty() {
                break;
            }
        }
    }

    fn has_pending_work(&self) -> bool {
        !self.ready.is_empty() || self.consumers.values().any(|c| !c.unsettled.is_empty())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn query(&self, query: &Query, now_ms: u64) -> QueryResult {
        match query {
            Query::ReadyCount => QueryResult::Count(self.ready.len() as u64),
            Query::CheckedOutCount => QueryResult::Count(
                self.consumers
                    .values()
                    .map(|c| c.unsettled.len() as u64)
                    .sum(),
            ),
            Query::Consumers => QueryResult::Consumers(self.consumer_listing()),
            Query::Usage => QueryResult::Usage(self.usage.ratio(now_ms)),
            Query::CheckedOut { tag, after_counter } => {
                QueryResult::CheckedOut(self.checked_out_after(tag, *after_counter))
            }
        }
    }

    pub fn ready_count(&self) -> u64 {
        self.ready.len() as u64
    }

    pub fn checked_out_count(&self) -> u64 {
        self.consumers
            .values()
            .map(|c| c.unsettled.len() as u64)
            .sum()
    }

    fn consumer_listing(&self) -> Vec<ConsumerInfo> {
        self.consumer_order
            .iter()
            .filter_map(|tag| {
                self.consumers.get(tag).map(|c| ConsumerInfo {
                    tag: tag.clone(),
                    owner: c.meta.owner.clone(),
                    spec: c.spec,
                    credit: c.credit,
                    delivery_count: c.delivery_count,
                    unsettled: c.unsettled.len() as u64,
                })
            })
            .collect()
    }

    /// Unsettled entries for `tag` delivered after `after_counter`, ordered
    /// by delivery counter then message id. Sessions use this to reconstruct
    /// delivery batches whose events were lost in transport.
    fn checked_out_after(&self, tag: &str, after_counter: u64) -> Vec<CheckedOutEntry> {
        let Some(checkout) = self.consumers.get(tag) else {
            return Vec::new();
        };
        let mut entries: Vec<CheckedOutEntry> = checkout
            .unsettled
            .values()
            .filter(|entry| entry.counter > after_counter)
            .map(|entry| CheckedOutEntry {
                counter: entry.counter,
                delivered: entry.msg.delivered(),
            })
            .collect();
        entries.sort_by_key(|e| (e.counter, e.delivered.msg_id));
        entries
    }
}

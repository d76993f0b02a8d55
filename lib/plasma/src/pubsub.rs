use crate::conn::ConnTx;
use crate::logging::{debug, trace, Logger};
use crate::sse;
use crate::ws::frame::{self, Opcode};
use hashbrown::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::Hasher;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Channel identity: an application-chosen 64-bit filter, or a byte-string
/// name reduced to 64 bits. Name collisions conflate channels, as in any
/// hashed channel space.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ChannelKey {
    Filter(u64),
    Named(u64),
}

impl ChannelKey {
    #[inline]
    pub fn filter(id: u64) -> ChannelKey {
        ChannelKey::Filter(id)
    }

    pub fn named(name: &[u8]) -> ChannelKey {
        let mut hasher = DefaultHasher::new();
        hasher.write(name);
        ChannelKey::Named(hasher.finish())
    }
}

/// How a subscription wants payloads framed on its sink.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Encoder {
    Raw,
    WsText,
    WsBinary,
    Sse,
}

/// What happens when a subscription's pending queue is full.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Overflow {
    DropOldest,
    DropNewest,
    CloseSubscriber,
}

/// A published payload plus its optional SSE metadata. Encoded forms are
/// cached per encoder so a fan-out over many same-encoder subscribers pays
/// for one encoding.
pub struct Message {
    pub key: ChannelKey,
    pub data: Vec<u8>,
    pub is_text: bool,
    pub event: Option<String>,
    pub id: Option<String>,
    pub retry: Option<u64>,
    cache: Mutex<Vec<(Encoder, Arc<[u8]>)>>,
}

impl Message {
    pub fn new(key: ChannelKey, data: Vec<u8>, is_text: bool) -> Message {
        Message {
            key,
            data,
            is_text,
            event: None,
            id: None,
            retry: None,
            cache: Mutex::new(Vec::new()),
        }
    }

    pub fn with_event(mut self, event: &str) -> Message {
        self.event = Some(event.to_string());
        self
    }

    pub fn with_id(mut self, id: &str) -> Message {
        self.id = Some(id.to_string());
        self
    }

    /// The payload framed for `encoder`, computed at most once per distinct
    /// framing.
    pub fn encoded(&self, encoder: Encoder) -> Arc<[u8]> {
        // Text framing silently falls back to binary for non-text payloads.
        let encoder = match encoder {
            Encoder::WsText if !self.is_text => Encoder::WsBinary,
            other => other,
        };

        let mut cache = self.cache.lock().expect("message cache lock poisoned");
        if let Some((_, bytes)) = cache.iter().find(|(e, _)| *e == encoder) {
            return bytes.clone();
        }
        let bytes: Arc<[u8]> = match encoder {
            Encoder::Raw => Arc::from(self.data.as_slice()),
            Encoder::WsText => Arc::from(frame::encode_frame(Opcode::Text, &self.data, true).as_slice()),
            Encoder::WsBinary => {
                Arc::from(frame::encode_frame(Opcode::Binary, &self.data, true).as_slice())
            }
            Encoder::Sse => Arc::from(sse::encode_event(self).as_slice()),
        };
        cache.push((encoder, bytes.clone()));
        bytes
    }
}

/// Hook replacing the default deliver-to-sink behavior. Runs on the
/// reactor thread during delivery.
pub type OnMessage = Box<dyn Fn(&ConnTx, &Arc<Message>) + Send + Sync>;

/// Fired once when the subscription is cancelled.
pub type OnClose = Box<dyn FnOnce() + Send>;

pub struct SubscribeOpts {
    pub key: ChannelKey,
    pub encoder: Encoder,
    pub overflow: Overflow,
    pub queue_limit: usize,
    pub tx: ConnTx,
    pub on_message: Option<OnMessage>,
    pub on_close: Option<OnClose>,
}

/// One sink bound to one channel. Publishes enqueue here; the reactor
/// drains the queue into the connection's write queue.
pub struct Subscription {
    id: u64,
    key: ChannelKey,
    encoder: Encoder,
    overflow: Overflow,
    queue_limit: usize,
    tx: ConnTx,
    queue: Mutex<VecDeque<Arc<Message>>>,
    dropped: AtomicU64,
    cancelled: AtomicBool,
    pub(crate) on_message: Option<OnMessage>,
    on_close: Mutex<Option<OnClose>>,
}

impl Subscription {
    #[inline]
    pub fn key(&self) -> ChannelKey {
        self.key
    }

    #[inline]
    pub fn encoder(&self) -> Encoder {
        self.encoder
    }

    #[inline]
    pub fn tx(&self) -> &ConnTx {
        &self.tx
    }

    /// Messages discarded by the overflow policy so far.
    #[inline]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn pop(&self) -> Option<Arc<Message>> {
        self.lock_queue().pop_front()
    }

    pub(crate) fn pending(&self) -> usize {
        self.lock_queue().len()
    }

    /// Enqueues a message, applying the overflow policy. Returns false when
    /// the policy demands closing the subscriber.
    fn push(&self, message: Arc<Message>) -> bool {
        let mut queue = self.lock_queue();
        if queue.len() >= self.queue_limit {
            match self.overflow {
                Overflow::DropOldest => {
                    queue.pop_front();
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Overflow::DropNewest => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                Overflow::CloseSubscriber => return false,
            }
        }
        queue.push_back(message);
        true
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.lock_queue().clear();
            if let Some(hook) = self
                .on_close
                .lock()
                .expect("subscription lock poisoned")
                .take()
            {
                hook();
            }
        }
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Arc<Message>>> {
        self.queue.lock().expect("subscription queue lock poisoned")
    }
}

/// In-process multi-subscriber fan-out. Publish enqueues synchronously on
/// every matching subscription and schedules asynchronous delivery through
/// the reactor; per publisher/subscriber pairs the delivery order equals
/// the publish order.
pub struct Bus {
    channels: Mutex<HashMap<ChannelKey, Vec<Arc<Subscription>>>>,
    by_conn: Mutex<HashMap<u64, Vec<Arc<Subscription>>>>,
    next_id: AtomicU64,
    log: Logger,
}

impl Bus {
    pub fn new(log: Logger) -> Arc<Bus> {
        Arc::new(Bus {
            channels: Mutex::new(HashMap::new()),
            by_conn: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            log,
        })
    }

    pub fn subscribe(&self, opts: SubscribeOpts) -> Arc<Subscription> {
        let sub = Arc::new(Subscription {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            key: opts.key,
            encoder: opts.encoder,
            overflow: opts.overflow,
            queue_limit: opts.queue_limit.max(1),
            tx: opts.tx,
            queue: Mutex::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            on_message: opts.on_message,
            on_close: Mutex::new(opts.on_close),
        });

        self.lock_channels()
            .entry(opts.key)
            .or_insert_with(Vec::new)
            .push(sub.clone());
        self.lock_by_conn()
            .entry(sub.tx.key())
            .or_insert_with(Vec::new)
            .push(sub.clone());

        debug!(self.log, "subscription created";
               "channel" => ?opts.key,
               "conn" => sub.tx.id(),
               "encoder" => ?sub.encoder);
        sub
    }

    pub fn unsubscribe(&self, sub: &Arc<Subscription>) {
        {
            let mut channels = self.lock_channels();
            if let Some(list) = channels.get_mut(&sub.key) {
                list.retain(|s| s.id != sub.id);
                if list.is_empty() {
                    channels.remove(&sub.key);
                }
            }
        }
        {
            let mut by_conn = self.lock_by_conn();
            if let Some(list) = by_conn.get_mut(&sub.tx.key()) {
                list.retain(|s| s.id != sub.id);
                if list.is_empty() {
                    by_conn.remove(&sub.tx.key());
                }
            }
        }
        sub.cancel();
    }

    /// Cancels every subscription attached to a closed connection.
    pub fn drop_conn(&self, conn_key: u64) {
        let subs = match self.lock_by_conn().remove(&conn_key) {
            Some(subs) => subs,
            None => return,
        };
        debug!(self.log, "cancelling subscriptions for closed connection";
               "conn_key" => conn_key,
               "count" => subs.len());
        let mut channels = self.lock_channels();
        for sub in subs {
            if let Some(list) = channels.get_mut(&sub.key) {
                list.retain(|s| s.id != sub.id);
                if list.is_empty() {
                    channels.remove(&sub.key);
                }
            }
            sub.cancel();
        }
    }

    pub fn subscriber_count(&self, key: ChannelKey) -> usize {
        self.lock_channels().get(&key).map_or(0, |l| l.len())
    }

    /// Hands the message to every subscriber on its channel and returns
    /// how many deliveries were scheduled.
    pub fn publish(&self, message: Message) -> usize {
        let message = Arc::new(message);
        let subs: Vec<Arc<Subscription>> = self
            .lock_channels()
            .get(&message.key)
            .map(|l| l.clone())
            .unwrap_or_default();

        trace!(self.log, "publishing";
               "channel" => ?message.key,
               "bytes" => message.data.len(),
               "subscribers" => subs.len());

        let mut scheduled = 0;
        for sub in subs {
            if sub.is_cancelled() {
                continue;
            }
            if sub.push(message.clone()) {
                sub.tx.remote().pump(sub.clone());
                scheduled += 1;
            } else {
                // Overflow policy says this subscriber is too slow to live.
                debug!(self.log, "closing overflowed subscriber"; "conn" => sub.tx.id());
                self.unsubscribe(&sub);
                sub.tx.close();
            }
        }
        scheduled
    }

    fn lock_channels(&self) -> std::sync::MutexGuard<'_, HashMap<ChannelKey, Vec<Arc<Subscription>>>> {
        self.channels.lock().expect("bus channel table lock poisoned")
    }

    fn lock_by_conn(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Vec<Arc<Subscription>>>> {
        self.by_conn.lock().expect("bus conn table lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::WriteQueue;
    use crate::logging;
    use crate::reactor::test_remote;

    fn test_tx(id: usize) -> (ConnTx, crate::reactor::TestRemote) {
        let harness = test_remote();
        let tx = ConnTx::new(id, 0, WriteQueue::new(), harness.remote.clone());
        (tx, harness)
    }

    fn sub_opts(tx: ConnTx, key: ChannelKey, overflow: Overflow, limit: usize) -> SubscribeOpts {
        SubscribeOpts {
            key,
            encoder: Encoder::Raw,
            overflow,
            queue_limit: limit,
            tx,
            on_message: None,
            on_close: None,
        }
    }

    #[test]
    fn test_fifo_per_publisher() {
        let bus = Bus::new(logging::discard());
        let (tx, _harness) = test_tx(1);
        let key = ChannelKey::named(b"orders");
        let sub = bus.subscribe(sub_opts(tx, key, Overflow::DropOldest, 100));

        for i in 0..10u8 {
            bus.publish(Message::new(key, vec![i], false));
        }

        let seen: Vec<u8> = std::iter::from_fn(|| sub.pop()).map(|m| m.data[0]).collect();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_drop_newest_keeps_prefix() {
        let bus = Bus::new(logging::discard());
        let (tx, _harness) = test_tx(1);
        let key = ChannelKey::filter(42);
        let sub = bus.subscribe(sub_opts(tx, key, Overflow::DropNewest, 3));

        for i in 0..10u8 {
            bus.publish(Message::new(key, vec![i], false));
        }

        let seen: Vec<u8> = std::iter::from_fn(|| sub.pop()).map(|m| m.data[0]).collect();
        // Delivery is a strict prefix of the publish sequence.
        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(sub.dropped(), 7);
    }

    #[test]
    fn test_drop_oldest_keeps_suffix() {
        let bus = Bus::new(logging::discard());
        let (tx, _harness) = test_tx(1);
        let key = ChannelKey::filter(42);
        let sub = bus.subscribe(sub_opts(tx, key, Overflow::DropOldest, 3));

        for i in 0..10u8 {
            bus.publish(Message::new(key, vec![i], false));
        }

        let seen: Vec<u8> = std::iter::from_fn(|| sub.pop()).map(|m| m.data[0]).collect();
        assert_eq!(seen, vec![7, 8, 9]);
        assert_eq!(sub.dropped(), 7);
    }

    #[test]
    fn test_close_subscriber_policy_cancels() {
        let bus = Bus::new(logging::discard());
        let (tx, harness) = test_tx(1);
        let key = ChannelKey::filter(1);
        let sub = bus.subscribe(sub_opts(tx, key, Overflow::CloseSubscriber, 1));

        bus.publish(Message::new(key, vec![1], false));
        assert_eq!(bus.subscriber_count(key), 1);

        // Second publish overflows and evicts the subscriber.
        bus.publish(Message::new(key, vec![2], false));
        assert_eq!(bus.subscriber_count(key), 0);
        assert!(sub.is_cancelled());
        // A close task for the connection was scheduled.
        assert!(harness.tasks.try_recv().is_ok());
    }

    #[test]
    fn test_channels_are_isolated() {
        let bus = Bus::new(logging::discard());
        let (tx_a, _ha) = test_tx(1);
        let (tx_b, _hb) = test_tx(2);
        let chat = ChannelKey::named(b"chat");
        let logs = ChannelKey::named(b"logs");
        let sub_a = bus.subscribe(sub_opts(tx_a, chat, Overflow::DropOldest, 8));
        let sub_b = bus.subscribe(sub_opts(tx_b, logs, Overflow::DropOldest, 8));

        bus.publish(Message::new(chat, b"hello".to_vec(), true));

        assert_eq!(sub_a.pending(), 1);
        assert_eq!(sub_b.pending(), 0);
    }

    #[test]
    fn test_drop_conn_cancels_and_fires_on_close() {
        use std::sync::atomic::AtomicUsize;

        let bus = Bus::new(logging::discard());
        let (tx, _harness) = test_tx(5);
        let conn_key = tx.key();
        let key = ChannelKey::filter(9);

        let closed = Arc::new(AtomicUsize::new(0));
        let closed2 = closed.clone();
        let mut opts = sub_opts(tx, key, Overflow::DropOldest, 8);
        opts.on_close = Some(Box::new(move || {
            closed2.fetch_add(1, Ordering::SeqCst);
        }));
        let sub = bus.subscribe(opts);

        bus.drop_conn(conn_key);
        assert!(sub.is_cancelled());
        assert_eq!(bus.subscriber_count(key), 0);
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        // Idempotent.
        bus.drop_conn(conn_key);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_encoding_cached_per_encoder() {
        let key = ChannelKey::filter(1);
        let msg = Message::new(key, b"payload".to_vec(), true);

        let a = msg.encoded(Encoder::WsText);
        let b = msg.encoded(Encoder::WsText);
        assert!(Arc::ptr_eq(&a, &b), "same framing must reuse the cache");

        let raw = msg.encoded(Encoder::Raw);
        assert!(!Arc::ptr_eq(&a, &raw));
        assert_eq!(&raw[..], b"payload");

        // Ws framing wraps the payload.
        assert_eq!(a[0], 0x81);
        assert_eq!(&a[2..], b"payload");
    }

    #[test]
    fn test_ws_text_encoder_downgrades_for_binary() {
        let key = ChannelKey::filter(1);
        let msg = Message::new(key, vec![0xFF, 0xFE], false);
        let framed = msg.encoded(Encoder::WsText);
        assert_eq!(framed[0], 0x82, "binary payload must use a binary frame");
    }

    #[test]
    fn test_named_keys_stable_and_distinct_from_filters() {
        assert_eq!(ChannelKey::named(b"chat"), ChannelKey::named(b"chat"));
        assert_ne!(ChannelKey::named(b"chat"), ChannelKey::named(b"chat2"));
        if let ChannelKey::Named(h) = ChannelKey::named(b"chat") {
            assert_ne!(ChannelKey::filter(h), ChannelKey::named(b"chat"));
        }
    }
}

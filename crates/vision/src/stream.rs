//! Latest-value distribution of encoded views to any number of readers.
//!
//! A channel holds one immutable snapshot behind an atomic pointer. The
//! pipeline swaps in each new buffer; readers load whatever is current on
//! their own schedule and never lock.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::Duration,
};

use arc_swap::ArcSwapOption;

use crate::{
    encoding::{CompressedBuffer, EncodeFormat},
    telemetry,
};

pub struct StreamChannel {
    name: String,
    format: EncodeFormat,
    latest: ArcSwapOption<CompressedBuffer>,
}

impl StreamChannel {
    pub fn new(name: impl Into<String>, format: EncodeFormat) -> Self {
        Self {
            name: name.into(),
            format,
            latest: ArcSwapOption::empty(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn format(&self) -> EncodeFormat {
        self.format
    }

    /// Replace the published buffer. Buffers not newer than the current one
    /// are ignored so readers never observe the sequence going backwards.
    /// Returns whether the buffer was published.
    pub fn publish(&self, buffer: CompressedBuffer) -> bool {
        let sequence = buffer.sequence;
        let candidate = Arc::new(buffer);
        let previous = self.latest.rcu(|current| match current {
            Some(current) if current.sequence >= sequence => Some(current.clone()),
            _ => Some(candidate.clone()),
        });
        let published = previous
            .as_ref()
            .map_or(true, |previous| previous.sequence < sequence);
        if published {
            metrics::counter!(telemetry::STREAM_PUBLISHES, "channel" => self.name.clone())
                .increment(1);
        }
        published
    }

    pub fn snapshot(&self) -> Option<Arc<CompressedBuffer>> {
        self.latest.load_full()
    }

    /// Sequence of the published buffer, 0 before the first publish.
    pub fn sequence(&self) -> u64 {
        self.latest
            .load()
            .as_ref()
            .map_or(0, |buffer| buffer.sequence)
    }

    pub fn reader(self: &Arc<Self>, interval: Duration) -> StreamReader {
        StreamReader {
            channel: self.clone(),
            interval,
            last_sequence: None,
        }
    }
}

/// One consumer's view of a channel, polled at its own interval.
pub struct StreamReader {
    channel: Arc<StreamChannel>,
    interval: Duration,
    last_sequence: Option<u64>,
}

impl StreamReader {
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Snapshot the current buffer. The same buffer is returned again when
    /// nothing newer was published since the last poll.
    pub fn poll(&mut self) -> Option<Arc<CompressedBuffer>> {
        let snapshot = self.channel.snapshot()?;
        self.last_sequence = Some(snapshot.sequence);
        Some(snapshot)
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }
}

/// Every channel of a pipeline, keyed by view name. Fixed at construction.
#[derive(Clone, Default)]
pub struct ChannelSet {
    channels: BTreeMap<String, Arc<StreamChannel>>,
}

impl ChannelSet {
    pub fn new<I, S>(names: I, format: EncodeFormat) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let channels = names
            .into_iter()
            .map(|name| {
                let name = name.into();
                (name.clone(), Arc::new(StreamChannel::new(name, format)))
            })
            .collect();
        Self { channels }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<StreamChannel>> {
        self.channels.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<StreamChannel>> {
        self.channels.values()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        thread,
        time::Instant,
    };

    use bytes::Bytes;

    use super::*;

    fn buffer(sequence: u64) -> CompressedBuffer {
        CompressedBuffer {
            data: Bytes::from(sequence.to_le_bytes().to_vec()),
            sequence,
            format: EncodeFormat::Jpeg,
        }
    }

    #[test]
    fn empty_channel_has_nothing_to_read() {
        let channel = Arc::new(StreamChannel::new("main", EncodeFormat::Jpeg));
        assert_eq!(channel.sequence(), 0);
        assert!(channel.reader(Duration::from_millis(10)).poll().is_none());
    }

    #[test]
    fn stale_buffers_are_not_published() {
        let channel = StreamChannel::new("main", EncodeFormat::Jpeg);
        assert!(channel.publish(buffer(3)));
        assert!(!channel.publish(buffer(2)));
        assert!(!channel.publish(buffer(3)));
        assert_eq!(channel.sequence(), 3);
        assert!(channel.publish(buffer(4)));
        assert_eq!(channel.snapshot().unwrap().data, Bytes::from(4u64.to_le_bytes().to_vec()));
    }

    #[test]
    fn reader_sees_repeats_when_polling_faster_than_publish() {
        let channel = Arc::new(StreamChannel::new("roi", EncodeFormat::Png));
        channel.publish(buffer(1));
        let mut reader = channel.reader(Duration::from_millis(1));
        assert_eq!(reader.poll().unwrap().sequence, 1);
        assert_eq!(reader.poll().unwrap().sequence, 1);
        assert_eq!(reader.last_sequence(), Some(1));
    }

    #[test]
    fn sequential_publishes_are_seen_in_order_by_one_reader() {
        let channel = Arc::new(StreamChannel::new("main", EncodeFormat::Jpeg));
        let mut reader = channel.reader(Duration::ZERO);
        let mut last = 0;
        for sequence in 1..=50 {
            channel.publish(buffer(sequence));
            let seen = reader.poll().unwrap().sequence;
            assert!(seen >= last);
            last = seen;
        }
        assert_eq!(last, 50);
    }

    #[test]
    fn readers_at_different_rates_see_non_decreasing_sequences() {
        let channel = Arc::new(StreamChannel::new("main", EncodeFormat::Jpeg));
        let done = Arc::new(AtomicBool::new(false));

        let spawn_reader = |hz: u64| {
            let mut reader = channel.reader(Duration::from_millis(1000 / hz));
            let done = done.clone();
            thread::spawn(move || {
                let mut observed = Vec::new();
                while !done.load(Ordering::Acquire) {
                    let started = Instant::now();
                    if let Some(buffer) = reader.poll() {
                        observed.push(buffer.sequence);
                    }
                    // A slow or fast peer must not affect this loop's pace.
                    assert!(started.elapsed() < Duration::from_millis(50));
                    thread::sleep(reader.interval());
                }
                observed
            })
        };
        let slow = spawn_reader(5);
        let fast = spawn_reader(20);

        for sequence in 1..=120 {
            channel.publish(buffer(sequence));
            thread::sleep(Duration::from_millis(5));
        }
        done.store(true, Ordering::Release);

        for observed in [slow.join().unwrap(), fast.join().unwrap()] {
            assert!(!observed.is_empty());
            assert!(observed.windows(2).all(|w| w[0] <= w[1]), "{observed:?}");
        }
    }

    #[test]
    fn channel_set_is_keyed_by_name() {
        let set = ChannelSet::new(["roi", "main"], EncodeFormat::Jpeg);
        assert_eq!(set.names().collect::<Vec<_>>(), vec!["main", "roi"]);
        assert_eq!(set.get("roi").unwrap().name(), "roi");
        assert!(set.get("other").is_none());
        assert_eq!(set.len(), 2);
    }
}

use crate::catalog::ActionCatalog;
use crate::event::Event;
use crate::line::Line;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub const ALIEN_BUCKET: &str = "alien";
pub const RESPONSE_BUCKET: &str = "Response";

pub const CLASS_ATTR: &str = "AmiClass";
pub const BATCH_ATTR: &str = "AmiBatch";
pub const SEQ_ATTR: &str = "AmiSeq";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BatchId(pub i64);

impl BatchId {
    pub fn at(at: DateTime<Utc>) -> Self {
        Self(at.timestamp_nanos_opt().unwrap_or(i64::MAX))
    }

    pub fn now() -> Self {
        Self::at(Utc::now())
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BatchId {
    type Err = std::num::ParseIntError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        input.trim().parse::<i64>().map(Self)
    }
}

/// Strictly increasing even when the wall clock steps backwards.
#[derive(Debug, Clone, Default)]
pub struct BatchClock {
    last: Option<BatchId>,
}

impl BatchClock {
    pub fn after(last: Option<BatchId>) -> Self {
        Self { last }
    }

    pub fn next(&mut self) -> BatchId {
        let now = BatchId::now();
        let next = match self.last {
            Some(last) if now <= last => BatchId(last.0.saturating_add(1)),
            _ => now,
        };
        self.last = Some(next);
        next
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Known,
    Alien,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Known => "known",
            Classification::Alien => "alien",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Classification {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim() {
            "known" => Ok(Classification::Known),
            "alien" => Ok(Classification::Alien),
            other => Err(format!("Unknown classification: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Ingested {
    pub batch: Option<BatchId>,
    pub duplicate: bool,
    pub events: Vec<Event>,
}

/// Classified events bucketed by name, each bucket in arrival order.
pub struct EventRegistry {
    catalog: Arc<ActionCatalog>,
    buckets: HashMap<String, Vec<Event>>,
    last_batch: Option<BatchId>,
    next_seq: u64,
}

impl EventRegistry {
    pub fn new(catalog: Arc<ActionCatalog>) -> Self {
        Self {
            catalog,
            buckets: HashMap::new(),
            last_batch: None,
            next_seq: 0,
        }
    }

    pub fn catalog(&self) -> &ActionCatalog {
        &self.catalog
    }

    pub fn last_batch(&self) -> Option<BatchId> {
        self.last_batch
    }

    pub fn classify(&self, event: &Event) -> (String, Classification) {
        if let Some(name) = event.name() {
            if self.catalog.is_known(name) {
                return (name.to_string(), Classification::Known);
            }
            return (ALIEN_BUCKET.to_string(), Classification::Alien);
        }
        if event.is_response() {
            return (RESPONSE_BUCKET.to_string(), Classification::Known);
        }
        (ALIEN_BUCKET.to_string(), Classification::Alien)
    }

    /// A batch with the same id as the previous one is skipped.
    pub fn ingest<I>(&mut self, events: I, batch: BatchId) -> Ingested
    where
        I: IntoIterator<Item = Event>,
    {
        if self.last_batch == Some(batch) {
            return Ingested {
                batch: Some(batch),
                duplicate: true,
                events: Vec::new(),
            };
        }
        self.last_batch = Some(batch);

        let mut filed = Vec::new();
        for mut event in events {
            let (bucket, class) = self.classify(&event);
            self.next_seq += 1;
            event.push_extra(Line::synthetic(CLASS_ATTR, class.as_str()));
            event.push_extra(Line::synthetic(BATCH_ATTR, batch.to_string()));
            event.push_extra(Line::synthetic(SEQ_ATTR, self.next_seq.to_string()));
            filed.push(event.clone());
            self.buckets.entry(bucket).or_default().push(event);
        }

        Ingested {
            batch: Some(batch),
            duplicate: false,
            events: filed,
        }
    }

    pub fn is_bucket_name(&self, name: &str) -> bool {
        name == ALIEN_BUCKET || name == RESPONSE_BUCKET || self.catalog.is_known(name)
    }

    pub fn bucket(&self, name: &str) -> Option<&[Event]> {
        self.buckets.get(name).map(Vec::as_slice)
    }

    pub fn by_value(&self, value: &str, event_name: Option<&str>, partial: bool) -> Vec<&Event> {
        if value.is_empty() {
            return Vec::new();
        }
        self.select(event_name, |event| {
            event.lines().any(|line| {
                if partial {
                    line.value().contains(value)
                } else {
                    line.value() == value
                }
            })
        })
    }

    pub fn by_attr(&self, attr: &str, event_name: Option<&str>, partial: bool) -> Vec<&Event> {
        if attr.is_empty() {
            return Vec::new();
        }
        self.select(event_name, |event| {
            event.lines().any(|line| {
                if partial {
                    line.attr().contains(attr)
                } else {
                    line.attr() == attr
                }
            })
        })
    }

    pub fn by_action_id(&self, action_id: &str) -> Vec<&Event> {
        if action_id.is_empty() {
            return Vec::new();
        }
        let mut found = self.select(None, |event| event.action_id() == Some(action_id));
        found.sort_by_key(|event| arrival_key(event));
        found
    }

    fn select<F>(&self, event_name: Option<&str>, predicate: F) -> Vec<&Event>
    where
        F: Fn(&Event) -> bool,
    {
        match event_name {
            Some(name) => {
                if !self.is_bucket_name(name) {
                    return Vec::new();
                }
                self.buckets
                    .get(name)
                    .map(|events| events.iter().filter(|event| predicate(event)).collect())
                    .unwrap_or_default()
            }
            None => self
                .buckets
                .values()
                .flat_map(|events| events.iter())
                .filter(|event| predicate(event))
                .collect(),
        }
    }

    /// Removes events stamped before `batch`. Returns how many were removed.
    pub fn evict_older_than(&mut self, batch: BatchId, event_name: Option<&str>) -> usize {
        let keep = |event: &Event| event.batch_id().map_or(true, |stamp| stamp >= batch);
        let mut removed = 0;
        match event_name {
            Some(name) => {
                if let Some(events) = self.buckets.get_mut(name) {
                    let before = events.len();
                    events.retain(|event| keep(event));
                    removed = before - events.len();
                }
            }
            None => {
                for events in self.buckets.values_mut() {
                    let before = events.len();
                    events.retain(|event| keep(event));
                    removed += before - events.len();
                }
            }
        }
        removed
    }

    pub fn drop_buckets(&mut self, names: &[&str]) -> usize {
        let mut removed = 0;
        for name in names {
            if let Some(events) = self.buckets.get_mut(*name) {
                removed += events.len();
                events.clear();
            }
        }
        removed
    }

    pub fn drop_all_except(&mut self, keep: &[&str]) -> usize {
        let mut removed = 0;
        for (name, events) in self.buckets.iter_mut() {
            if keep.contains(&name.as_str()) {
                continue;
            }
            removed += events.len();
            events.clear();
        }
        removed
    }

    pub fn snapshot(&self) -> BTreeMap<&str, &[Event]> {
        self.buckets
            .iter()
            .filter(|(_, events)| !events.is_empty())
            .map(|(name, events)| (name.as_str(), events.as_slice()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn arrival_key(event: &Event) -> (BatchId, u64) {
    (
        event.batch_id().unwrap_or(BatchId(i64::MAX)),
        event.seq().unwrap_or(u64::MAX),
    )
}

/// Restores global arrival order across buckets.
pub fn sort_by_arrival(events: &mut [Event]) {
    events.sort_by_key(arrival_key);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamFramer;

    fn registry() -> EventRegistry {
        EventRegistry::new(Arc::new(ActionCatalog::default()))
    }

    fn frame(text: &str) -> Vec<Event> {
        StreamFramer::default()
            .feed(text.as_bytes())
            .expect("frame")
            .events
    }

    #[test]
    fn response_is_classified_known_and_found_by_action_id() {
        let mut reg = registry();
        reg.ingest(frame("Response: Success\r\nActionID: 1\r\n\r\n"), BatchId(10));

        let found = reg.by_action_id("1");
        assert_eq!(found.len(), 1);
        let event = found[0];
        assert_eq!(event.response(), Some("Success"));
        assert_eq!(event.classification(), Some(Classification::Known));
        assert_eq!(event.batch_id(), Some(BatchId(10)));
        assert_eq!(reg.bucket(RESPONSE_BUCKET).map(<[Event]>::len), Some(1));
        assert!(reg.by_action_id("2").is_empty());
    }

    #[test]
    fn unknown_event_names_go_to_alien_bucket() {
        let mut reg = registry();
        let ingested = reg.ingest(
            frame("Event: SomethingNew\r\nFoo: bar\r\n\r\nEvent: PeerEntry\r\nObjectName: 100\r\n\r\n"),
            BatchId(1),
        );
        assert_eq!(ingested.events.len(), 2);
        assert_eq!(ingested.events[0].classification(), Some(Classification::Alien));
        assert_eq!(reg.bucket(ALIEN_BUCKET).map(<[Event]>::len), Some(1));
        assert_eq!(reg.bucket("PeerEntry").map(<[Event]>::len), Some(1));
    }

    #[test]
    fn repeated_batch_id_is_skipped() {
        let mut reg = registry();
        let events = frame("Event: Hangup\r\nChannel: SIP/100\r\n\r\n");
        let first = reg.ingest(events.clone(), BatchId(5));
        let second = reg.ingest(events, BatchId(5));
        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn value_and_attribute_lookups() {
        let mut reg = registry();
        reg.ingest(
            frame(concat!(
                "Event: PeerEntry\r\nObjectName: 100\r\nStatus: OK (5 ms)\r\n\r\n",
                "Event: PeerEntry\r\nObjectName: 200\r\nStatus: UNREACHABLE\r\n\r\n",
                "Event: Hangup\r\nChannel: SIP/100-1\r\n\r\n",
            )),
            BatchId(1),
        );

        assert_eq!(reg.by_value("100", None, false).len(), 1);
        assert_eq!(reg.by_value("100", None, true).len(), 2);
        assert_eq!(reg.by_value("100", Some("Hangup"), true).len(), 1);
        assert!(reg.by_value("", None, true).is_empty());
        assert!(reg.by_value("100", Some("NotABucket"), true).is_empty());

        assert_eq!(reg.by_attr("Status", None, false).len(), 2);
        assert_eq!(reg.by_attr("Stat", Some("PeerEntry"), true).len(), 2);
        assert!(reg.by_attr("Stat", None, false).is_empty());
    }

    #[test]
    fn eviction_is_idempotent() {
        let mut reg = registry();
        reg.ingest(frame("Event: Hangup\r\nChannel: a\r\n\r\n"), BatchId(1));
        reg.ingest(frame("Event: Hangup\r\nChannel: b\r\n\r\n"), BatchId(2));
        reg.ingest(frame("Event: Newchannel\r\nChannel: c\r\n\r\n"), BatchId(3));

        assert_eq!(reg.evict_older_than(BatchId(3), Some("Hangup")), 2);
        assert_eq!(reg.evict_older_than(BatchId(3), Some("Hangup")), 0);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.evict_older_than(BatchId(4), None), 1);
        assert_eq!(reg.evict_older_than(BatchId(4), None), 0);
        assert!(reg.is_empty());
    }

    #[test]
    fn drop_and_snapshot_hide_empty_buckets() {
        let mut reg = registry();
        reg.ingest(
            frame(concat!(
                "Event: Hangup\r\nChannel: a\r\n\r\n",
                "Event: Newchannel\r\nChannel: b\r\n\r\n",
                "Event: Bogus\r\nChannel: c\r\n\r\n",
            )),
            BatchId(1),
        );
        assert_eq!(reg.snapshot().len(), 3);

        assert_eq!(reg.drop_buckets(&["Hangup"]), 1);
        let snapshot = reg.snapshot();
        assert!(!snapshot.contains_key("Hangup"));
        assert!(reg.bucket("Hangup").is_some());

        assert_eq!(reg.drop_all_except(&[ALIEN_BUCKET]), 1);
        let snapshot = reg.snapshot();
        assert_eq!(snapshot.keys().copied().collect::<Vec<_>>(), vec![ALIEN_BUCKET]);
    }

    #[test]
    fn arrival_sort_restores_order_across_buckets() {
        let mut reg = registry();
        reg.ingest(
            frame("Response: Success\r\nActionID: q\r\n\r\nEvent: PeerEntry\r\nActionID: q\r\n\r\n"),
            BatchId(1),
        );
        reg.ingest(
            frame("Event: PeerlistComplete\r\nActionID: q\r\n\r\n"),
            BatchId(2),
        );

        let mut events = reg
            .snapshot()
            .values()
            .rev()
            .flat_map(|bucket| bucket.iter().cloned())
            .collect::<Vec<_>>();
        sort_by_arrival(&mut events);
        let order = events
            .iter()
            .map(|event| event.name().or(event.response()).unwrap_or_default().to_string())
            .collect::<Vec<_>>();
        assert_eq!(order, vec!["Success", "PeerEntry", "PeerlistComplete"]);

        let correlated = reg.by_action_id("q");
        assert_eq!(correlated.len(), 3);
        assert_eq!(correlated[2].name(), Some("PeerlistComplete"));
    }

    #[test]
    fn batch_clock_is_strictly_increasing() {
        let mut clock = BatchClock::after(Some(BatchId(i64::MAX - 10)));
        let a = clock.next();
        let b = clock.next();
        assert!(b > a);
        assert_eq!(a, BatchId(i64::MAX - 9));
    }
}

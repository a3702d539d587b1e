use super::element::QueueElement;
use crate::operation::{ItemId, OperationKind};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Sequence key inside a lane. Front inserts take negative keys, appends take
/// non-negative keys, so ascending key order is queue order.
pub type SlotKey = i64;

/// The four queues a worker keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueSlot {
    Waiting,
    Adding,
    Updating,
    Removing,
}

impl QueueSlot {
    pub fn for_kind(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Add => QueueSlot::Adding,
            OperationKind::Update => QueueSlot::Updating,
            OperationKind::Delete => QueueSlot::Removing,
        }
    }

    /// Precedence used when a delete searches for work to cancel.
    fn cancellation_rank(self) -> Option<u8> {
        match self {
            QueueSlot::Adding => Some(0),
            QueueSlot::Updating => Some(1),
            QueueSlot::Waiting => Some(2),
            QueueSlot::Removing => None,
        }
    }
}

/// Location of a live element.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub slot: QueueSlot,
    pub key: SlotKey,
    pub element: Arc<QueueElement>,
}

#[derive(Debug, Default)]
struct Lane {
    entries: BTreeMap<SlotKey, Arc<QueueElement>>,
    next_back: SlotKey,
    next_front: SlotKey,
}

impl Lane {
    fn push_back(&mut self, element: Arc<QueueElement>) -> SlotKey {
        let key = self.next_back;
        self.next_back += 1;
        self.entries.insert(key, element);
        key
    }

    fn push_front(&mut self, element: Arc<QueueElement>) -> SlotKey {
        self.next_front -= 1;
        let key = self.next_front;
        self.entries.insert(key, element);
        key
    }
}

/// Per-worker queues plus an index from item identity to the live entries for that item.
///
/// `dispatched_bytes` covers the adding, updating and removing lanes. Parked (waiting)
/// elements are not counted until they are promoted.
#[derive(Debug, Default)]
pub struct DispatchQueues {
    waiting: Lane,
    adding: Lane,
    updating: Lane,
    removing: Lane,
    index: HashMap<ItemId, Vec<(QueueSlot, SlotKey)>>,
    dispatched_bytes: usize,
}

impl DispatchQueues {
    pub fn new() -> Self {
        Self::default()
    }

    fn lane(&self, slot: QueueSlot) -> &Lane {
        match slot {
            QueueSlot::Waiting => &self.waiting,
            QueueSlot::Adding => &self.adding,
            QueueSlot::Updating => &self.updating,
            QueueSlot::Removing => &self.removing,
        }
    }

    fn lane_mut(&mut self, slot: QueueSlot) -> &mut Lane {
        match slot {
            QueueSlot::Waiting => &mut self.waiting,
            QueueSlot::Adding => &mut self.adding,
            QueueSlot::Updating => &mut self.updating,
            QueueSlot::Removing => &mut self.removing,
        }
    }

    fn insert(&mut self, slot: QueueSlot, element: Arc<QueueElement>, front: bool) -> QueueEntry {
        let item = element.item();
        let size = element.size();
        let lane = self.lane_mut(slot);
        let key = if front {
            lane.push_front(element.clone())
        } else {
            lane.push_back(element.clone())
        };

        if slot != QueueSlot::Waiting {
            self.dispatched_bytes = self.dispatched_bytes.saturating_add(size);
        }
        self.index.entry(item).or_default().push((slot, key));

        QueueEntry { slot, key, element }
    }

    /// Admits an element to the dispatch lane for its kind.
    pub fn enqueue(&mut self, element: Arc<QueueElement>, front: bool) -> QueueEntry {
        let slot = QueueSlot::for_kind(element.kind());
        self.insert(slot, element, front)
    }

    /// Parks an element on the unbounded waiting queue.
    pub fn park(&mut self, element: Arc<QueueElement>) -> QueueEntry {
        self.insert(QueueSlot::Waiting, element, false)
    }

    pub fn remove(&mut self, slot: QueueSlot, key: SlotKey) -> Option<Arc<QueueElement>> {
        let element = self.lane_mut(slot).entries.remove(&key)?;

        if slot != QueueSlot::Waiting {
            self.dispatched_bytes = self.dispatched_bytes.saturating_sub(element.size());
        }

        let item = element.item();
        if let Some(locations) = self.index.get_mut(&item) {
            locations.retain(|&(s, k)| !(s == slot && k == key));
            if locations.is_empty() {
                self.index.remove(&item);
            }
        }

        Some(element)
    }

    /// Live entries for `item` that a delete may cancel, in search order: adding, then
    /// updating, then waiting, each in queue order.
    pub fn cancellation_candidates(&self, item: ItemId) -> Vec<QueueEntry> {
        let Some(locations) = self.index.get(&item) else {
            return Vec::new();
        };

        let mut ranked: Vec<(u8, SlotKey, QueueSlot)> = locations
            .iter()
            .filter_map(|&(slot, key)| slot.cancellation_rank().map(|rank| (rank, key, slot)))
            .collect();
        ranked.sort_unstable_by_key(|&(rank, key, _)| (rank, key));

        ranked
            .into_iter()
            .filter_map(|(_, key, slot)| {
                self.lane(slot)
                    .entries
                    .get(&key)
                    .map(|element| QueueEntry {
                        slot,
                        key,
                        element: element.clone(),
                    })
            })
            .collect()
    }

    pub fn front_waiting(&self) -> Option<QueueEntry> {
        self.waiting
            .entries
            .iter()
            .next()
            .map(|(&key, element)| QueueEntry {
                slot: QueueSlot::Waiting,
                key,
                element: element.clone(),
            })
    }

    /// Moves a waiting element to the back of its dispatch lane.
    pub fn promote(&mut self, key: SlotKey) -> Option<QueueEntry> {
        let element = self.remove(QueueSlot::Waiting, key)?;
        Some(self.enqueue(element, false))
    }

    pub fn drain_waiting(&mut self) -> Vec<Arc<QueueElement>> {
        let keys: Vec<SlotKey> = self.waiting.entries.keys().copied().collect();
        keys.into_iter()
            .filter_map(|key| self.remove(QueueSlot::Waiting, key))
            .collect()
    }

    /// Entries of one lane in queue order.
    pub fn entries(&self, slot: QueueSlot) -> impl Iterator<Item = QueueEntry> + '_ {
        self.lane(slot)
            .entries
            .iter()
            .map(move |(&key, element)| QueueEntry {
                slot,
                key,
                element: element.clone(),
            })
    }

    pub fn waiting_elements(&self) -> impl Iterator<Item = &Arc<QueueElement>> + '_ {
        self.waiting.entries.values()
    }

    pub fn len(&self, slot: QueueSlot) -> usize {
        self.lane(slot).entries.len()
    }

    /// Elements in the three dispatch lanes.
    pub fn queued_len(&self) -> usize {
        self.adding.entries.len() + self.updating.entries.len() + self.removing.entries.len()
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.entries.len()
    }

    pub fn has_waiting(&self) -> bool {
        !self.waiting.entries.is_empty()
    }

    pub fn dispatched_bytes(&self) -> usize {
        self.dispatched_bytes
    }

    pub fn tracked_items(&self) -> usize {
        self.index.len()
    }
}

// src/registry.rs
//
// Peer Connection Registry: remote session id → live connection.
//
// ─ Concurrency ──────────────────────────────────────────────────────────────
//
//   * The slot for a remote id is claimed under a synchronous lock before
//     anything is awaited.  Concurrent `ensure` calls for the same id share
//     the slot's `OnceCell` and therefore one construction.
//
//   * Every slot carries a generation number.  Callbacks, closes and
//     failure handling compare generations so that work for a connection
//     that has since been replaced never touches its successor.
//
//   * Each entry has an async negotiation lock.  Applying a remote
//     description, draining the candidate queue and attaching tracks all
//     happen under it, which makes "remote description set" and "queue
//     drained" a single step as seen by `add_candidate`.
//
// ────────────────────────────────────────────────────────────────────────────

use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, MutexGuard, OnceCell};
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::candidates::CandidateBuffer;
use crate::error::PeerError;
use crate::media::LocalMedia;
use crate::peer::{PeerEventSink, PeerFactory, PeerLink, PeerSignal, SessionDescription};

// ---------------------------------------------------------------------------
// PeerEntry
// ---------------------------------------------------------------------------

/// A registered connection to one remote session.
pub struct PeerEntry {
    remote_id: String,
    generation: u64,
    link: Arc<dyn PeerLink>,
    negotiation: tokio::sync::Mutex<()>,
    tracks_attached: AtomicBool,
}

impl PeerEntry {
    fn new(remote_id: &str, generation: u64, link: Arc<dyn PeerLink>) -> Self {
        Self {
            remote_id: remote_id.to_string(),
            generation,
            link,
            negotiation: tokio::sync::Mutex::new(()),
            tracks_attached: AtomicBool::new(false),
        }
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn link(&self) -> &Arc<dyn PeerLink> {
        &self.link
    }

    /// Serialise with every other negotiation step on this connection.
    pub async fn begin(&self) -> Negotiation<'_> {
        Negotiation {
            entry: self,
            _guard: self.negotiation.lock().await,
        }
    }
}

/// Proof that the caller holds an entry's negotiation lock.
pub struct Negotiation<'a> {
    entry: &'a PeerEntry,
    _guard: MutexGuard<'a, ()>,
}

impl Negotiation<'_> {
    pub fn entry(&self) -> &PeerEntry {
        self.entry
    }

    pub fn link(&self) -> &Arc<dyn PeerLink> {
        &self.entry.link
    }

    /// Attach the current local tracks, read from the shared media state at
    /// this moment.  Runs once per connection; later calls return 0.
    pub async fn attach_tracks(&self, media: &LocalMedia) -> Result<usize, PeerError> {
        if self.entry.tracks_attached.load(Ordering::Acquire) {
            return Ok(0);
        }
        let tracks = media.tracks();
        for track in &tracks {
            self.entry.link.add_track(track).await?;
        }
        self.entry.tracks_attached.store(true, Ordering::Release);
        Ok(tracks.len())
    }
}

// ---------------------------------------------------------------------------
// PeerRegistry
// ---------------------------------------------------------------------------

/// What happened to a candidate handed to [`PeerRegistry::add_candidate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    Applied,
    Queued,
    Dropped,
}

#[derive(Clone)]
struct Slot {
    generation: u64,
    cell: Arc<OnceCell<Arc<PeerEntry>>>,
}

impl Slot {
    fn entry(&self) -> Option<Arc<PeerEntry>> {
        self.cell.get().cloned()
    }

    fn is_closed(&self) -> bool {
        self.cell.get().map_or(false, |e| e.link.is_closed())
    }
}

struct RegistryState {
    slots: HashMap<String, Slot>,
    candidates: CandidateBuffer,
}

impl RegistryState {
    fn is_current(&self, remote_id: &str, generation: u64) -> bool {
        self.slots
            .get(remote_id)
            .map_or(false, |s| s.generation == generation)
    }
}

/// Owns every peer connection of one mesh session.
pub struct PeerRegistry {
    factory: Arc<dyn PeerFactory>,
    events: mpsc::UnboundedSender<PeerSignal>,
    state: Mutex<RegistryState>,
    next_generation: AtomicU64,
}

impl PeerRegistry {
    pub fn new(
        factory: Arc<dyn PeerFactory>,
        events: mpsc::UnboundedSender<PeerSignal>,
        candidate_limit: usize,
    ) -> Self {
        Self {
            factory,
            events,
            state: Mutex::new(RegistryState {
                slots: HashMap::new(),
                candidates: CandidateBuffer::new(candidate_limit),
            }),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Return the live connection for `remote_id`, building one if needed.
    ///
    /// A closed entry is never returned: it is replaced by a fresh
    /// connection under a new generation.
    pub async fn ensure(&self, remote_id: &str) -> Result<Arc<PeerEntry>, PeerError> {
        let slot = {
            let mut state = self.state.lock();
            match state.slots.get(remote_id) {
                Some(slot) if !slot.is_closed() => slot.clone(),
                _ => {
                    let slot = Slot {
                        generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
                        cell: Arc::new(OnceCell::new()),
                    };
                    state.slots.insert(remote_id.to_string(), slot.clone());
                    slot
                }
            }
        };
        let generation = slot.generation;

        let built = slot
            .cell
            .get_or_try_init(|| async {
                let sink = PeerEventSink::new(remote_id, generation, self.events.clone());
                let link = self.factory.create(sink).await?;
                debug!(remote_id, generation, "peer connection created");
                Ok::<_, PeerError>(Arc::new(PeerEntry::new(remote_id, generation, link)))
            })
            .await;

        let entry = match built {
            Ok(entry) => entry.clone(),
            Err(e) => {
                let mut state = self.state.lock();
                let unbuilt = state
                    .slots
                    .get(remote_id)
                    .map_or(false, |s| s.generation == generation && s.cell.get().is_none());
                if unbuilt {
                    state.slots.remove(remote_id);
                }
                return Err(e);
            }
        };

        // Closed or replaced while the connection was being built.
        if !self.is_current(&entry) {
            let _ = entry.link.close().await;
            return Err(PeerError::Closed(remote_id.to_string()));
        }
        Ok(entry)
    }

    /// The live entry for `remote_id`, if any.
    pub fn get(&self, remote_id: &str) -> Option<Arc<PeerEntry>> {
        self.state
            .lock()
            .slots
            .get(remote_id)
            .and_then(Slot::entry)
            .filter(|e| !e.link.is_closed())
    }

    /// Whether `entry` is still the registered connection for its id.
    pub fn is_current(&self, entry: &PeerEntry) -> bool {
        self.holds(&entry.remote_id, entry.generation)
    }

    /// Whether `generation` is the registered connection for `remote_id`.
    pub fn holds(&self, remote_id: &str, generation: u64) -> bool {
        self.state.lock().is_current(remote_id, generation)
    }

    pub fn contains(&self, remote_id: &str) -> bool {
        self.get(remote_id).is_some()
    }

    /// Close and forget the connection and candidate queue for `remote_id`.
    /// Returns whether a connection was closed; absent ids are a no-op.
    pub async fn close(&self, remote_id: &str) -> bool {
        self.close_slot(remote_id, false).await
    }

    /// Close the connection for `remote_id` but keep its candidate queue for
    /// the connection that replaces it.
    ///
    /// Used when an offer collision is settled by answering: the remote keeps
    /// its offer, so the candidates it already sent belong to the answering
    /// connection.
    pub async fn close_keeping_candidates(&self, remote_id: &str) -> bool {
        self.close_slot(remote_id, true).await
    }

    async fn close_slot(&self, remote_id: &str, keep_candidates: bool) -> bool {
        let entry = {
            let mut state = self.state.lock();
            if !keep_candidates {
                let dropped = state.candidates.discard(remote_id);
                if dropped > 0 {
                    debug!(remote_id, dropped, "discarded pending candidates");
                }
            }
            state.slots.remove(remote_id).and_then(|s| s.entry())
        };
        match entry {
            Some(entry) => {
                shut(&entry).await;
                true
            }
            None => false,
        }
    }

    /// Close `remote_id` only if `generation` is still the registered one.
    pub async fn close_if_current(&self, remote_id: &str, generation: u64) -> bool {
        let entry = {
            let mut state = self.state.lock();
            if !state.is_current(remote_id, generation) {
                return false;
            }
            state.candidates.discard(remote_id);
            state.slots.remove(remote_id).and_then(|s| s.entry())
        };
        if let Some(entry) = entry {
            shut(&entry).await;
        }
        true
    }

    /// Forget every connection and candidate queue without awaiting.
    ///
    /// The returned entries are no longer reachable through the registry;
    /// the caller is responsible for closing them.
    pub fn detach_all(&self) -> Vec<Arc<PeerEntry>> {
        let mut state = self.state.lock();
        state.candidates.clear();
        state
            .slots
            .drain()
            .filter_map(|(_, slot)| slot.entry())
            .collect()
    }

    /// Close every connection (room exit).
    pub async fn close_all(&self) -> usize {
        let entries = self.detach_all();
        let count = entries.len();
        close_detached(entries).await;
        if count > 0 {
            info!(count, "closed all peer connections");
        }
        count
    }

    /// All live entries, in no particular order.
    pub fn entries(&self) -> Vec<Arc<PeerEntry>> {
        self.state
            .lock()
            .slots
            .values()
            .filter_map(Slot::entry)
            .filter(|e| !e.link.is_closed())
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries()
            .iter()
            .map(|e| e.remote_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_candidates(&self, remote_id: &str) -> usize {
        self.state.lock().candidates.pending(remote_id)
    }

    // ── ICE candidates ──────────────────────────────────────────────────

    /// Apply a remote candidate now if its connection already has a remote
    /// description, otherwise queue it until one is applied.
    pub async fn add_candidate(
        &self,
        remote_id: &str,
        candidate: RTCIceCandidateInit,
    ) -> Result<CandidateDisposition, PeerError> {
        let entry = {
            let mut state = self.state.lock();
            match state.slots.get(remote_id).and_then(Slot::entry) {
                Some(entry) => entry,
                None => return Ok(queue(&mut state, remote_id, candidate)),
            }
        };

        let negotiation = entry.begin().await;
        if entry.link.is_closed() || !self.is_current(&entry) {
            debug!(remote_id, "candidate for a closed connection dropped");
            return Ok(CandidateDisposition::Dropped);
        }
        if negotiation.link().has_remote_description().await {
            negotiation.link().add_ice_candidate(candidate).await?;
            return Ok(CandidateDisposition::Applied);
        }

        let mut state = self.state.lock();
        if !state.is_current(remote_id, entry.generation) {
            return Ok(CandidateDisposition::Dropped);
        }
        Ok(queue(&mut state, remote_id, candidate))
    }

    /// Set the remote description, then apply every queued candidate for
    /// this connection in arrival order.  Returns how many were drained.
    pub async fn apply_remote_description(
        &self,
        negotiation: &Negotiation<'_>,
        desc: SessionDescription,
    ) -> Result<usize, PeerError> {
        negotiation.link().set_remote_description(desc).await?;

        let entry = negotiation.entry();
        let queued = {
            let mut state = self.state.lock();
            if state.is_current(&entry.remote_id, entry.generation) {
                state.candidates.take(&entry.remote_id)
            } else {
                Vec::new()
            }
        };

        let drained = queued.len();
        for candidate in queued {
            if let Err(e) = negotiation.link().add_ice_candidate(candidate).await {
                warn!(remote_id = %entry.remote_id, error = %e, "queued candidate rejected");
            }
        }
        if drained > 0 {
            debug!(remote_id = %entry.remote_id, drained, "candidate queue drained");
        }
        Ok(drained)
    }
}

fn queue(
    state: &mut RegistryState,
    remote_id: &str,
    candidate: RTCIceCandidateInit,
) -> CandidateDisposition {
    if state.candidates.push(remote_id, candidate) {
        CandidateDisposition::Queued
    } else {
        CandidateDisposition::Dropped
    }
}

async fn shut(entry: &PeerEntry) {
    match entry.link.close().await {
        Ok(()) => info!(remote_id = %entry.remote_id, generation = entry.generation, "peer connection closed"),
        Err(e) => warn!(remote_id = %entry.remote_id, error = %e, "peer connection close failed"),
    }
}

/// Close entries previously taken out with [`PeerRegistry::detach_all`].
pub async fn close_detached(entries: Vec<Arc<PeerEntry>>) {
    join_all(entries.iter().map(|e| shut(e))).await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

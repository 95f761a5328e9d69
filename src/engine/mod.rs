mod availability;
mod conflict;
mod error;
mod mutations;
mod overlap;
mod pricing;
mod queries;

pub use availability::summarize;
pub use conflict::now_ms;
pub use error::EngineError;
pub use overlap::{conflicts, OverlapPolicy};
pub use pricing::quote;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedPropertyState = Arc<RwLock<PropertyState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued behind it.
/// 3. One fsync for the whole batch.
/// 4. Answer every sender with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                // Non-append commands run strictly after the appends queued before them.
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so half-buffered bytes from a failed
    // batch never prefix the next one.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let result = wal.append_buffered(&event).and_then(|()| wal.flush_sync());
            let _ = response.send(result);
        }
    }
}

// ── Engine ───────────────────────────────────────────────

/// In-memory marketplace for one tenant, backed by its WAL.
///
/// Every mutation is appended to the WAL before it becomes visible. Each
/// property and its bookings live behind one `RwLock`; booking writers hold
/// it from the conflict scan until the event is applied.
pub struct Engine {
    pub(super) properties: DashMap<Ulid, SharedPropertyState>,
    pub(super) users: DashMap<Ulid, User>,
    /// Lowercased email → user id.
    pub(super) emails: DashMap<String, Ulid>,
    pub(super) booking_to_property: DashMap<Ulid, Ulid>,
    pub(super) guest_bookings: DashMap<Ulid, Vec<Ulid>>,
    pub(super) owner_properties: DashMap<Ulid, Vec<Ulid>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Serializes creation of users and properties (id/email uniqueness).
    pub(super) registry: Mutex<()>,
    /// Mutations hold it shared; compaction takes it exclusively so the
    /// snapshot it writes cannot miss an in-flight append.
    pub(super) compaction_gate: RwLock<()>,
    overlap: OverlapPolicy,
}

/// Apply a property-scoped event. Caller holds the property's write lock.
fn apply_to_property(ps: &mut PropertyState, event: &Event) {
    match event {
        Event::PropertyUpdated {
            name,
            description,
            location,
            price,
            amenities,
            images,
            ..
        } => {
            let p = &mut ps.property;
            p.name = name.clone();
            p.description = description.clone();
            p.location = location.clone();
            p.price = *price;
            p.amenities = amenities.clone();
            p.images = images.clone();
        }
        Event::BookingCreated {
            id,
            property_id,
            guest_id,
            span,
            total_price,
        } => {
            ps.insert_booking(Booking {
                id: *id,
                property_id: *property_id,
                guest_id: *guest_id,
                span: *span,
                total_price: *total_price,
                status: BookingStatus::Pending,
            });
        }
        Event::BookingStatusChanged { id, status, .. } => {
            if let Some(booking) = ps.booking_mut(id) {
                booking.status = *status;
            }
        }
        // Handled at the map level.
        Event::UserRegistered { .. } | Event::PropertyCreated { .. } => {}
    }
}

/// The property an event belongs to, for property-scoped events.
fn event_property_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::PropertyUpdated { id, .. } => Some(*id),
        Event::BookingCreated { property_id, .. } | Event::BookingStatusChanged { property_id, .. } => {
            Some(*property_id)
        }
        Event::UserRegistered { .. } | Event::PropertyCreated { .. } => None,
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, overlap: OverlapPolicy) -> io::Result<Self> {
        let (wal, events) = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            properties: DashMap::new(),
            users: DashMap::new(),
            emails: DashMap::new(),
            booking_to_property: DashMap::new(),
            guest_bookings: DashMap::new(),
            owner_properties: DashMap::new(),
            wal_tx,
            registry: Mutex::new(()),
            compaction_gate: RwLock::new(()),
            overlap,
        };

        // Rebuild plain states first; nothing else can see them yet, so no
        // locking is involved until they are wrapped at the end.
        let mut states: HashMap<Ulid, PropertyState> = HashMap::new();
        for event in &events {
            match event {
                Event::UserRegistered { user } => engine.index_user(user.clone()),
                Event::PropertyCreated { property } => {
                    engine.index_property(property);
                    states.insert(property.id, PropertyState::new(property.clone()));
                }
                other => {
                    if let Some(pid) = event_property_id(other)
                        && let Some(ps) = states.get_mut(&pid)
                    {
                        apply_to_property(ps, other);
                        engine.index_event(other);
                    }
                }
            }
        }
        for (id, ps) in states {
            engine.properties.insert(id, Arc::new(RwLock::new(ps)));
        }

        Ok(engine)
    }

    pub fn overlap_policy(&self) -> OverlapPolicy {
        self.overlap
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_property_state(&self, id: &Ulid) -> Option<SharedPropertyState> {
        self.properties.get(id).map(|e| e.value().clone())
    }

    pub fn property_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_property.get(booking_id).map(|e| *e.value())
    }

    /// WAL-append then apply, under the caller's property write lock.
    pub(super) async fn persist_and_apply(&self, ps: &mut PropertyState, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_property(ps, event);
        self.index_event(event);
        Ok(())
    }

    fn index_user(&self, user: User) {
        self.emails.insert(user.email.to_lowercase(), user.id);
        self.users.insert(user.id, user);
    }

    fn index_property(&self, property: &Property) {
        self.owner_properties
            .entry(property.owner_id)
            .or_default()
            .push(property.id);
    }

    fn index_event(&self, event: &Event) {
        if let Event::BookingCreated {
            id,
            property_id,
            guest_id,
            ..
        } = event
        {
            self.booking_to_property.insert(*id, *property_id);
            let mut ids = self.guest_bookings.entry(*guest_id).or_default();
            if !ids.contains(id) {
                ids.push(*id);
            }
        }
    }
}

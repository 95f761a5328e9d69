use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Stay range in Unix milliseconds. Always `start < end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// `None` unless `start < end`.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// `start <= t <= end`.
    pub fn contains_inclusive(&self, t: Ms) -> bool {
        self.start <= t && t <= self.end
    }

    /// `start < t < end`.
    pub fn contains_strict(&self, t: Ms) -> bool {
        self.start < t && t < self.end
    }
}

// ── Enumerations ─────────────────────────────────────────────────

/// Booking lifecycle. The lowercase tokens are part of the wire and WAL format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
        }
    }

    /// Anything but cancelled takes part in conflict checks.
    pub fn is_active(&self) -> bool {
        !matches!(self, BookingStatus::Cancelled)
    }

    /// Pending and confirmed bookings occupy the calendar for availability
    /// and upcoming counts.
    pub fn occupies(&self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "cancelled" => Ok(BookingStatus::Cancelled),
            "completed" => Ok(BookingStatus::Completed),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Guest,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Guest => "guest",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(Role::Owner),
            "guest" => Ok(Role::Guest),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

// ── Entities ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub email: String,
    pub name: String,
    pub role: Role,
    pub phone: String,
    pub address: String,
    pub business_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub name: String,
    pub description: String,
    pub location: String,
    /// Nightly rate.
    pub price: f64,
    pub amenities: String,
    pub images: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub property_id: Ulid,
    pub guest_id: Ulid,
    pub span: Span,
    pub total_price: f64,
    pub status: BookingStatus,
}

/// A property plus every booking ever made on it, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct PropertyState {
    pub property: Property,
    pub bookings: Vec<Booking>,
}

impl PropertyState {
    pub fn new(property: Property) -> Self {
        Self {
            property,
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.span.start <= booking.span.start);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    pub fn booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }
}

/// The event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        user: User,
    },
    PropertyCreated {
        property: Property,
    },
    PropertyUpdated {
        id: Ulid,
        name: String,
        description: String,
        location: String,
        price: f64,
        amenities: String,
        images: Vec<String>,
    },
    BookingCreated {
        id: Ulid,
        property_id: Ulid,
        guest_id: Ulid,
        span: Span,
        total_price: f64,
    },
    BookingStatusChanged {
        id: Ulid,
        property_id: Ulid,
        status: BookingStatus,
    },
}

// ── Inputs ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub email: String,
    pub name: String,
    pub role: Role,
    pub phone: String,
    pub address: String,
    pub business_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewProperty {
    pub name: String,
    pub description: String,
    pub location: String,
    pub price: f64,
    pub amenities: String,
    pub images: Vec<String>,
}

/// Replacement descriptive fields. `images: None` keeps the current list.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyUpdate {
    pub name: String,
    pub description: String,
    pub location: String,
    pub price: f64,
    pub amenities: String,
    pub images: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyFilter {
    /// Case-insensitive substring of `location`.
    pub location: Option<String>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
}

impl PropertyFilter {
    pub fn matches(&self, property: &Property) -> bool {
        if let Some(ref needle) = self.location
            && !property
                .location
                .to_lowercase()
                .contains(&needle.to_lowercase())
        {
            return false;
        }
        if self.min_price.is_some_and(|min| property.price < min) {
            return false;
        }
        if self.max_price.is_some_and(|max| property.price > max) {
            return false;
        }
        true
    }
}

// ── Query result types ───────────────────────────────────────────

/// Who a statistics summary is for. Decides the label of the amount and
/// whether availability is computed at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Viewer {
    Owner,
    Guest,
}

impl Viewer {
    pub fn amount_label(&self) -> &'static str {
        match self {
            Viewer::Owner => "total_revenue",
            Viewer::Guest => "total_spent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailabilitySnapshot {
    pub is_available: bool,
    pub next_available_date: Option<Ms>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BookingStats {
    pub total_bookings: usize,
    /// Revenue for owners, spend for guests.
    pub total_amount: f64,
    pub upcoming_bookings: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    /// `None` for guest views.
    pub availability: Option<AvailabilitySnapshot>,
    pub statistics: BookingStats,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertySummary {
    pub id: Ulid,
    pub name: String,
    pub description: String,
    pub location: String,
    pub price: f64,
    pub amenities: String,
}

impl From<&Property> for PropertySummary {
    fn from(p: &Property) -> Self {
        Self {
            id: p.id,
            name: p.name.clone(),
            description: p.description.clone(),
            location: p.location.clone(),
            price: p.price,
            amenities: p.amenities.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GuestBookingView {
    pub id: Ulid,
    pub property: PropertySummary,
    pub start: Ms,
    pub end: Ms,
    pub status: BookingStatus,
    pub total_price: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OwnerBookingView {
    pub id: Ulid,
    pub guest_id: Ulid,
    pub guest_name: String,
    pub start: Ms,
    pub end: Ms,
    pub status: BookingStatus,
    pub total_price: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GuestBookingSummary {
    pub bookings: Vec<GuestBookingView>,
    pub statistics: BookingStats,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OwnerPropertyDetail {
    pub property: Property,
    pub availability: AvailabilitySnapshot,
    pub booking_history: Vec<OwnerBookingView>,
    pub statistics: BookingStats,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyOverview {
    pub property: Property,
    pub availability: AvailabilitySnapshot,
    pub statistics: BookingStats,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Dashboard {
    Owner {
        properties: Vec<PropertyOverview>,
    },
    Guest {
        bookings: Vec<GuestBookingView>,
        statistics: BookingStats,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn property() -> Property {
        Property {
            id: Ulid::new(),
            owner_id: Ulid::new(),
            name: "Beach House".into(),
            description: "Beachfront".into(),
            location: "Bali, Indonesia".into(),
            price: 200.0,
            amenities: "WiFi, Pool".into(),
            images: vec![],
        }
    }

    fn booking(start: Ms, end: Ms, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            property_id: Ulid::new(),
            guest_id: Ulid::new(),
            span: Span::new(start, end),
            total_price: 0.0,
            status,
        }
    }

    #[test]
    fn span_containment() {
        let s = Span::new(100, 200);
        assert!(s.contains_inclusive(100));
        assert!(s.contains_inclusive(200));
        assert!(!s.contains_inclusive(201));
        assert!(!s.contains_strict(100));
        assert!(s.contains_strict(150));
        assert!(!s.contains_strict(200));
    }

    #[test]
    fn span_try_new_rejects_empty_and_inverted() {
        assert!(Span::try_new(100, 100).is_none());
        assert!(Span::try_new(200, 100).is_none());
        assert_eq!(Span::try_new(100, 101), Some(Span::new(100, 101)));
    }

    #[test]
    fn status_tokens_are_lowercase_literals() {
        for status in [
            BookingStatus::Pending,
            BookingStatus::Confirmed,
            BookingStatus::Cancelled,
            BookingStatus::Completed,
        ] {
            assert_eq!(status.as_str().parse::<BookingStatus>(), Ok(status));
        }
        assert!("Confirmed".parse::<BookingStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&BookingStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
    }

    #[test]
    fn only_cancelled_is_inactive() {
        assert!(BookingStatus::Pending.is_active());
        assert!(BookingStatus::Completed.is_active());
        assert!(!BookingStatus::Cancelled.is_active());
        assert!(!BookingStatus::Completed.occupies());
    }

    #[test]
    fn bookings_kept_sorted_by_start() {
        let mut ps = PropertyState::new(property());
        ps.insert_booking(booking(300, 400, BookingStatus::Pending));
        ps.insert_booking(booking(100, 200, BookingStatus::Confirmed));
        ps.insert_booking(booking(200, 300, BookingStatus::Cancelled));
        let starts: Vec<Ms> = ps.bookings.iter().map(|b| b.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
        assert_eq!(ps.bookings.iter().filter(|b| b.status.is_active()).count(), 2);
    }

    #[test]
    fn booking_lookup_by_id() {
        let mut ps = PropertyState::new(property());
        let b = booking(100, 200, BookingStatus::Pending);
        let id = b.id;
        ps.insert_booking(b);
        assert!(ps.booking(&id).is_some());
        ps.booking_mut(&id).unwrap().status = BookingStatus::Confirmed;
        assert_eq!(ps.booking(&id).unwrap().status, BookingStatus::Confirmed);
        assert!(ps.booking(&Ulid::new()).is_none());
    }

    #[test]
    fn filter_location_is_case_insensitive_substring() {
        let p = property();
        let f = PropertyFilter {
            location: Some("bali".into()),
            ..Default::default()
        };
        assert!(f.matches(&p));
        let f = PropertyFilter {
            location: Some("alps".into()),
            ..Default::default()
        };
        assert!(!f.matches(&p));
    }

    #[test]
    fn filter_price_bounds_inclusive() {
        let p = property();
        let f = PropertyFilter {
            min_price: Some(200.0),
            max_price: Some(200.0),
            ..Default::default()
        };
        assert!(f.matches(&p));
        let f = PropertyFilter {
            max_price: Some(199.99),
            ..Default::default()
        };
        assert!(!f.matches(&p));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::PropertyCreated { property: property() };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}

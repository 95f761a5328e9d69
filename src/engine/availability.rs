use crate::model::*;

// ── Availability & statistics ─────────────────────────────────────

/// Single pass over a booking set.
///
/// Every booking, whatever its status, counts toward `total_bookings` and
/// `total_amount`. Only pending/confirmed bookings affect availability and
/// the upcoming count. When several occupying bookings straddle `now`, the
/// property is free again at the latest of their end dates.
///
/// Guests get statistics only; availability is computed for owners.
pub fn summarize<'a, I>(bookings: I, now: Ms, viewer: Viewer) -> Summary
where
    I: IntoIterator<Item = &'a Booking>,
{
    let mut statistics = BookingStats::default();
    let mut is_available = true;
    let mut next_available: Option<Ms> = None;

    for booking in bookings {
        statistics.total_bookings += 1;
        statistics.total_amount += booking.total_price;

        if !booking.status.occupies() {
            continue;
        }
        if booking.span.contains_strict(now) {
            is_available = false;
            if next_available.is_none_or(|cur| booking.span.end > cur) {
                next_available = Some(booking.span.end);
            }
        }
        if booking.span.start > now {
            statistics.upcoming_bookings += 1;
        }
    }

    let availability = match viewer {
        Viewer::Owner => Some(AvailabilitySnapshot {
            is_available,
            next_available_date: if is_available { None } else { next_available },
        }),
        Viewer::Guest => None,
    };

    Summary {
        availability,
        statistics,
    }
}

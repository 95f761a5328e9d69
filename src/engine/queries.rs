use ulid::Ulid;

use crate::model::*;

use super::availability::summarize;
use super::{Engine, EngineError};

impl Engine {
    pub fn get_user(&self, id: &Ulid) -> Option<User> {
        self.users.get(id).map(|u| u.value().clone())
    }

    pub async fn get_property(&self, id: &Ulid) -> Result<Property, EngineError> {
        let ps = self.get_property_state(id).ok_or(EngineError::NotFound(*id))?;
        let guard = ps.read().await;
        Ok(guard.property.clone())
    }

    /// Properties matching `filter`, sorted by id.
    pub async fn list_properties(&self, filter: &PropertyFilter) -> Vec<Property> {
        let states: Vec<_> = self.properties.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for ps in states {
            let guard = ps.read().await;
            if filter.matches(&guard.property) {
                out.push(guard.property.clone());
            }
        }
        out.sort_by_key(|p| p.id);
        out
    }

    /// Bookings on a property, by start date, skipping any status in `exclude`.
    pub async fn list_bookings_for_property(
        &self,
        property_id: &Ulid,
        exclude: &[BookingStatus],
    ) -> Result<Vec<Booking>, EngineError> {
        let ps = self
            .get_property_state(property_id)
            .ok_or(EngineError::NotFound(*property_id))?;
        let guard = ps.read().await;
        Ok(guard
            .bookings
            .iter()
            .filter(|b| !exclude.contains(&b.status))
            .cloned()
            .collect())
    }

    /// A guest's bookings with their properties, ordered by start date.
    async fn guest_bookings_with_property(&self, guest_id: &Ulid) -> Vec<(Booking, PropertySummary)> {
        let ids: Vec<Ulid> = self
            .guest_bookings
            .get(guest_id)
            .map(|ids| ids.value().clone())
            .unwrap_or_default();

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(ps) = self
                .property_for_booking(&id)
                .and_then(|pid| self.get_property_state(&pid))
            else {
                continue;
            };
            let guard = ps.read().await;
            if let Some(b) = guard.booking(&id) {
                out.push((b.clone(), PropertySummary::from(&guard.property)));
            }
        }
        out.sort_by_key(|(b, _)| (b.span.start, b.id));
        out
    }

    /// Every booking a guest has made, each with a summary of its property.
    pub async fn list_bookings_for_guest(&self, guest_id: &Ulid) -> Vec<GuestBookingView> {
        self.guest_bookings_with_property(guest_id)
            .await
            .into_iter()
            .map(guest_view)
            .collect()
    }

    pub async fn guest_booking_summary(&self, guest_id: Ulid, now: Ms) -> Result<GuestBookingSummary, EngineError> {
        if !self.users.contains_key(&guest_id) {
            return Err(EngineError::NotFound(guest_id));
        }
        let rows = self.guest_bookings_with_property(&guest_id).await;
        let statistics = summarize(rows.iter().map(|(b, _)| b), now, Viewer::Guest).statistics;
        let bookings = rows.into_iter().map(guest_view).collect();
        Ok(GuestBookingSummary { bookings, statistics })
    }

    /// Full history and live availability of a property, for its owner only.
    pub async fn owner_property_detail(
        &self,
        property_id: Ulid,
        owner_id: Ulid,
        now: Ms,
    ) -> Result<OwnerPropertyDetail, EngineError> {
        let ps = self
            .get_property_state(&property_id)
            .ok_or(EngineError::NotFound(property_id))?;
        if !self.users.contains_key(&owner_id) {
            return Err(EngineError::NotFound(owner_id));
        }
        let guard = ps.read().await;
        if guard.property.owner_id != owner_id {
            return Err(EngineError::Forbidden("property belongs to another owner"));
        }

        let Summary { availability, statistics } = summarize(&guard.bookings, now, Viewer::Owner);
        let booking_history = guard
            .bookings
            .iter()
            .map(|b| OwnerBookingView {
                id: b.id,
                guest_id: b.guest_id,
                guest_name: self
                    .users
                    .get(&b.guest_id)
                    .map(|u| u.name.clone())
                    .unwrap_or_default(),
                start: b.span.start,
                end: b.span.end,
                status: b.status,
                total_price: b.total_price,
            })
            .collect();

        Ok(OwnerPropertyDetail {
            property: guard.property.clone(),
            availability: availability.unwrap_or(AvailabilitySnapshot {
                is_available: true,
                next_available_date: None,
            }),
            booking_history,
            statistics,
        })
    }

    /// Role-specific landing view for `user_id`.
    pub async fn dashboard(&self, user_id: Ulid, now: Ms) -> Result<Dashboard, EngineError> {
        let role = self
            .users
            .get(&user_id)
            .map(|u| u.role)
            .ok_or(EngineError::NotFound(user_id))?;

        match role {
            Role::Owner => {
                let mut ids: Vec<Ulid> = self
                    .owner_properties
                    .get(&user_id)
                    .map(|ids| ids.value().clone())
                    .unwrap_or_default();
                ids.sort();

                let mut properties = Vec::with_capacity(ids.len());
                for id in ids {
                    let Some(ps) = self.get_property_state(&id) else {
                        continue;
                    };
                    let guard = ps.read().await;
                    let Summary { availability, statistics } = summarize(&guard.bookings, now, Viewer::Owner);
                    properties.push(PropertyOverview {
                        property: guard.property.clone(),
                        availability: availability.unwrap_or(AvailabilitySnapshot {
                            is_available: true,
                            next_available_date: None,
                        }),
                        statistics,
                    });
                }
                Ok(Dashboard::Owner { properties })
            }
            Role::Guest => {
                let GuestBookingSummary { bookings, statistics } = self.guest_booking_summary(user_id, now).await?;
                Ok(Dashboard::Guest { bookings, statistics })
            }
        }
    }
}

fn guest_view((b, property): (Booking, PropertySummary)) -> GuestBookingView {
    GuestBookingView {
        id: b.id,
        property,
        start: b.span.start,
        end: b.span.end,
        status: b.status,
        total_price: b.total_price,
    }
}

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, validate_stay};
use super::pricing::quote;
use super::{Engine, EngineError, WalCommand};

fn require_text(field: &str, value: &str, max: usize) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::Validation(format!("{field} is required")));
    }
    check_len(value, max)
}

fn check_len(value: &str, max: usize) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::LimitExceeded("field too long"));
    }
    Ok(())
}

/// `local@domain.tld`: one `@`, no whitespace, a dot inside the domain.
fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') || email.chars().any(char::is_whitespace) {
        return false;
    }
    match domain.rsplit_once('.') {
        Some((host, tld)) => !host.is_empty() && tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic()),
        None => false,
    }
}

fn validate_price(price: f64) -> Result<(), EngineError> {
    if !price.is_finite() || price < 0.0 {
        return Err(EngineError::Validation(format!("invalid price: {price}")));
    }
    Ok(())
}

fn validate_images(images: &[String]) -> Result<(), EngineError> {
    if images.len() > MAX_IMAGES_PER_PROPERTY {
        return Err(EngineError::LimitExceeded("too many images on property"));
    }
    for url in images {
        require_text("image_url", url, MAX_URL_LEN)?;
    }
    Ok(())
}

impl Engine {
    pub async fn register_user(&self, id: Ulid, new: NewUser) -> Result<User, EngineError> {
        require_text("name", &new.name, MAX_NAME_LEN)?;
        check_len(&new.email, MAX_EMAIL_LEN)?;
        if !is_valid_email(&new.email) {
            return Err(EngineError::Validation(format!("invalid email: {}", new.email)));
        }
        check_len(&new.phone, MAX_NAME_LEN)?;
        check_len(&new.address, MAX_TEXT_LEN)?;
        let business_name = match (new.role, new.business_name) {
            (Role::Owner, Some(b)) if !b.trim().is_empty() => {
                check_len(&b, MAX_NAME_LEN)?;
                Some(b)
            }
            (Role::Owner, _) => {
                return Err(EngineError::Validation("business_name is required for owners".into()));
            }
            (Role::Guest, b) => b.filter(|b| !b.trim().is_empty()),
        };

        let _gate = self.compaction_gate.read().await;
        let _registry = self.registry.lock().await;
        if self.users.len() >= MAX_USERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        if self.users.contains_key(&id) {
            return Err(EngineError::AlreadyExists(format!("user {id}")));
        }
        if self.emails.contains_key(&new.email.to_lowercase()) {
            return Err(EngineError::AlreadyExists(format!("email {}", new.email)));
        }

        let user = User {
            id,
            email: new.email,
            name: new.name,
            role: new.role,
            phone: new.phone,
            address: new.address,
            business_name,
        };
        let event = Event::UserRegistered { user: user.clone() };
        self.wal_append(&event).await?;
        self.index_user(user.clone());
        Ok(user)
    }

    /// Owner must exist and have the owner role.
    fn require_owner(&self, owner_id: &Ulid) -> Result<(), EngineError> {
        let role = self
            .users
            .get(owner_id)
            .map(|u| u.role)
            .ok_or(EngineError::NotFound(*owner_id))?;
        if role != Role::Owner {
            return Err(EngineError::Forbidden("only owners can manage properties"));
        }
        Ok(())
    }

    pub async fn create_property(&self, id: Ulid, owner_id: Ulid, new: NewProperty) -> Result<Property, EngineError> {
        require_text("name", &new.name, MAX_NAME_LEN)?;
        require_text("location", &new.location, MAX_NAME_LEN)?;
        check_len(&new.description, MAX_TEXT_LEN)?;
        check_len(&new.amenities, MAX_TEXT_LEN)?;
        validate_price(new.price)?;
        validate_images(&new.images)?;

        let _gate = self.compaction_gate.read().await;
        let _registry = self.registry.lock().await;
        self.require_owner(&owner_id)?;
        if self.properties.len() >= MAX_PROPERTIES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many properties"));
        }
        if self.properties.contains_key(&id) {
            return Err(EngineError::AlreadyExists(format!("property {id}")));
        }

        let property = Property {
            id,
            owner_id,
            name: new.name,
            description: new.description,
            location: new.location,
            price: new.price,
            amenities: new.amenities,
            images: new.images,
        };
        let event = Event::PropertyCreated { property: property.clone() };
        self.wal_append(&event).await?;
        self.index_property(&property);
        self.properties
            .insert(id, Arc::new(RwLock::new(PropertyState::new(property.clone()))));
        Ok(property)
    }

    /// Replace the descriptive fields of an owned property. `images: None`
    /// keeps the current list.
    pub async fn update_property(
        &self,
        id: Ulid,
        owner_id: Ulid,
        update: PropertyUpdate,
    ) -> Result<Property, EngineError> {
        require_text("name", &update.name, MAX_NAME_LEN)?;
        require_text("location", &update.location, MAX_NAME_LEN)?;
        check_len(&update.description, MAX_TEXT_LEN)?;
        check_len(&update.amenities, MAX_TEXT_LEN)?;
        validate_price(update.price)?;
        if let Some(ref images) = update.images {
            validate_images(images)?;
        }

        let _gate = self.compaction_gate.read().await;
        let ps = self.get_property_state(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = ps.write().await;
        if !self.users.contains_key(&owner_id) {
            return Err(EngineError::NotFound(owner_id));
        }
        if guard.property.owner_id != owner_id {
            return Err(EngineError::Forbidden("property belongs to another owner"));
        }

        let event = Event::PropertyUpdated {
            id,
            name: update.name,
            description: update.description,
            location: update.location,
            price: update.price,
            amenities: update.amenities,
            images: update.images.unwrap_or_else(|| guard.property.images.clone()),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(guard.property.clone())
    }

    pub async fn add_property_image(&self, property_id: Ulid, owner_id: Ulid, url: String) -> Result<Property, EngineError> {
        require_text("image_url", &url, MAX_URL_LEN)?;

        let _gate = self.compaction_gate.read().await;
        let ps = self
            .get_property_state(&property_id)
            .ok_or(EngineError::NotFound(property_id))?;
        let mut guard = ps.write().await;
        if !self.users.contains_key(&owner_id) {
            return Err(EngineError::NotFound(owner_id));
        }
        if guard.property.owner_id != owner_id {
            return Err(EngineError::Forbidden("property belongs to another owner"));
        }
        if guard.property.images.len() >= MAX_IMAGES_PER_PROPERTY {
            return Err(EngineError::LimitExceeded("too many images on property"));
        }

        let p = &guard.property;
        let mut images = p.images.clone();
        images.push(url);
        let event = Event::PropertyUpdated {
            id: property_id,
            name: p.name.clone(),
            description: p.description.clone(),
            location: p.location.clone(),
            price: p.price,
            amenities: p.amenities.clone(),
            images,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(guard.property.clone())
    }

    /// Reserve `[start, end]` on a property for a guest.
    ///
    /// The property write lock is held from the conflict scan through the
    /// WAL append, so of several overlapping concurrent requests at most one
    /// can succeed. The new booking starts out pending.
    pub async fn create_booking(
        &self,
        id: Ulid,
        property_id: Ulid,
        guest_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Booking, EngineError> {
        let span = validate_stay(start, end)?;

        let _gate = self.compaction_gate.read().await;
        let ps = self
            .get_property_state(&property_id)
            .ok_or(EngineError::NotFound(property_id))?;
        if !self.users.contains_key(&guest_id) {
            return Err(EngineError::NotFound(guest_id));
        }
        if self.booking_to_property.contains_key(&id) {
            return Err(EngineError::AlreadyExists(format!("booking {id}")));
        }

        let mut guard = ps.write().await;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_PROPERTY {
            return Err(EngineError::LimitExceeded("too many bookings on property"));
        }
        check_no_conflict(&guard, &span, self.overlap_policy(), None)?;
        let total_price = quote(guard.property.price, &span)?;

        // Claim the id; another property's lock does not cover it.
        match self.booking_to_property.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(format!("booking {id}"))),
            Entry::Vacant(slot) => {
                slot.insert(property_id);
            }
        }

        let event = Event::BookingCreated {
            id,
            property_id,
            guest_id,
            span,
            total_price,
        };
        if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
            self.booking_to_property.remove(&id);
            return Err(e);
        }
        guard
            .booking(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    /// Move a booking to `status` on behalf of `actor_id`.
    ///
    /// The property owner may set any status; the booking's guest may only
    /// cancel. Bringing a cancelled booking back re-checks its dates.
    pub async fn set_booking_status(
        &self,
        booking_id: Ulid,
        actor_id: Ulid,
        status: BookingStatus,
    ) -> Result<Booking, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let property_id = self
            .property_for_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let ps = self
            .get_property_state(&property_id)
            .ok_or(EngineError::NotFound(property_id))?;
        if !self.users.contains_key(&actor_id) {
            return Err(EngineError::NotFound(actor_id));
        }

        let mut guard = ps.write().await;
        let booking = guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;

        let is_owner = guard.property.owner_id == actor_id;
        let is_guest = booking.guest_id == actor_id;
        if !is_owner {
            if !is_guest {
                return Err(EngineError::Forbidden("not a party to this booking"));
            }
            if status != BookingStatus::Cancelled {
                return Err(EngineError::Forbidden("guests may only cancel"));
            }
        }

        if booking.status == status {
            return Ok(booking);
        }
        if !booking.status.is_active() && status.is_active() {
            check_no_conflict(&guard, &booking.span, self.overlap_policy(), Some(booking_id))?;
        }

        let event = Event::BookingStatusChanged {
            id: booking_id,
            property_id,
            status,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(Booking { status, ..booking })
    }

    /// Rewrite the WAL as the minimal event list that rebuilds current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.write().await;

        let mut users: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        let mut events: Vec<Event> = users.into_iter().map(|user| Event::UserRegistered { user }).collect();

        let mut states: Vec<_> = self
            .properties
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        states.sort_by_key(|(id, _)| *id);
        for (_, ps) in states {
            let guard = ps.read().await;
            events.push(Event::PropertyCreated {
                property: guard.property.clone(),
            });
            for b in &guard.bookings {
                events.push(Event::BookingCreated {
                    id: b.id,
                    property_id: b.property_id,
                    guest_id: b.guest_id,
                    span: b.span,
                    total_price: b.total_price,
                });
                if b.status != BookingStatus::Pending {
                    events.push(Event::BookingStatusChanged {
                        id: b.id,
                        property_id: b.property_id,
                        status: b.status,
                    });
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_shapes() {
        assert!(is_valid_email("ana@example.com"));
        assert!(is_valid_email("a.b+c@mail.example.org"));
        assert!(!is_valid_email("ana"));
        assert!(!is_valid_email("@example.com"));
        assert!(!is_valid_email("ana@example"));
        assert!(!is_valid_email("ana@.com"));
        assert!(!is_valid_email("ana@ex ample.com"));
        assert!(!is_valid_email("ana@@example.com"));
        assert!(!is_valid_email("ana@example.c"));
    }

    #[test]
    fn price_must_be_finite_and_non_negative() {
        assert!(validate_price(0.0).is_ok());
        assert!(validate_price(120.5).is_ok());
        assert!(validate_price(-0.01).is_err());
        assert!(validate_price(f64::NAN).is_err());
    }

    #[test]
    fn blank_text_rejected() {
        assert!(matches!(require_text("name", "  ", 10), Err(EngineError::Validation(_))));
        assert!(matches!(require_text("name", "abcdefghijk", 10), Err(EngineError::LimitExceeded(_))));
        assert!(require_text("name", "Ana", 10).is_ok());
    }
}

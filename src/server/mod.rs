//! The HTTP surface.
//!
//! Routes:
//! - `POST /reservations/{key}` - lock an existing entry without writing
//! - `PUT  /values/{key}` - create-if-absent, lock (or wait), write
//! - `POST /values/{key}/{lock_id}` - write under a held lock, optionally release

mod handlers;

use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    routing::{post, put},
};

use crate::{
    Turnstile, atomic::Atomics, entry::EntryStore, registry::TokenRegistry, waitlist::Waitlist,
};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub(crate) store: Arc<EntryStore>,
    pub(crate) locks: Arc<TokenRegistry>,
    pub(crate) atomics: Atomics,
    pub(crate) waitlist: Waitlist,
    pub(crate) acquire_timeout: Duration,
}

impl AppState {
    pub fn new(turnstile: &Turnstile, acquire_timeout: Duration) -> Self {
        Self {
            store: turnstile.store.clone(),
            locks: turnstile.locks.clone(),
            atomics: turnstile.atomics.clone(),
            waitlist: turnstile.waitlist.clone(),
            acquire_timeout,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/reservations/{key}", post(handlers::reserve_key))
        .route("/values/{key}", put(handlers::put_value))
        .route("/values/{key}/{lock_id}", post(handlers::update_value))
        .with_state(state)
}

use std::{collections::HashMap, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};

use crate::{base::TurnstileError, entry::Entry, registry::LOCK_ID_LEN, server::AppState};

/// CAS the fresh lock id onto the entry, falling back to a queued
/// acquisition when someone else holds the lock. Errors come back as the
/// status code to answer with.
async fn lock_or_wait(state: &AppState, entry: &Arc<Entry>, newid: &str) -> Result<(), StatusCode> {
    match state.atomics.set_lock_id(entry, newid).await {
        Ok(()) => {
            debug!(key = %entry.key(), id = %newid, "set the lock directly");
            Ok(())
        }
        Err(TurnstileError::AlreadyLocked(_)) => {
            match state.waitlist.acquire(entry, newid, state.acquire_timeout).await {
                Ok(()) => {
                    debug!(key = %entry.key(), id = %newid, "acquired the lock after waiting");
                    Ok(())
                }
                Err(err @ TurnstileError::AcquireTimedOut) => {
                    info!(key = %entry.key(), %err);
                    Err(StatusCode::REQUEST_TIMEOUT)
                }
                Err(err @ TurnstileError::DeletedWhileWaiting) => {
                    info!(key = %entry.key(), %err);
                    Err(StatusCode::NOT_FOUND)
                }
                Err(err) => {
                    error!(key = %entry.key(), %err, "lock acquisition failed");
                    Err(StatusCode::INTERNAL_SERVER_ERROR)
                }
            }
        }
        Err(err) => {
            error!(key = %entry.key(), %err, "lock write failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// `POST /reservations/{key}` - acquire the lock on an existing entry
/// without writing, returning the entry JSON with the fresh lock id.
pub(super) async fn reserve_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Response {
    info!(key = %key, "reservation request");

    let entry = match state.store.get(&key).await {
        Ok(entry) => entry,
        Err(_) => {
            info!(key = %key, "entry key not found");
            return StatusCode::NOT_FOUND.into_response();
        }
    };
    let _section = entry.exclusive().await;

    let newid = state.locks.mint(LOCK_ID_LEN).await;
    if let Err(status) = lock_or_wait(&state, &entry, &newid).await {
        return status.into_response();
    }

    match state.atomics.json(&entry).await {
        Ok(body) => {
            info!(key = %key, "handled reservation request");
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                body,
            )
                .into_response()
        }
        Err(err) => {
            error!(key = %key, %err, "could not marshal entry");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// `PUT /values/{key}` - create the entry if needed, lock it (waiting if
/// necessary), store the body as the new value, and return the lock id.
pub(super) async fn put_value(
    State(state): State<AppState>,
    Path(key): Path<String>,
    body: Bytes,
) -> Response {
    info!(key = %key, "put request");

    let entry = match state.store.get(&key).await {
        Ok(entry) => entry,
        Err(_) => {
            debug!(key = %key, "generating new entry");
            match state.store.create(&key).await {
                Ok(entry) => entry,
                // Lost a creation race; the other writer's entry is the one.
                Err(_) => match state.store.get(&key).await {
                    Ok(entry) => entry,
                    Err(err) => {
                        error!(key = %key, %err, "entry vanished during creation");
                        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                    }
                },
            }
        }
    };
    let _section = entry.exclusive().await;

    let value = String::from_utf8_lossy(&body).into_owned();
    debug!(key = %key, value = %value, "read request body");

    let newid = state.locks.mint(LOCK_ID_LEN).await;
    if let Err(status) = lock_or_wait(&state, &entry, &newid).await {
        return status.into_response();
    }

    if let Err(err) = state.atomics.set_value(&entry, value).await {
        error!(key = %key, %err, "could not store value");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let body = match serde_json::to_vec(&serde_json::json!({ "lock_id": newid })) {
        Ok(body) => body,
        Err(err) => {
            error!(key = %key, %err, "could not marshal lock id");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    info!(key = %key, "handled put request");
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

/// `POST /values/{key}/{lock_id}?release=` - overwrite the value while
/// holding the lock; `release=true` unlocks afterwards.
pub(super) async fn update_value(
    State(state): State<AppState>,
    Path((key, lock_id)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    info!(key = %key, "update request");

    let entry = match state.store.get(&key).await {
        Ok(entry) => entry,
        Err(_) => {
            info!(key = %key, "entry key not found");
            return StatusCode::NOT_FOUND.into_response();
        }
    };
    let _section = entry.exclusive().await;

    // An absent or empty release parameter means "keep the lock".
    let release = match params.get("release").map(String::as_str) {
        None | Some("") | Some("false") => false,
        Some("true") => true,
        Some(other) => {
            info!(key = %key, release = %other, "invalid release query value");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    debug!(key = %key, id = %lock_id, "checking lock validity");
    match state.atomics.valid_lock(&entry, &lock_id).await {
        Ok(true) => {}
        Ok(false) => {
            info!(key = %key, id = %lock_id, "lock id does not match");
            return StatusCode::UNAUTHORIZED.into_response();
        }
        Err(err) => {
            error!(key = %key, %err, "lock check failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    let value = String::from_utf8_lossy(&body).into_owned();
    if let Err(err) = state.atomics.set_value(&entry, value).await {
        error!(key = %key, %err, "could not store value");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    if release {
        info!(key = %key, "removing lock from entry");
        if let Err(err) = state.atomics.unset_lock_id(&entry).await {
            error!(key = %key, %err, "could not release lock");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    info!(key = %key, "handled update request");
    StatusCode::NO_CONTENT.into_response()
}

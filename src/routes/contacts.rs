//! Contact routes: full listing, saved/unsaved views, and refresh

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;

use super::{error_response, json_response, read_json};
use crate::server::AppState;
use crate::session::{Session, SessionState};
use crate::transport::{Contact, Transport};
use crate::types::{PosternError, Result};

#[derive(Debug, Deserialize)]
struct UserRequest {
    #[serde(default)]
    user: String,
}

/// Which slice of the contact list a route serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactScope {
    All,
    Saved,
    Unsaved,
}

fn filter_contacts(contacts: Vec<Contact>, scope: ContactScope) -> Vec<Contact> {
    match scope {
        ContactScope::All => contacts,
        ContactScope::Saved => contacts.into_iter().filter(|c| c.is_saved).collect(),
        ContactScope::Unsaved => contacts.into_iter().filter(|c| !c.is_saved).collect(),
    }
}

/// Resolve a logged-in session for contact operations
async fn logged_in_session(state: &AppState, user: &str) -> Result<Arc<Session>> {
    let session = match state.supervisor.find_existing(user).await? {
        Some(session) => session,
        None => return Err(PosternError::SessionNotFound(user.to_string())),
    };
    if session.state().await != SessionState::LoggedIn {
        return Err(PosternError::NotLoggedIn);
    }
    Ok(session)
}

/// POST /contact, /contact/saved, /contact/unsaved - contact listings
pub async fn list(
    state: Arc<AppState>,
    req: Request<Incoming>,
    scope: ContactScope,
) -> Response<Full<Bytes>> {
    let body: UserRequest = match read_json(req).await {
        Ok(body) => body,
        Err(e) => return error_response(&e),
    };

    let session = match logged_in_session(&state, &body.user).await {
        Ok(session) => session,
        Err(e) => return error_response(&e),
    };

    match session.transport().contacts().await {
        Ok(contacts) => {
            let contacts = filter_contacts(contacts, scope);
            let total = contacts.len();
            json_response(
                StatusCode::OK,
                serde_json::json!({
                    "contacts": contacts,
                    "total": total,
                    "user": body.user,
                }),
            )
        }
        Err(e) => {
            warn!("Get contacts error for user {}: {}", body.user, e);
            error_response(&PosternError::from(e))
        }
    }
}

/// POST /contact/refresh - resync the contact list from the upstream
pub async fn refresh(state: Arc<AppState>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let body: UserRequest = match read_json(req).await {
        Ok(body) => body,
        Err(e) => return error_response(&e),
    };

    let session = match logged_in_session(&state, &body.user).await {
        Ok(session) => session,
        Err(e) => return error_response(&e),
    };

    match session.transport().refresh_contacts().await {
        Ok(()) => json_response(
            StatusCode::OK,
            serde_json::json!({
                "msg": "Contacts refreshed successfully",
                "user": body.user,
            }),
        ),
        Err(e) => {
            warn!("Refresh contacts error for user {}: {}", body.user, e);
            error_response(&PosternError::from(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(jid: &str, saved: bool) -> Contact {
        Contact {
            jid: jid.to_string(),
            phone_number: jid.split('@').next().unwrap_or_default().to_string(),
            name: saved.then(|| "Someone".to_string()),
            push_name: Some("Someone".to_string()),
            business_name: None,
            is_saved: saved,
            is_business: false,
        }
    }

    #[test]
    fn test_filter_scopes() {
        let contacts = vec![
            contact("12025550100@s.whatsapp.net", true),
            contact("12025550101@s.whatsapp.net", false),
            contact("12025550102@s.whatsapp.net", true),
        ];

        assert_eq!(filter_contacts(contacts.clone(), ContactScope::All).len(), 3);

        let saved = filter_contacts(contacts.clone(), ContactScope::Saved);
        assert_eq!(saved.len(), 2);
        assert!(saved.iter().all(|c| c.is_saved));

        let unsaved = filter_contacts(contacts, ContactScope::Unsaved);
        assert_eq!(unsaved.len(), 1);
        assert!(!unsaved[0].is_saved);
    }
}

// chorus - Broadcast-ringing SIP proxy
// Copyright (C) 2025 Chorus Contributors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Administrative and self-service web UI.
//!
//! A small server-rendered interface over the user directory: admins list,
//! create, and delete users behind HTTP Basic auth; users change their own
//! password on an open page by proving the old one.

use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Form, Router};
use base64::Engine;
use serde::Deserialize;
use sip_registrar::DirectoryUser;
use smol_str::SmolStr;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use userdir::password::{hash_password, verify_password};
use userdir::SqliteDirectory;

pub struct AdminConfig {
    pub listen: String,
    pub admin_user: String,
    pub admin_pass: String,
}

struct AdminState {
    directory: SqliteDirectory,
    admin_user: String,
    admin_pass: String,
}

/// Serves the web UI until the token is cancelled.
pub async fn serve(
    directory: SqliteDirectory,
    config: AdminConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let state = Arc::new(AdminState {
        directory,
        admin_user: config.admin_user,
        admin_pass: config.admin_pass,
    });

    let admin_routes = Router::new()
        .route("/admin/users", get(list_users).post(create_user))
        .route("/admin/users/delete", post(delete_user))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            basic_auth,
        ));
    let app = Router::new()
        .route("/", get(home))
        .route("/password", get(password_form).post(change_password))
        .merge(admin_routes)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("bind admin UI on {}", config.listen))?;
    info!(listen = %config.listen, "admin web UI listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("admin UI server failed")
}

async fn basic_auth(
    State(state): State<Arc<AdminState>>,
    request: Request,
    next: Next,
) -> Response {
    let authorised = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(decode_basic)
        .is_some_and(|(user, pass)| {
            constant_time_eq(&user, &state.admin_user) && constant_time_eq(&pass, &state.admin_pass)
        });
    if !authorised {
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"admin\"")],
            "unauthorised",
        )
            .into_response();
    }
    next.run(request).await
}

fn decode_basic(value: &str) -> Option<(String, String)> {
    let encoded = value.strip_prefix("Basic ").or_else(|| value.strip_prefix("basic "))?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_owned(), pass.to_owned()))
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}

async fn home() -> Html<String> {
    Html(page(
        "chorus",
        "<p>SIP user directory.</p>\
         <ul><li><a href=\"/admin/users\">Manage users</a> (admin)</li>\
         <li><a href=\"/password\">Change your password</a></li></ul>"
            .to_owned(),
    ))
}

async fn list_users(State(state): State<Arc<AdminState>>) -> Response {
    let users = match state.directory.list_users().await {
        Ok(users) => users,
        Err(err) => {
            warn!(error = %err, "failed to list users");
            return internal_error();
        }
    };
    let rules = match state.directory.list_broadcast_rules().await {
        Ok(rules) => rules,
        Err(err) => {
            warn!(error = %err, "failed to list broadcast rules");
            return internal_error();
        }
    };

    let mut body = String::new();
    let _ = write!(
        body,
        "<h2>Users ({})</h2><table border=\"1\"><tr><th>User</th><th>Domain</th><th>Contact</th><th></th></tr>",
        users.len()
    );
    for user in &users {
        let _ = write!(
            body,
            "<tr><td>{}</td><td>{}</td><td>{}</td>\
             <td><form method=\"post\" action=\"/admin/users/delete\">\
             <input type=\"hidden\" name=\"username\" value=\"{}\">\
             <input type=\"hidden\" name=\"domain\" value=\"{}\">\
             <button>delete</button></form></td></tr>",
            escape(&user.username),
            escape(&user.domain),
            escape(&user.contact_uri),
            escape(&user.username),
            escape(&user.domain),
        );
    }
    body.push_str("</table>");

    body.push_str(
        "<h2>Add user</h2><form method=\"post\" action=\"/admin/users\">\
         <input name=\"username\" placeholder=\"user\">\
         <input name=\"domain\" placeholder=\"domain\">\
         <input name=\"password\" type=\"password\" placeholder=\"password\">\
         <input name=\"contact_uri\" placeholder=\"sip:user@host:port\">\
         <button>create</button></form>",
    );

    let _ = write!(body, "<h2>Broadcast rules ({})</h2><ul>", rules.len());
    for rule in &rules {
        let targets: Vec<String> = rule.targets.iter().map(|t| escape(&t.contact_uri)).collect();
        let _ = write!(
            body,
            "<li><b>{}</b> — {} → {}</li>",
            escape(&rule.address),
            escape(&rule.description),
            targets.join(", ")
        );
    }
    body.push_str("</ul>");

    Html(page("chorus admin", body)).into_response()
}

#[derive(Deserialize)]
struct CreateUserForm {
    username: String,
    domain: String,
    password: String,
    contact_uri: Option<String>,
}

async fn create_user(
    State(state): State<Arc<AdminState>>,
    Form(form): Form<CreateUserForm>,
) -> Response {
    let username = form.username.trim();
    let domain = form.domain.trim();
    if username.is_empty() || domain.is_empty() {
        return (StatusCode::BAD_REQUEST, "username and domain are required").into_response();
    }
    let user = DirectoryUser {
        username: SmolStr::new(username),
        domain: SmolStr::new(domain),
        password_hash: hash_password(username, domain, &form.password),
        contact_uri: form.contact_uri.unwrap_or_default().trim().to_owned(),
    };
    match state.directory.create_user(&user).await {
        Ok(()) => Redirect::to("/admin/users").into_response(),
        Err(err) => {
            warn!(error = %err, user = username, "failed to create user");
            (StatusCode::BAD_REQUEST, "could not create user").into_response()
        }
    }
}

#[derive(Deserialize)]
struct DeleteUserForm {
    username: String,
    domain: String,
}

async fn delete_user(
    State(state): State<Arc<AdminState>>,
    Form(form): Form<DeleteUserForm>,
) -> Response {
    match state
        .directory
        .delete_user(form.username.trim(), form.domain.trim())
        .await
    {
        Ok(()) => Redirect::to("/admin/users").into_response(),
        Err(userdir::DirectoryError::NotFound) => {
            (StatusCode::NOT_FOUND, "no such user").into_response()
        }
        Err(err) => {
            warn!(error = %err, "failed to delete user");
            internal_error()
        }
    }
}

async fn password_form() -> Html<String> {
    Html(page(
        "change password",
        "<form method=\"post\" action=\"/password\">\
         <input name=\"username\" placeholder=\"user\">\
         <input name=\"domain\" placeholder=\"domain\">\
         <input name=\"old_password\" type=\"password\" placeholder=\"current password\">\
         <input name=\"new_password\" type=\"password\" placeholder=\"new password\">\
         <button>change</button></form>"
            .to_owned(),
    ))
}

#[derive(Deserialize)]
struct PasswordForm {
    username: String,
    domain: String,
    old_password: String,
    new_password: String,
}

async fn change_password(
    State(state): State<Arc<AdminState>>,
    Form(form): Form<PasswordForm>,
) -> Response {
    let username = form.username.trim();
    let domain = form.domain.trim();
    if form.new_password.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "new password must not be empty").into_response();
    }
    let user = match state.directory.lookup_user(username, domain).await {
        Ok(Some(user)) => user,
        Ok(None) => return (StatusCode::FORBIDDEN, "invalid credentials").into_response(),
        Err(err) => {
            warn!(error = %err, "password change lookup failed");
            return internal_error();
        }
    };
    if !verify_password(&user.password_hash, username, domain, &form.old_password) {
        return (StatusCode::FORBIDDEN, "invalid credentials").into_response();
    }
    let new_hash = hash_password(username, domain, &form.new_password);
    match state
        .directory
        .update_password(username, domain, &new_hash)
        .await
    {
        Ok(()) => Html(page("change password", "<p>Password updated.</p>".to_owned()))
            .into_response(),
        Err(err) => {
            warn!(error = %err, "password update failed");
            internal_error()
        }
    }
}

fn internal_error() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
}

fn page(title: &str, body: String) -> String {
    format!(
        "<!doctype html><html><head><title>{}</title></head><body><h1>{}</h1>{}</body></html>",
        title, title, body
    )
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_basic_credentials() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("admin:s3cret");
        let header = format!("Basic {}", encoded);
        assert_eq!(
            decode_basic(&header),
            Some(("admin".to_owned(), "s3cret".to_owned()))
        );
        assert_eq!(decode_basic("Bearer token"), None);
    }

    #[test]
    fn escape_neutralises_markup() {
        assert_eq!(escape("<b>&\"x\""), "&lt;b&gt;&amp;&quot;x&quot;");
    }
}

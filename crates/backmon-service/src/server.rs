// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! The read-only HTTP surface.
//!
//! `GET /metrics` exposes the prometheus registry without authentication.
//! The `/api` routes browse the monitored state — disks, directories, file
//! definitions, and group keys — and optionally serve the newest file of a
//! group when downloads are enabled. HTTP Basic Auth, when configured,
//! gates `/api` only.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Redirect, Response};
use axum::routing::get;
use axum::Router;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use prometheus::{Encoder as _, TextEncoder};
use tower_http::trace::TraceLayer;

use crate::config::BasicAuthConfig;
use crate::monitor::{Missing, Monitor};

/// Shared state of the HTTP handlers.
#[derive(Clone)]
pub struct ApiState {
    /// The monitor whose published state is served.
    pub monitor: Arc<Monitor>,
    /// Credentials gating `/api`, if configured.
    pub basic_auth: Option<Arc<BasicAuthConfig>>,
    /// Whether the download route is registered.
    pub downloads_enabled: bool,
}

/// Builds the service router.
pub fn router(state: ApiState) -> Router {
    let mut api = Router::new()
        .route("/", get(list_disks))
        .route("/:disk", get(list_directories))
        .route("/:disk/:dir", get(list_files))
        .route("/:disk/:dir/:file", get(list_variations));

    if state.downloads_enabled {
        tracing::debug!("registering GET handler for artifact downloads");
        api = api.route("/:disk/:dir/:file/:variant", get(download_latest));
    }

    let api = api.layer(middleware::from_fn_with_state(
        state.clone(),
        basic_auth_guard,
    ));

    Router::new()
        .route("/", get(|| async { Redirect::permanent("/api") }))
        .route("/metrics", get(serve_metrics))
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn basic_auth_guard(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(auth) = &state.basic_auth else {
        return next.run(request).await;
    };

    let header_value = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    if is_authorized(header_value, auth) {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"backmon\"")],
            "unauthorized\n",
        )
            .into_response()
    }
}

/// Checks an `Authorization` header against the configured credentials.
fn is_authorized(header_value: Option<&str>, auth: &BasicAuthConfig) -> bool {
    header_value
        .and_then(|value| value.strip_prefix("Basic "))
        .and_then(|encoded| BASE64_STANDARD.decode(encoded).ok())
        .and_then(|decoded| String::from_utf8(decoded).ok())
        .and_then(|credentials| {
            credentials
                .split_once(':')
                .map(|(username, password)| username == auth.username && password == auth.password)
        })
        .unwrap_or(false)
}

async fn serve_metrics(State(state): State<ApiState>) -> Response {
    let families = state.monitor.registry().gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();

    if let Err(error) = encoder.encode(&families, &mut buffer) {
        tracing::error!(%error, "failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
        buffer,
    )
        .into_response()
}

async fn list_disks(State(state): State<ApiState>) -> Json<Vec<String>> {
    Json(state.monitor.disks().await)
}

async fn list_directories(
    State(state): State<ApiState>,
    Path(disk): Path<String>,
) -> Response {
    match state.monitor.directories(&disk).await {
        Ok(directories) => Json(directories).into_response(),
        Err(missing) => not_found(&missing),
    }
}

async fn list_files(
    State(state): State<ApiState>,
    Path((disk, dir)): Path<(String, String)>,
) -> Response {
    match state.monitor.files(&disk, &dir).await {
        Ok(files) => Json(files).into_response(),
        Err(missing) => not_found(&missing),
    }
}

async fn list_variations(
    State(state): State<ApiState>,
    Path((disk, dir, file)): Path<(String, String, String)>,
) -> Response {
    match state.monitor.variations(&disk, &dir, &file).await {
        Ok(variations) => Json(variations).into_response(),
        Err(missing) => not_found(&missing),
    }
}

async fn download_latest(
    State(state): State<ApiState>,
    Path((disk, dir, file, variant)): Path<(String, String, String, String)>,
) -> Response {
    let (client, disk_name, latest) =
        match state.monitor.latest_file(&disk, &dir, &file, &variant).await {
            Ok(found) => found,
            Err(missing) => return not_found(&missing),
        };

    match client.read(&disk_name, &latest).await {
        Ok(bytes) => (
            [
                (header::CONTENT_TYPE, "application/octet-stream".to_owned()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", latest.name),
                ),
            ],
            Body::from(bytes),
        )
            .into_response(),
        Err(error) => {
            tracing::error!(disk = %disk_name, file = %latest.name, %error, "download failed");
            not_found(&Missing::Group(variant))
        }
    }
}

fn not_found(missing: &Missing) -> Response {
    let body = match missing {
        Missing::Disk(name) => format!("Disk '{name}' does not exist."),
        Missing::Directory(name) => format!("Directory '{name}' does not exist."),
        Missing::File(name) => format!("File '{name}' does not exist."),
        Missing::Group(name) => format!("Group '{name}' does not exist."),
    };
    (StatusCode::NOT_FOUND, body).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> BasicAuthConfig {
        BasicAuthConfig {
            username: "monitor".to_owned(),
            password: "hunter2".to_owned(),
        }
    }

    fn basic_header(credentials: &str) -> String {
        format!("Basic {}", BASE64_STANDARD.encode(credentials))
    }

    #[test]
    fn accepts_matching_credentials() {
        assert!(is_authorized(
            Some(&basic_header("monitor:hunter2")),
            &auth()
        ));
    }

    #[test]
    fn rejects_wrong_or_malformed_credentials() {
        let auth = auth();
        assert!(!is_authorized(None, &auth));
        assert!(!is_authorized(Some("Bearer token"), &auth));
        assert!(!is_authorized(Some("Basic !!!"), &auth));
        assert!(!is_authorized(Some(&basic_header("monitor")), &auth));
        assert!(!is_authorized(
            Some(&basic_header("monitor:wrong")),
            &auth
        ));
        assert!(!is_authorized(
            Some(&basic_header("other:hunter2")),
            &auth
        ));
    }

    #[test]
    fn passwords_may_contain_colons() {
        let auth = BasicAuthConfig {
            username: "monitor".to_owned(),
            password: "hun:ter2".to_owned(),
        };
        assert!(is_authorized(Some(&basic_header("monitor:hun:ter2")), &auth));
    }

    #[test]
    fn not_found_bodies_name_the_segment() {
        let response = not_found(&Missing::Directory("daily".to_owned()));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of murmur.
//
// murmur is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// murmur is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with murmur.  If not,
// see <http://www.gnu.org/licenses/>.

//! # The murmur HTTP API
//!
//! All routes identify the acting user by the `X-User-ID` request header. murmur takes that on
//! faith; authenticating the caller is somebody else's job.
//!
//! | Method | Path        | Body                   | Success                              |
//! |--------|-------------|------------------------|--------------------------------------|
//! | POST   | `/messages` | `{"content": ...}`     | 201 & the new message                |
//! | GET    | `/messages` |                        | 200 & the caller's recent messages   |
//! | POST   | `/follow`   | `{"following_id": ...}`| 201 & `{"message": ...}`             |
//! | GET    | `/timeline` |                        | 200 & the caller's home timeline     |
//! | GET    | `/feed`     |                        | same as `/timeline`                  |
//!
//! The GET routes take an optional `limit` query parameter.

use std::{result::Result as StdResult, sync::Arc};

use axum::{
    extract::{
        rejection::{ExtensionRejection, JsonRejection},
        Query, Request, State,
    },
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{debug, error};

use crate::{
    counter_add,
    entities::UserId,
    feed,
    http::error_response,
    metrics::{self, Sort},
    murmur::Murmur,
};

/// The header naming the acting user
pub const USER_ID_HEADER: &str = "x-user-id";

inventory::submit! { metrics::Registration::new("api.requests.unidentified", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("api.requests.malformed", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("api.requests.failed", Sort::IntegralCounter) }

/// Attach the acting user (if any) to the request as an `Extension<UserId>`
///
/// A missing or malformed header isn't rejected here; handlers decide what to do about that.
async fn identify(mut request: Request, next: Next) -> Response {
    match request
        .headers()
        .get(USER_ID_HEADER)
        .map(|value| value.to_str().map(|s| UserId::new(s.trim())))
    {
        Some(Ok(Ok(user))) => {
            request.extensions_mut().insert(user);
        }
        Some(_) => debug!("Ignoring a malformed {USER_ID_HEADER} header."),
        None => (),
    }
    next.run(request).await
}

fn unidentified(state: &Murmur) -> Response {
    counter_add!(state.instruments, "api.requests.unidentified", 1, &[]);
    error_response(
        StatusCode::BAD_REQUEST,
        "User ID required in X-User-ID header",
    )
}

fn malformed(state: &Murmur, err: JsonRejection) -> Response {
    counter_add!(state.instruments, "api.requests.malformed", 1, &[]);
    debug!("Rejecting a request body: {err}");
    error_response(StatusCode::BAD_REQUEST, "Invalid request body")
}

fn feed_error(state: &Murmur, err: feed::Error) -> Response {
    if err.is_client_error() {
        error_response(StatusCode::BAD_REQUEST, err)
    } else {
        counter_add!(state.instruments, "api.requests.failed", 1, &[]);
        error!("{err:?}");
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PostMessageReq {
    pub content: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FollowReq {
    pub following_id: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FollowRsp {
    pub message: String,
}

#[derive(Clone, Debug, Deserialize)]
struct PageParams {
    // Taken as a string so that garbage falls back to the default rather than a 400
    limit: Option<String>,
}

async fn post_message(
    State(state): State<Arc<Murmur>>,
    user: StdResult<Extension<UserId>, ExtensionRejection>,
    body: StdResult<Json<PostMessageReq>, JsonRejection>,
) -> Response {
    let Ok(Extension(user)) = user else {
        return unidentified(&state);
    };
    let req = match body {
        Ok(Json(req)) => req,
        Err(err) => return malformed(&state, err),
    };
    match state.feed.post_message(&user, &req.content).await {
        Ok(message) => (StatusCode::CREATED, Json(message)).into_response(),
        Err(err) => feed_error(&state, err),
    }
}

async fn get_messages(
    State(state): State<Arc<Murmur>>,
    user: StdResult<Extension<UserId>, ExtensionRejection>,
    Query(params): Query<PageParams>,
) -> Response {
    let Ok(Extension(user)) = user else {
        return unidentified(&state);
    };
    let limit = state.feed.limits().page_size(params.limit.as_deref());
    match state.feed.messages_by(&user, limit).await {
        Ok(messages) => Json(messages).into_response(),
        Err(err) => feed_error(&state, err),
    }
}

async fn follow(
    State(state): State<Arc<Murmur>>,
    user: StdResult<Extension<UserId>, ExtensionRejection>,
    body: StdResult<Json<FollowReq>, JsonRejection>,
) -> Response {
    let Ok(Extension(user)) = user else {
        return unidentified(&state);
    };
    let req = match body {
        Ok(Json(req)) => req,
        Err(err) => return malformed(&state, err),
    };
    if req.following_id.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Following ID is required");
    }
    match state.feed.follow(&user, req.following_id.trim()).await {
        Ok(_) => (
            StatusCode::CREATED,
            Json(FollowRsp {
                message: "User followed successfully".to_owned(),
            }),
        )
            .into_response(),
        Err(err) => feed_error(&state, err),
    }
}

async fn timeline(
    State(state): State<Arc<Murmur>>,
    user: StdResult<Extension<UserId>, ExtensionRejection>,
    Query(params): Query<PageParams>,
) -> Response {
    let Ok(Extension(user)) = user else {
        return unidentified(&state);
    };
    let limit = state.feed.limits().page_size(params.limit.as_deref());
    match state.feed.timeline(&user, limit).await {
        Ok(entries) => Json(entries).into_response(),
        Err(err) => feed_error(&state, err),
    }
}

/// Return a router for the murmur API
pub fn make_router(state: Arc<Murmur>) -> Router<Arc<Murmur>> {
    Router::new()
        .route("/messages", post(post_message).get(get_messages))
        .route("/follow", post(follow))
        .route("/timeline", get(timeline))
        .route("/feed", get(timeline))
        .route_layer(axum::middleware::from_fn(identify))
        // All responses are JSON; don't clobber a Content-Type a handler set specially, though.
        .layer(SetResponseHeaderLayer::if_not_present(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        ))
        .with_state(state)
}

#[cfg(test)]
mod test {
    use super::*;

    use std::time::Duration;

    use axum::body::{Body, Bytes};
    use http_body_util::BodyExt;
    use opentelemetry_prometheus_text_exporter::PrometheusExporter;
    use tower::ServiceExt;

    use crate::{
        background_tasks::Processor,
        entities::{Message, TimelineEntry},
        fan_out::{self, Context, Dispatcher},
        feed::{Feed, Limits},
        http::ErrorResponseBody,
        memory::MemoryStore,
        metrics::Instruments,
        storage::Repositories,
    };

    fn state() -> (Arc<Murmur>, Processor) {
        let instruments = Arc::new(Instruments::new("murmur"));
        let repos = Repositories::from_backend(Arc::new(MemoryStore::new()));
        let (dispatcher, processor) = Dispatcher::new(Context::new(
            repos.clone(),
            fan_out::Config::default(),
            instruments.clone(),
        ));
        (
            Arc::new(Murmur {
                feed: Feed::new(repos, dispatcher, Limits::default(), instruments.clone()),
                instruments,
                exporter: PrometheusExporter::new(),
            }),
            processor,
        )
    }

    async fn call(
        state: &Arc<Murmur>,
        method: &str,
        uri: &str,
        user: Option<&str>,
        body: Option<&str>,
    ) -> (StatusCode, Bytes) {
        let mut req = axum::http::Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            req = req.header(USER_ID_HEADER, user);
        }
        let req = match body {
            Some(body) => req
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_owned())),
            None => req.body(Body::empty()),
        }
        .unwrap();
        let app: Router = make_router(state.clone()).with_state(state.clone());
        let rsp = app
            .oneshot(req)
            .await
            .unwrap();
        let status = rsp.status();
        (status, rsp.into_body().collect().await.unwrap().to_bytes())
    }

    fn error_of(body: &[u8]) -> String {
        serde_json::from_slice::<ErrorResponseBody>(body).unwrap().error
    }

    #[tokio::test]
    async fn requires_a_user() {
        let (state, processor) = state();
        let (status, body) = call(&state, "GET", "/timeline", None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_of(&body), "User ID required in X-User-ID header");

        let (status, _) = call(&state, "GET", "/timeline", Some("has space"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &state,
            "POST",
            "/messages",
            None,
            Some(r#"{"content": "hello"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        processor.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn bad_requests() {
        let (state, processor) = state();
        let (status, body) = call(&state, "POST", "/messages", Some("A1"), Some("{")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_of(&body), "Invalid request body");

        let (status, body) = call(
            &state,
            "POST",
            "/messages",
            Some("A1"),
            Some(r#"{"content": ""}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_of(&body), "Content is required");

        let long = format!(r#"{{"content": "{}"}}"#, "x".repeat(281));
        let (status, body) = call(&state, "POST", "/messages", Some("A1"), Some(&long)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_of(&body), "Content too long");

        // Exactly at the limit is fine
        let most = format!(r#"{{"content": "{}"}}"#, "x".repeat(280));
        let (status, _) = call(&state, "POST", "/messages", Some("A1"), Some(&most)).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = call(
            &state,
            "POST",
            "/follow",
            Some("A1"),
            Some(r#"{"following_id": "A1"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_of(&body), "Cannot follow yourself");

        let (status, body) = call(
            &state,
            "POST",
            "/follow",
            Some("A1"),
            Some(r#"{"following_id": ""}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_of(&body), "Following ID is required");
        processor.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn post_follow_read() {
        let (state, processor) = state();

        let (status, body) = call(
            &state,
            "POST",
            "/follow",
            Some("U1"),
            Some(r#"{"following_id": "A1"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let rsp: FollowRsp = serde_json::from_slice(&body).unwrap();
        assert_eq!(rsp.message, "User followed successfully");

        let (status, body) = call(
            &state,
            "POST",
            "/messages",
            Some("A1"),
            Some(r#"{"content": "hello"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let posted: Message = serde_json::from_slice(&body).unwrap();
        assert_eq!(posted.content().as_ref(), "hello");

        let (status, body) = call(&state, "GET", "/messages?limit=nonsense", Some("A1"), None).await;
        assert_eq!(status, StatusCode::OK);
        let mine: Vec<Message> = serde_json::from_slice(&body).unwrap();
        assert_eq!(mine, vec![posted.clone()]);

        // Wait for fan-out to finish
        processor.shutdown(Duration::from_secs(5)).await.unwrap();

        for uri in ["/timeline", "/feed?limit=5", "/timeline?limit=-1"] {
            let (status, body) = call(&state, "GET", uri, Some("U1"), None).await;
            assert_eq!(status, StatusCode::OK);
            let entries: Vec<TimelineEntry> = serde_json::from_slice(&body).unwrap();
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].message_id(), posted.id());
            assert_eq!(entries[0].author_id().as_ref(), "A1");
        }

        let (status, body) = call(&state, "GET", "/timeline", Some("A1"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"[]");
    }
}

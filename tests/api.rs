//! HTTP adapter tests, driven through the router without a listener

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use tower::ServiceExt;

use lending_server::{
    api,
    config::{AppConfig, LendingPolicy},
    models::{user::Role, Book, User, UserClaims},
    repository::{memory::MemoryLedger, Repository},
    services::{notifications::LogNotifier, Services},
    AppState,
};

const SECRET: &str = "test-secret";

struct TestApp {
    router: Router,
    ledger: MemoryLedger,
}

impl TestApp {
    fn new() -> Self {
        let ledger = MemoryLedger::new();
        let mut config = AppConfig::default();
        config.auth.jwt_secret = SECRET.to_string();

        let services = Services::new(
            Repository::with_store(ledger.clone()),
            LendingPolicy::from(&config.lending),
            Arc::new(LogNotifier),
        );
        let state = AppState {
            config: Arc::new(config),
            services: Arc::new(services),
        };

        Self {
            router: api::router(state),
            ledger,
        }
    }

    async fn book(&self, title: &str, stock: i32) -> Book {
        self.ledger.insert_book(title, stock).await
    }

    async fn reader(&self, name: &str) -> User {
        self.ledger.insert_user(name, 5).await
    }

    async fn send(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => request
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .expect("Failed to build request");

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("Failed to read body");
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("Failed to parse response")
        };
        (status, body)
    }
}

fn token_for(user: &User, role: Role) -> String {
    let now = Utc::now().timestamp();
    UserClaims {
        sub: user.username.clone(),
        user_id: user.id,
        role,
        exp: now + 3600,
        iat: now,
    }
    .create_token(SECRET)
    .expect("Failed to mint token")
}

#[tokio::test]
async fn test_health_check() {
    let app = TestApp::new();

    let (status, body) = app.send(Method::GET, "/api/v1/health", None, None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["ledger"], "up");
}

#[tokio::test]
async fn test_requests_without_token_are_rejected() {
    let app = TestApp::new();
    let book = app.book("Dune", 1).await;

    let (status, body) = app
        .send(Method::POST, "/api/v1/loans", None, Some(json!({ "book_id": book.id })))
        .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "UNAUTHORIZED");

    let (status, _) = app
        .send(Method::GET, "/api/v1/reservations/mine", Some("not-a-jwt"), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_borrow_then_out_of_stock() {
    let app = TestApp::new();
    let book = app.book("Dune", 1).await;
    let alice = app.reader("alice").await;
    let bob = app.reader("bob").await;

    let (status, body) = app
        .send(
            Method::POST,
            "/api/v1/loans",
            Some(&token_for(&alice, Role::Reader)),
            Some(json!({ "book_id": book.id, "borrow_days": 14 })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["book_title"], "Dune");
    assert_eq!(body["loan"]["status"], "active");
    assert_eq!(body["max_renewals"], 2);

    let (status, body) = app
        .send(
            Method::POST,
            "/api/v1/loans",
            Some(&token_for(&bob, Role::Reader)),
            Some(json!({ "book_id": book.id })),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], 20003);
    assert_eq!(body["error"], "OUT_OF_STOCK");
}

#[tokio::test]
async fn test_invalid_duration_is_bad_request() {
    let app = TestApp::new();
    let book = app.book("Dune", 1).await;
    let alice = app.reader("alice").await;

    let (status, body) = app
        .send(
            Method::POST,
            "/api/v1/loans",
            Some(&token_for(&alice, Role::Reader)),
            Some(json!({ "book_id": book.id, "borrow_days": 0 })),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "BAD_VALUE");
}

#[tokio::test]
async fn test_readers_cannot_borrow_for_others_but_librarians_can() {
    let app = TestApp::new();
    let book = app.book("Dune", 2).await;
    let alice = app.reader("alice").await;
    let bob = app.reader("bob").await;
    let librarian = app.reader("librarian").await;

    let (status, body) = app
        .send(
            Method::POST,
            "/api/v1/loans",
            Some(&token_for(&alice, Role::Reader)),
            Some(json!({ "book_id": book.id, "user_id": bob.id })),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "FORBIDDEN");

    let (status, body) = app
        .send(
            Method::POST,
            "/api/v1/loans",
            Some(&token_for(&librarian, Role::Librarian)),
            Some(json!({ "book_id": book.id, "user_id": bob.id })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["loan"]["user_id"], bob.id);
}

#[tokio::test]
async fn test_return_and_renew_flow() {
    let app = TestApp::new();
    let book = app.book("Dune", 1).await;
    let alice = app.reader("alice").await;
    let token = token_for(&alice, Role::Reader);

    let (_, body) = app
        .send(Method::POST, "/api/v1/loans", Some(&token), Some(json!({ "book_id": book.id })))
        .await;
    let loan_id = body["loan"]["id"].as_i64().expect("loan id");

    let (status, body) = app
        .send(
            Method::POST,
            &format!("/api/v1/loans/{}/renew", loan_id),
            Some(&token),
            Some(json!({ "renew_days": 7 })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["renew_count"], 1);

    let (status, body) = app
        .send(Method::GET, &format!("/api/v1/loans/{}", loan_id), Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["can_renew"], true);
    assert_eq!(body["is_overdue"], false);

    let (status, body) = app
        .send(
            Method::POST,
            &format!("/api/v1/loans/{}/return", loan_id),
            Some(&token),
            Some(json!({ "condition": "good" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["loan"]["status"], "returned");
    assert_eq!(body["condition"], "good");

    let (status, body) = app
        .send(Method::POST, &format!("/api/v1/loans/{}/return", loan_id), Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "ALREADY_RETURNED");
}

#[tokio::test]
async fn test_user_loans_are_private() {
    let app = TestApp::new();
    let alice = app.reader("alice").await;
    let bob = app.reader("bob").await;

    let (status, body) = app
        .send(
            Method::GET,
            &format!("/api/v1/users/{}/loans", alice.id),
            Some(&token_for(&alice, Role::Reader)),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["borrow_limit"], 5);
    assert!(body["loans"].as_array().expect("loans array").is_empty());

    let (status, _) = app
        .send(
            Method::GET,
            &format!("/api/v1/users/{}/loans?status=overdue", alice.id),
            Some(&token_for(&bob, Role::Reader)),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_reservation_lifecycle() {
    let app = TestApp::new();
    let book = app.book("Dune", 1).await;
    let alice = app.reader("alice").await;
    let bob = app.reader("bob").await;
    let bob_token = token_for(&bob, Role::Reader);

    let (status, body) = app
        .send(
            Method::POST,
            "/api/v1/reservations",
            Some(&bob_token),
            Some(json!({ "book_id": book.id })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "RESERVATION_FAILED");

    app.send(
        Method::POST,
        "/api/v1/loans",
        Some(&token_for(&alice, Role::Reader)),
        Some(json!({ "book_id": book.id })),
    )
    .await;

    let (status, body) = app
        .send(
            Method::POST,
            "/api/v1/reservations",
            Some(&bob_token),
            Some(json!({ "book_id": book.id })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "waiting");
    assert_eq!(body["queue_position"], 1);
    let reservation_id = body["id"].as_i64().expect("reservation id");

    let (status, body) = app
        .send(
            Method::GET,
            &format!("/api/v1/reservations/{}/position", reservation_id),
            Some(&bob_token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["position"], 1);

    let (status, body) = app
        .send(Method::GET, "/api/v1/reservations/mine", Some(&bob_token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().expect("reservations").len(), 1);

    let (status, _) = app
        .send(
            Method::DELETE,
            &format!("/api/v1/reservations/{}", reservation_id),
            Some(&token_for(&alice, Role::Reader)),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app
        .send(
            Method::DELETE,
            &format!("/api/v1/reservations/{}", reservation_id),
            Some(&bob_token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "cancelled");
}

#[tokio::test]
async fn test_sweeps_require_staff() {
    let app = TestApp::new();
    let alice = app.reader("alice").await;
    let admin = app.reader("admin").await;

    let (status, _) = app
        .send(
            Method::POST,
            "/api/v1/sweeps/overdue",
            Some(&token_for(&alice, Role::Reader)),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let admin_token = token_for(&admin, Role::Admin);
    let (status, body) = app
        .send(Method::POST, "/api/v1/sweeps/overdue", Some(&admin_token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 0);

    let (status, body) = app
        .send(Method::POST, "/api/v1/sweeps/reservations", Some(&admin_token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 0);
}

#[tokio::test]
async fn test_unknown_loan_is_not_found() {
    let app = TestApp::new();
    let alice = app.reader("alice").await;

    let (status, body) = app
        .send(
            Method::GET,
            "/api/v1/loans/4242",
            Some(&token_for(&alice, Role::Reader)),
            None,
        )
        .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "NOT_FOUND");
}

#[tokio::test]
async fn test_malformed_bodies_are_rejected_without_side_effects() {
    let app = TestApp::new();
    let book = app.book("Dune", 1).await;
    let alice = app.reader("alice").await;
    let token = token_for(&alice, Role::Reader);

    let (_, body) = app
        .send(Method::POST, "/api/v1/loans", Some(&token), Some(json!({ "book_id": book.id })))
        .await;
    let loan_id = body["loan"]["id"].as_i64().expect("loan id");
    let renew = format!("/api/v1/loans/{}/renew", loan_id);

    let (status, body) = app
        .send(Method::POST, &renew, Some(&token), Some(json!({ "renew_days": "7" })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "BAD_VALUE");

    let (status, body) = app
        .send(
            Method::POST,
            &format!("/api/v1/loans/{}/return", loan_id),
            Some(&token),
            Some(json!({ "condition": "broken" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "BAD_VALUE");

    let (_, body) = app
        .send(Method::GET, &format!("/api/v1/loans/{}", loan_id), Some(&token), None)
        .await;
    assert_eq!(body["renew_count"], 0);
    assert_eq!(body["status"], "active");

    // No body at all still means the default renewal
    let (status, body) = app.send(Method::POST, &renew, Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["renew_count"], 1);
}

#[tokio::test]
async fn test_return_echoes_remark() {
    let app = TestApp::new();
    let book = app.book("Dune", 1).await;
    let alice = app.reader("alice").await;
    let token = token_for(&alice, Role::Reader);

    let (_, body) = app
        .send(Method::POST, "/api/v1/loans", Some(&token), Some(json!({ "book_id": book.id })))
        .await;
    let loan_id = body["loan"]["id"].as_i64().expect("loan id");

    let (status, body) = app
        .send(
            Method::POST,
            &format!("/api/v1/loans/{}/return", loan_id),
            Some(&token),
            Some(json!({ "condition": "damaged", "remark": "coffee stain" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["condition"], "damaged");
    assert_eq!(body["remark"], "coffee stain");
}

#[tokio::test]
async fn test_loan_search_scopes_readers_to_their_own_loans() {
    let app = TestApp::new();
    let book = app.book("Dune", 2).await;
    let alice = app.reader("alice").await;
    let bob = app.reader("bob").await;
    let librarian = app.reader("librarian").await;

    for reader in [&alice, &bob] {
        let (status, _) = app
            .send(
                Method::POST,
                "/api/v1/loans",
                Some(&token_for(reader, Role::Reader)),
                Some(json!({ "book_id": book.id })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let alice_token = token_for(&alice, Role::Reader);
    let (status, body) = app.send(Method::GET, "/api/v1/loans", Some(&alice_token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert_eq!(body["items"][0]["user_id"], alice.id);
    assert_eq!(body["page"], 1);
    assert_eq!(body["per_page"], 10);

    let (status, _) = app
        .send(
            Method::GET,
            &format!("/api/v1/loans?user_id={}", bob.id),
            Some(&alice_token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let staff = token_for(&librarian, Role::Librarian);
    let (status, body) = app
        .send(
            Method::GET,
            "/api/v1/loans?sort_by=due_date&order=asc&per_page=1",
            Some(&staff),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 2);
    assert_eq!(body["total_pages"], 2);
    assert_eq!(body["items"].as_array().expect("items").len(), 1);

    let (status, body) = app
        .send(Method::GET, "/api/v1/loans?start_date=yesterday", Some(&staff), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "BAD_VALUE");

    let (status, _) = app
        .send(Method::GET, "/api/v1/loans?per_page=500", Some(&staff), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

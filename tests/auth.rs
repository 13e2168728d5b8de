use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::get;
use axum::Router;
use jsonwebtoken::{encode, EncodingKey, Header};
use tower::ServiceExt;
use uuid::Uuid;

use devgate::extractor::AuthUser;

async fn whoami(AuthUser { user_id }: AuthUser) -> String {
    user_id.to_string()
}

fn app() -> Router {
    Router::new().route("/whoami", get(whoami))
}

fn token_for(sub: &str, secret: &str) -> String {
    let claims = serde_json::json!({ "sub": sub, "exp": 9999999999u64 });
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

#[tokio::test]
async fn requests_without_token_are_unauthenticated() {
    std::env::set_var("JWT_HS_SECRET", "integration-secret");
    let response = app()
        .oneshot(Request::builder().uri("/whoami").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn bearer_token_authenticates() {
    std::env::set_var("JWT_HS_SECRET", "integration-secret");
    let user_id = Uuid::new_v4();
    let token = token_for(&user_id.to_string(), "integration-secret");
    let response = app()
        .oneshot(
            Request::builder()
                .uri("/whoami")
                .header("Authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert_eq!(body, user_id.to_string().as_bytes());
}

#[tokio::test]
async fn websocket_subprotocol_token_authenticates() {
    std::env::set_var("JWT_HS_SECRET", "integration-secret");
    let user_id = Uuid::new_v4();
    let token = token_for(&user_id.to_string(), "integration-secret");
    let response = app()
        .oneshot(
            Request::builder()
                .uri("/whoami")
                .header("Sec-WebSocket-Protocol", format!("bearer, {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn garbage_token_rejected() {
    std::env::set_var("JWT_HS_SECRET", "integration-secret");
    let response = app()
        .oneshot(
            Request::builder()
                .uri("/whoami")
                .header("Authorization", "Bearer not-a-jwt")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

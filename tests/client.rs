use std::convert::Infallible;
use std::time::Duration;

use http_body_util::BodyExt as _;

use hyperdriver_timeout::bridge::TokioIo;
use hyperdriver_timeout::transport::Http1Transport;
use hyperdriver_timeout::{Body, Client, TimeoutOptions};

async fn service(
    request: http::Request<hyper::body::Incoming>,
) -> Result<http::Response<Body>, Infallible> {
    let path = request.uri().path().to_owned();
    let response = match path.as_str() {
        "/json" => http::Response::builder()
            .header("content-type", "application/json")
            .body(Body::from(r#"{"name": "hyperdriver", "stars": 42}"#)),
        "/echo" => {
            let body = request.into_body().collect().await.map(|b| b.to_bytes());
            http::Response::builder().body(Body::from(body.unwrap_or_default()))
        }
        "/slow" => {
            tokio::time::sleep(Duration::from_secs(60)).await;
            http::Response::builder().body(Body::from("slow"))
        }
        _ => http::Response::builder()
            .status(http::StatusCode::NOT_FOUND)
            .body(Body::empty()),
    };
    Ok(response.expect("valid response"))
}

async fn connect() -> Http1Transport {
    let (client, server) = tokio::io::duplex(1024);
    tokio::spawn(async move {
        let _ = hyper::server::conn::http1::Builder::new()
            .serve_connection(TokioIo::new(server), hyper::service::service_fn(service))
            .await;
    });
    Http1Transport::handshake(client).await.unwrap()
}

#[tokio::test]
async fn client_get_json() {
    let _ = tracing_subscriber::fmt::try_init();

    #[derive(Debug, serde::Deserialize)]
    struct Repo {
        name: String,
        stars: u32,
    }

    let client = Client::builder(connect().await)
        .request_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(1))
        .build();

    let response = client.get("http://test/json".parse().unwrap()).await.unwrap();
    assert!(response.is_success());
    assert_eq!(
        response.headers().get(http::header::CONTENT_TYPE).unwrap(),
        "application/json"
    );

    let repo: Repo = response.json().await.unwrap();
    assert_eq!(repo.name, "hyperdriver");
    assert_eq!(repo.stars, 42);
}

#[tokio::test]
async fn client_post_echo() {
    let client = Client::new(
        connect().await,
        TimeoutOptions::new().with_idle_timeout(Duration::from_secs(1)),
    );

    let response = client
        .post("http://test/echo".parse().unwrap(), "round trip")
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "round trip");
}

#[tokio::test]
async fn client_not_found_has_no_body() {
    let client = Client::new(
        connect().await,
        TimeoutOptions::new().with_request_timeout(Duration::from_secs(5)),
    );

    let response = client.get("http://test/missing".parse().unwrap()).await.unwrap();
    assert_eq!(response.status(), http::StatusCode::NOT_FOUND);
    assert!(!response.is_success());
    assert!(response.bytes().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn client_request_with_overrides_default() {
    let client = Client::new(connect().await, TimeoutOptions::new());

    let request = http::Request::get("http://test/slow")
        .body(Body::empty())
        .unwrap();
    let options = TimeoutOptions::new().with_request_timeout(Duration::from_millis(250));
    let error = client.request_with(request, options).await.unwrap_err();
    assert!(error.is_aborted());
}

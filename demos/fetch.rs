//! Fetch a URL over plain HTTP/1 with request and idle timeouts.
//!
//! The response body is streamed to stdout as it arrives, so a slow server
//! shows the idle timeout at work. Use `--help` to see the options.

use std::time::Duration;

use clap::{arg, value_parser};
use http::Uri;
use http_body_util::BodyExt as _;
use hyperdriver_timeout::transport::Http1Transport;
use hyperdriver_timeout::{Body, Client, TimeoutOptions};
use tokio::io::AsyncWriteExt as _;
use tracing::Level;
use tracing_subscriber::{
    filter::Targets, fmt::format::FmtSpan, layer::SubscriberExt as _,
    util::SubscriberInitExt as _, Layer as _,
};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let filter = Targets::new()
        .with_target("hyperdriver_timeout", Level::TRACE)
        .with_target("fetch", Level::TRACE)
        .with_default(Level::INFO);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_span_events(FmtSpan::CLOSE)
                .with_writer(std::io::stderr)
                .with_filter(filter),
        )
        .init();

    let args = clap::Command::new("fetch")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Fetch a URL with request and idle timeouts")
        .args([
            clap::Arg::new("uri").help("Target URI").required(true),
            arg!(-X --method [METHOD] "HTTP method to use").default_value("GET"),
            arg!(-d --body [BODY] "HTTP body to send"),
            arg!(--"request-timeout" [MILLIS] "Maximum lifespan of the request in milliseconds")
                .value_parser(value_parser!(u64)),
            arg!(--"idle-timeout" [MILLIS] "Maximum time without progress in milliseconds")
                .value_parser(value_parser!(u64)),
        ])
        .get_matches();

    let uri: Uri = args
        .get_one::<String>("uri")
        .expect("uri argument must be present")
        .parse()?;

    let method: http::Method = args
        .get_one::<String>("method")
        .expect("method has a default")
        .parse()?;

    let mut options = TimeoutOptions::new();
    if let Some(millis) = args.get_one::<u64>("request-timeout") {
        options = options.with_request_timeout(Duration::from_millis(*millis));
    }
    if let Some(millis) = args.get_one::<u64>("idle-timeout") {
        options = options.with_idle_timeout(Duration::from_millis(*millis));
    }

    let host = uri.host().ok_or("uri must include a host")?;
    let port = uri.port_u16().unwrap_or(80);
    if uri.scheme_str().is_some_and(|scheme| scheme != "http") {
        return Err("only plain http:// URIs are supported".into());
    }

    let stream = tokio::net::TcpStream::connect((host, port)).await?;
    let transport = Http1Transport::handshake(stream).await?;
    let client = Client::new(transport, options);

    let body = match args.get_one::<String>("body") {
        Some(body) => Body::from(body.clone()),
        None => Body::empty(),
    };

    let request = http::Request::builder()
        .method(method)
        .uri(uri.clone())
        .header(http::header::HOST, host)
        .header(
            http::header::USER_AGENT,
            concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")),
        )
        .body(body)?;

    fetch(client, request).await
}

#[tracing::instrument(level = "trace", skip_all, fields(uri = %request.uri()))]
async fn fetch(client: Client, request: http::Request<Body>) -> Result<(), BoxError> {
    let mut response = match client.request(request).await {
        Ok(response) => response,
        Err(error) if error.is_aborted() => {
            eprintln!("Timed out waiting for a response");
            return Err(error.into());
        }
        Err(error) => return Err(error.into()),
    };

    println!("Response: {:?} {}", response.version(), response.status());
    for (name, value) in response.headers() {
        println!("  {}: {:?}", name, value);
    }
    println!();

    let mut stdout = tokio::io::stdout();
    while let Some(frame) = response.body().frame().await {
        match frame {
            Ok(frame) => {
                if let Some(chunk) = frame.data_ref() {
                    stdout.write_all(chunk).await?;
                }
            }
            Err(error) if error.is_aborted() => {
                stdout.flush().await?;
                eprintln!("\nTimed out reading the response body");
                return Err(error.into());
            }
            Err(error) => return Err(error.into()),
        }
    }
    stdout.flush().await?;

    Ok(())
}

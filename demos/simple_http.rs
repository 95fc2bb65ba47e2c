//! Simple HTTP example
//!
//! Blocking and callback-based GET and POST calls against httpbin.

use ferry::{Client, Response, Result};
use std::sync::mpsc;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("ferry=debug".parse().unwrap()))
        .init();

    let client = Client::new()?;

    println!("=== Blocking GET ===");
    let body = client.get_sync("https://httpbin.org/get")?;
    println!("{body}");

    println!("\n=== Blocking JSON POST ===");
    let body = client.post_json_sync("https://httpbin.org/post", r#"{"a":1}"#)?;
    println!("{body}");

    println!("\n=== Blocking form POST ===");
    let body = client.post_form_sync(
        "https://httpbin.org/post",
        [("name", Some("ferry")), ("comment", None)],
    )?;
    println!("{body}");

    println!("\n=== Asynchronous GET ===");
    let (tx, rx) = mpsc::channel();
    client.get_async("https://httpbin.org/uuid", move |result: Result<Response>| {
        let thread = std::thread::current().name().map(str::to_string);
        println!("callback on {thread:?}");
        let _ = tx.send(result.and_then(|response| response.text()));
    });
    match rx.recv() {
        Ok(Ok(text)) => println!("{text}"),
        Ok(Err(e)) => println!("request failed: {e}"),
        Err(_) => println!("callback was never delivered"),
    }

    println!("\n=== Cancelled call ===");
    let handle = client
        .get("https://httpbin.org/delay/5")
        .tag("slow")
        .enqueue(|_: Result<Response>| println!("never printed"));
    println!("cancelled {} call(s) tagged \"slow\"", client.cancel_tag("slow"));
    println!("state: {:?}", handle.state());

    Ok(())
}

//! Multipart upload with progress reporting

use ferry::{Client, Response, Result};
use std::sync::mpsc;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("ferry=debug".parse().unwrap()))
        .init();

    let path = std::env::temp_dir().join("ferry-upload.bin");
    std::fs::write(&path, vec![0u8; 256 * 1024])?;

    let client = Client::new()?;
    let (tx, rx) = mpsc::channel();

    client.upload_async(
        "https://httpbin.org/post",
        [("description", "upload demo")],
        &path,
        move |result: Result<Response>| {
            let _ = tx.send(result.map(|response| response.status()));
        },
        |written, total| match total {
            Some(total) => println!(
                "uploaded {written}/{total} bytes ({:.1}%)",
                written as f64 / total as f64 * 100.0
            ),
            None => println!("uploaded {written} bytes"),
        },
    );

    match rx.recv() {
        Ok(Ok(status)) => println!("upload finished with status {status}"),
        Ok(Err(e)) => println!("upload failed: {e}"),
        Err(_) => println!("callback was never delivered"),
    }

    std::fs::remove_file(&path)?;
    Ok(())
}
